//! Account registry for upstream provider credentials
//!
//! One `Account` is one provider-side credential unit: its OAuth tokens,
//! provider-specific auxiliary fields, and the scheduling attributes the
//! pool reads at selection time. `AccountStore` is the persistence
//! contract consumed by the token manager and the selector; `JsonFileStore`
//! is the file-backed implementation used by the gateway binary and tests.

pub mod account;
pub mod error;
pub mod json;
pub mod store;

pub use account::{Account, now_millis};
pub use error::{Error, Result};
pub use json::JsonFileStore;
pub use store::AccountStore;
