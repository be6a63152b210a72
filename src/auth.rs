//! Credential identifiers, bearer-token pairs, and the refreshing token store.

pub mod id;
pub mod refresh;
pub mod token;

pub use id::*;
pub use refresh::*;
pub use token::*;
