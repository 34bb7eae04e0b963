//! Built-in command handlers wired by the device facade.

mod access_api;
mod base_api;

pub use access_api::AccessApiHandler;
pub use base_api::BaseApiHandler;
