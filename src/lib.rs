#![forbid(unsafe_code)]

//! Device-side fleet library: a typed component/trait/command model, a
//! cloud uplink with ticket-based registration, MAC-based local access
//! tokens with revocation, and WiFi bootstrapping. The host process
//! supplies all platform I/O through the [`provider`] traits; the core
//! is single-threaded and cooperative.

pub mod auth;
pub mod cloud;
pub mod command;
pub mod component;
pub mod config;
mod device;
mod discovery;
pub mod error;
pub mod provider;
pub mod wifi;

mod handlers;

pub use error::{Error, Transience};
pub type Result<T> = std::result::Result<T, Error>;

pub use crate::auth::{AccessRevocationManager, AuthError, AuthManager, RevocationEntry, UserInfo};
pub use crate::cloud::{CloudError, CloudOptions, GcdState};
pub use crate::command::{
    CommandEvent, CommandInstance, CommandRef, CommandState, ErrorInfo, JsonObject, Origin,
    WeakCommand,
};
pub use crate::component::{
    ComponentManager, ComponentStateChange, DomainError, StateSnapshot, UserRole,
};
pub use crate::config::{AuthScope, Config, RootClientTokenOwner, Settings};
pub use crate::device::{Device, DeviceOptions};
pub use crate::discovery::DiscoveryPublisher;
pub use crate::wifi::WifiBootstrapper;
