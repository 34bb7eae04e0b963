//! Persisted, transactionally-updatable settings.

mod settings;
mod store;

pub use settings::{AuthScope, RootClientTokenOwner, Settings, SettingsPatch};
pub use store::{Config, SettingsChangedCallback, Transaction};
