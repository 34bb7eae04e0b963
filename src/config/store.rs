//! Settings store with transactional mutation.
//!
//! Every write goes through a [`Transaction`]; commit persists the blob
//! first and then fires on-changed callbacks, so observers always see
//! durable state.

use std::cell::RefCell;
use std::rc::Rc;

use tracing::warn;

use crate::config::{AuthScope, RootClientTokenOwner, Settings};
use crate::provider::ConfigStore;

const SETTINGS_BLOB: &str = "settings";

pub type SettingsChangedCallback = Rc<dyn Fn(&Settings)>;

pub struct Config {
    store: Option<Rc<dyn ConfigStore>>,
    settings: RefCell<Settings>,
    callbacks: RefCell<Vec<SettingsChangedCallback>>,
}

impl Config {
    /// Load defaults from the host, overlay the persisted blob, and make
    /// sure the device has an id.
    pub fn new(store: Option<Rc<dyn ConfigStore>>) -> Self {
        let mut settings = Settings::default();
        if let Some(store) = &store {
            store.load_defaults(&mut settings);
            if let Some(blob) = store.load(SETTINGS_BLOB) {
                match serde_json::from_str::<crate::config::SettingsPatch>(&blob) {
                    Ok(patch) => patch.apply_to(&mut settings),
                    Err(err) => warn!(%err, "persisted settings blob unreadable, using defaults"),
                }
            }
        }
        let config = Self {
            store,
            settings: RefCell::new(settings),
            callbacks: RefCell::new(Vec::new()),
        };
        if config.settings.borrow().device_id.is_empty() {
            let mut tx = config.edit();
            tx.set_device_id(uuid::Uuid::new_v4().to_string());
            tx.commit();
        }
        config
    }

    /// Snapshot of current settings.
    pub fn settings(&self) -> Settings {
        self.settings.borrow().clone()
    }

    /// Read without cloning the whole record.
    pub fn with_settings<R>(&self, f: impl FnOnce(&Settings) -> R) -> R {
        f(&self.settings.borrow())
    }

    /// Register for committed changes; fires once immediately so the
    /// observer starts from current state.
    pub fn add_on_changed(&self, callback: SettingsChangedCallback) {
        self.callbacks.borrow_mut().push(callback.clone());
        callback(&self.settings.borrow().clone());
    }

    /// Begin a mutation. Dropping the transaction without `commit`
    /// discards it.
    pub fn edit(&self) -> Transaction<'_> {
        Transaction {
            config: self,
            settings: self.settings.borrow().clone(),
        }
    }

    fn commit(&self, settings: Settings) {
        *self.settings.borrow_mut() = settings.clone();
        if let Some(store) = &self.store {
            match serde_json::to_string(&settings.to_persisted()) {
                Ok(blob) => store.save(SETTINGS_BLOB, &blob),
                Err(err) => warn!(%err, "settings serialization failed, not persisted"),
            }
        }
        let callbacks: Vec<_> = self.callbacks.borrow().clone();
        for callback in callbacks {
            callback(&settings);
        }
    }
}

/// Pending settings mutation. Commit persists then notifies.
pub struct Transaction<'a> {
    config: &'a Config,
    settings: Settings,
}

impl Transaction<'_> {
    pub fn set_device_id(&mut self, value: impl Into<String>) -> &mut Self {
        self.settings.device_id = value.into();
        self
    }

    pub fn set_name(&mut self, value: impl Into<String>) -> &mut Self {
        self.settings.name = value.into();
        self
    }

    pub fn set_description(&mut self, value: impl Into<String>) -> &mut Self {
        self.settings.description = value.into();
        self
    }

    pub fn set_location(&mut self, value: impl Into<String>) -> &mut Self {
        self.settings.location = value.into();
        self
    }

    pub fn set_refresh_token(&mut self, value: impl Into<String>) -> &mut Self {
        self.settings.refresh_token = value.into();
        self
    }

    pub fn set_robot_account(&mut self, value: impl Into<String>) -> &mut Self {
        self.settings.robot_account = value.into();
        self
    }

    pub fn set_cloud_id(&mut self, value: impl Into<String>) -> &mut Self {
        self.settings.cloud_id = value.into();
        self
    }

    pub fn set_local_discovery_enabled(&mut self, value: bool) -> &mut Self {
        self.settings.local_discovery_enabled = value;
        self
    }

    pub fn set_local_pairing_enabled(&mut self, value: bool) -> &mut Self {
        self.settings.local_pairing_enabled = value;
        self
    }

    pub fn set_local_access_enabled(&mut self, value: bool) -> &mut Self {
        self.settings.local_access_enabled = value;
        self
    }

    pub fn set_local_anonymous_access_role(&mut self, value: AuthScope) -> &mut Self {
        self.settings.local_anonymous_access_role = value;
        self
    }

    pub fn set_last_configured_ssid(&mut self, value: impl Into<String>) -> &mut Self {
        self.settings.last_configured_ssid = value.into();
        self
    }

    pub fn set_secret(&mut self, base64: impl Into<String>) -> &mut Self {
        self.settings.secret = base64.into();
        self
    }

    pub fn set_root_client_token_owner(&mut self, value: RootClientTokenOwner) -> &mut Self {
        self.settings.root_client_token_owner = value;
        self
    }

    pub fn commit(self) {
        self.config.commit(self.settings);
    }
}

#[cfg(test)]
mod tests {
    use std::cell::RefCell;

    use super::*;
    use crate::provider::test::MemConfigStore;

    fn factory_defaults() -> Settings {
        Settings {
            device_id: "TEST_DEVICE_ID".to_string(),
            name: "TEST_NAME".to_string(),
            model_id: "ABCDE".to_string(),
            api_key: "TEST_API_KEY".to_string(),
            ..Settings::default()
        }
    }

    #[test]
    fn defaults_then_blob_overlay() {
        let store = MemConfigStore::with_defaults(factory_defaults());
        store.seed("settings", r#"{"name": "renamed", "cloud_id": "CLOUD_ID"}"#);
        let config = Config::new(Some(store));
        let settings = config.settings();
        assert_eq!(settings.name, "renamed");
        assert_eq!(settings.cloud_id, "CLOUD_ID");
        assert_eq!(settings.model_id, "ABCDE");
        assert!(settings.is_registered());
    }

    #[test]
    fn commit_persists_then_notifies() {
        let store = MemConfigStore::with_defaults(factory_defaults());
        let config = Config::new(Some(store.clone()));
        let seen = Rc::new(RefCell::new(Vec::new()));
        let sink = seen.clone();
        config.add_on_changed(Rc::new(move |settings: &Settings| {
            sink.borrow_mut().push(settings.name.clone());
        }));
        assert_eq!(seen.borrow().as_slice(), ["TEST_NAME"]);

        let mut tx = config.edit();
        tx.set_name("updated");
        tx.commit();
        assert_eq!(seen.borrow().as_slice(), ["TEST_NAME", "updated"]);

        let blob = store.saved("settings").unwrap();
        assert!(blob.contains("\"updated\""));
    }

    #[test]
    fn dropped_transaction_discards_changes() {
        let config = Config::new(None);
        {
            let mut tx = config.edit();
            tx.set_name("never");
        }
        assert_eq!(config.settings().name, "");
    }

    #[test]
    fn missing_device_id_is_generated_and_persisted() {
        let store = MemConfigStore::new();
        let config = Config::new(Some(store.clone()));
        let id = config.settings().device_id;
        assert!(!id.is_empty());
        assert!(store.saved("settings").unwrap().contains(&id));

        // A second load keeps the generated id.
        let config2 = Config::new(Some(store));
        assert_eq!(config2.settings().device_id, id);
    }
}
