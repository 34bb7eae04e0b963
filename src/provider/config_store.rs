//! Persistence supplied by the host: a flat name -> blob store.

use crate::config::Settings;

/// Blob store for persisted state.
///
/// The settings record is saved under `"settings"`, the revocation list
/// under `"revocation_list"`. The host decides where blobs live.
pub trait ConfigStore {
    /// Load the blob saved under `name`, if any.
    fn load(&self, name: &str) -> Option<String>;

    /// Persist `value` under `name`, replacing any previous blob.
    fn save(&self, name: &str, value: &str);

    /// Fill in factory defaults (OEM credentials, model ids, firmware
    /// version) before the persisted blob is overlaid.
    fn load_defaults(&self, _settings: &mut Settings) {}
}
