//! The persisted settings record.
//!
//! Factory defaults come from the host's `ConfigStore::load_defaults`;
//! the persisted blob is a partial overlay applied on top, so old blobs
//! keep working as fields are added.

use serde::{Deserialize, Serialize};

/// Authorization tier carried by access tokens and the anonymous-access
/// setting. Ordered; higher grants more.
///
/// Token wire codes are `none=0, viewer=1, user=2, owner=3`; there is no
/// manager tier at the token layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AuthScope {
    None,
    Viewer,
    User,
    Owner,
}

impl AuthScope {
    pub fn code(self) -> u8 {
        match self {
            AuthScope::None => 0,
            AuthScope::Viewer => 1,
            AuthScope::User => 2,
            AuthScope::Owner => 3,
        }
    }

    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            0 => Some(AuthScope::None),
            1 => Some(AuthScope::Viewer),
            2 => Some(AuthScope::User),
            3 => Some(AuthScope::Owner),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            AuthScope::None => "none",
            AuthScope::Viewer => "viewer",
            AuthScope::User => "user",
            AuthScope::Owner => "owner",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "none" => Some(AuthScope::None),
            "viewer" => Some(AuthScope::Viewer),
            "user" => Some(AuthScope::User),
            "owner" => Some(AuthScope::Owner),
            _ => None,
        }
    }
}

/// Who currently owns the root client token.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RootClientTokenOwner {
    None,
    Client,
    Cloud,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub device_id: String,
    pub name: String,
    pub description: String,
    pub location: String,

    // OEM identity and cloud credentials, normally factory defaults.
    pub oem_name: String,
    pub model_name: String,
    pub model_id: String,
    pub firmware_version: String,
    pub api_key: String,
    pub client_id: String,
    pub client_secret: String,
    pub service_url: String,
    pub oauth_url: String,

    // Cloud registration outcome.
    pub refresh_token: String,
    pub robot_account: String,
    pub cloud_id: String,

    // Local surface policy.
    pub local_discovery_enabled: bool,
    pub local_pairing_enabled: bool,
    pub local_access_enabled: bool,
    pub local_anonymous_access_role: AuthScope,

    pub last_configured_ssid: String,

    /// Auth secret, base64. Empty until the auth manager mints one.
    pub secret: String,
    pub root_client_token_owner: RootClientTokenOwner,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            device_id: String::new(),
            name: String::new(),
            description: String::new(),
            location: String::new(),
            oem_name: String::new(),
            model_name: String::new(),
            model_id: String::new(),
            firmware_version: String::new(),
            api_key: String::new(),
            client_id: String::new(),
            client_secret: String::new(),
            service_url: "https://www.googleapis.com/clouddevices/v1/".to_string(),
            oauth_url: "https://accounts.google.com/o/oauth2/".to_string(),
            refresh_token: String::new(),
            robot_account: String::new(),
            cloud_id: String::new(),
            local_discovery_enabled: true,
            local_pairing_enabled: true,
            local_access_enabled: true,
            local_anonymous_access_role: AuthScope::Viewer,
            last_configured_ssid: String::new(),
            secret: String::new(),
            root_client_token_owner: RootClientTokenOwner::None,
        }
    }
}

impl Settings {
    pub fn is_registered(&self) -> bool {
        !self.cloud_id.is_empty()
    }

    /// The subset that round-trips through the persisted blob. OEM
    /// credentials stay with the host defaults.
    pub fn to_persisted(&self) -> SettingsPatch {
        SettingsPatch {
            device_id: Some(self.device_id.clone()),
            name: Some(self.name.clone()),
            description: Some(self.description.clone()),
            location: Some(self.location.clone()),
            refresh_token: Some(self.refresh_token.clone()),
            robot_account: Some(self.robot_account.clone()),
            cloud_id: Some(self.cloud_id.clone()),
            local_discovery_enabled: Some(self.local_discovery_enabled),
            local_pairing_enabled: Some(self.local_pairing_enabled),
            local_access_enabled: Some(self.local_access_enabled),
            local_anonymous_access_role: Some(self.local_anonymous_access_role),
            last_configured_ssid: Some(self.last_configured_ssid.clone()),
            secret: Some(self.secret.clone()),
            root_client_token_owner: Some(self.root_client_token_owner),
        }
    }
}

/// Partial settings overlay, as stored on disk.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SettingsPatch {
    pub device_id: Option<String>,
    pub name: Option<String>,
    pub description: Option<String>,
    pub location: Option<String>,
    pub refresh_token: Option<String>,
    pub robot_account: Option<String>,
    pub cloud_id: Option<String>,
    pub local_discovery_enabled: Option<bool>,
    pub local_pairing_enabled: Option<bool>,
    pub local_access_enabled: Option<bool>,
    pub local_anonymous_access_role: Option<AuthScope>,
    pub last_configured_ssid: Option<String>,
    pub secret: Option<String>,
    pub root_client_token_owner: Option<RootClientTokenOwner>,
}

impl SettingsPatch {
    pub fn apply_to(&self, target: &mut Settings) {
        if let Some(device_id) = &self.device_id {
            target.device_id = device_id.clone();
        }
        if let Some(name) = &self.name {
            target.name = name.clone();
        }
        if let Some(description) = &self.description {
            target.description = description.clone();
        }
        if let Some(location) = &self.location {
            target.location = location.clone();
        }
        if let Some(refresh_token) = &self.refresh_token {
            target.refresh_token = refresh_token.clone();
        }
        if let Some(robot_account) = &self.robot_account {
            target.robot_account = robot_account.clone();
        }
        if let Some(cloud_id) = &self.cloud_id {
            target.cloud_id = cloud_id.clone();
        }
        if let Some(local_discovery_enabled) = self.local_discovery_enabled {
            target.local_discovery_enabled = local_discovery_enabled;
        }
        if let Some(local_pairing_enabled) = self.local_pairing_enabled {
            target.local_pairing_enabled = local_pairing_enabled;
        }
        if let Some(local_access_enabled) = self.local_access_enabled {
            target.local_access_enabled = local_access_enabled;
        }
        if let Some(role) = self.local_anonymous_access_role {
            target.local_anonymous_access_role = role;
        }
        if let Some(last_configured_ssid) = &self.last_configured_ssid {
            target.last_configured_ssid = last_configured_ssid.clone();
        }
        if let Some(secret) = &self.secret {
            target.secret = secret.clone();
        }
        if let Some(owner) = self.root_client_token_owner {
            target.root_client_token_owner = owner;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scope_codes_round_trip() {
        for scope in [
            AuthScope::None,
            AuthScope::Viewer,
            AuthScope::User,
            AuthScope::Owner,
        ] {
            assert_eq!(AuthScope::from_code(scope.code()), Some(scope));
            assert_eq!(AuthScope::parse(scope.as_str()), Some(scope));
        }
        assert_eq!(AuthScope::from_code(4), None);
    }

    #[test]
    fn scope_ordering_matches_grants() {
        assert!(AuthScope::None < AuthScope::Viewer);
        assert!(AuthScope::Viewer < AuthScope::User);
        assert!(AuthScope::User < AuthScope::Owner);
    }

    #[test]
    fn partial_blob_overlays_defaults() {
        let mut settings = Settings {
            name: "factory".to_string(),
            ..Settings::default()
        };
        let patch: SettingsPatch =
            serde_json::from_str(r#"{"last_configured_ssid": "TEST_ssid"}"#).unwrap();
        patch.apply_to(&mut settings);
        assert_eq!(settings.last_configured_ssid, "TEST_ssid");
        assert_eq!(settings.name, "factory");
        assert!(settings.local_discovery_enabled);
    }
}
