//! Built-in `base` trait: device identity and local-surface policy.

use std::rc::{Rc, Weak};

use serde_json::{json, Value};
use tracing::warn;

use crate::command::{ErrorInfo, JsonObject, WeakCommand};
use crate::component::{ComponentManager, DomainError};
use crate::config::{AuthScope, Config, Settings};

const COMPONENT: &str = "base";

const TRAIT_DEFS: &str = r#"{
  "base": {
    "commands": {
      "updateBaseConfiguration": {
        "minimalRole": "manager",
        "parameters": {
          "localAnonymousAccessMaxRole": {
            "enum": [ "none", "viewer", "user" ],
            "type": "string"
          },
          "localDiscoveryEnabled": {
            "type": "boolean"
          },
          "localPairingEnabled": {
            "type": "boolean"
          }
        }
      },
      "updateDeviceInfo": {
        "minimalRole": "manager",
        "parameters": {
          "description": {
            "type": "string"
          },
          "location": {
            "type": "string"
          },
          "name": {
            "type": "string"
          }
        }
      }
    },
    "state": {
      "firmwareVersion": {
        "type": "string",
        "isRequired": true
      },
      "localDiscoveryEnabled": {
        "type": "boolean",
        "isRequired": true
      },
      "localAnonymousAccessMaxRole": {
        "type": "string",
        "isRequired": true
      },
      "localPairingEnabled": {
        "type": "boolean",
        "isRequired": true
      }
    }
  }
}"#;

/// Registers the `base` component and keeps its state mirroring the
/// committed settings, including out-of-band settings edits.
pub struct BaseApiHandler {
    shared: Rc<Shared>,
}

struct Shared {
    config: Rc<Config>,
    components: Rc<ComponentManager>,
}

impl BaseApiHandler {
    pub fn new(config: Rc<Config>, components: Rc<ComponentManager>) -> Self {
        components
            .load_traits_from_json(TRAIT_DEFS)
            .expect("built-in base trait definitions are valid");
        components
            .add_component("", COMPONENT, &["base"])
            .expect("base component registers once");

        let shared = Rc::new(Shared { config, components });

        let weak = Rc::downgrade(&shared);
        shared.components.add_command_handler(
            COMPONENT,
            "base.updateBaseConfiguration",
            Rc::new(move |command| Shared::update_base_configuration(&weak, command)),
        );
        let weak = Rc::downgrade(&shared);
        shared.components.add_command_handler(
            COMPONENT,
            "base.updateDeviceInfo",
            Rc::new(move |command| Shared::update_device_info(&weak, command)),
        );

        // Fires immediately, seeding the initial base state.
        let weak = Rc::downgrade(&shared);
        shared.config.add_on_changed(Rc::new(move |settings| {
            if let Some(shared) = weak.upgrade() {
                shared.mirror_settings(settings);
            }
        }));

        Self { shared }
    }
}

impl Shared {
    fn mirror_settings(&self, settings: &Settings) {
        let state = json!({
            "base": {
                "firmwareVersion": settings.firmware_version,
                "localDiscoveryEnabled": settings.local_discovery_enabled,
                "localAnonymousAccessMaxRole": settings.local_anonymous_access_role.as_str(),
                "localPairingEnabled": settings.local_pairing_enabled,
            }
        });
        let state = state.as_object().expect("literal object");
        if let Err(err) = self.components.set_state_properties(COMPONENT, state) {
            warn!(%err, "failed to mirror settings into base state");
        }
    }

    fn update_base_configuration(weak: &Weak<Shared>, command: WeakCommand) {
        let (Some(shared), Some(command)) = (weak.upgrade(), command.upgrade()) else {
            return;
        };
        if command.set_progress(&JsonObject::new()).is_err() {
            return;
        }
        let parameters = command.parameters();
        let settings = shared.config.settings();

        let discovery = match optional_bool(
            &parameters,
            "localDiscoveryEnabled",
            settings.local_discovery_enabled,
        ) {
            Ok(value) => value,
            Err(err) => return abort(&command, &err),
        };
        let pairing = match optional_bool(
            &parameters,
            "localPairingEnabled",
            settings.local_pairing_enabled,
        ) {
            Ok(value) => value,
            Err(err) => return abort(&command, &err),
        };
        let anonymous_role = match parameters.get("localAnonymousAccessMaxRole") {
            None => settings.local_anonymous_access_role,
            Some(Value::String(role)) => match AuthScope::parse(role) {
                Some(scope) if scope <= AuthScope::User => scope,
                _ => {
                    return abort(
                        &command,
                        &DomainError::invalid_prop_value(format!(
                            "invalid localAnonymousAccessMaxRole '{role}'"
                        )),
                    )
                }
            },
            Some(_) => {
                return abort(
                    &command,
                    &DomainError::type_mismatch(
                        "localAnonymousAccessMaxRole must be a string".to_string(),
                    ),
                )
            }
        };

        let mut tx = shared.config.edit();
        tx.set_local_discovery_enabled(discovery);
        tx.set_local_pairing_enabled(pairing);
        tx.set_local_anonymous_access_role(anonymous_role);
        tx.commit();

        complete(&command);
    }

    fn update_device_info(weak: &Weak<Shared>, command: WeakCommand) {
        let (Some(shared), Some(command)) = (weak.upgrade(), command.upgrade()) else {
            return;
        };
        if command.set_progress(&JsonObject::new()).is_err() {
            return;
        }
        let parameters = command.parameters();
        let settings = shared.config.settings();

        let name = match optional_string(&parameters, "name", &settings.name) {
            Ok(value) => value,
            Err(err) => return abort(&command, &err),
        };
        let description =
            match optional_string(&parameters, "description", &settings.description) {
                Ok(value) => value,
                Err(err) => return abort(&command, &err),
            };
        let location = match optional_string(&parameters, "location", &settings.location) {
            Ok(value) => value,
            Err(err) => return abort(&command, &err),
        };

        let mut tx = shared.config.edit();
        tx.set_name(name);
        tx.set_description(description);
        tx.set_location(location);
        tx.commit();

        complete(&command);
    }
}

fn optional_bool(
    parameters: &JsonObject,
    key: &str,
    current: bool,
) -> Result<bool, DomainError> {
    match parameters.get(key) {
        None => Ok(current),
        Some(Value::Bool(value)) => Ok(*value),
        Some(_) => Err(DomainError::type_mismatch(format!(
            "parameter '{key}' must be a boolean"
        ))),
    }
}

fn optional_string(
    parameters: &JsonObject,
    key: &str,
    current: &str,
) -> Result<String, DomainError> {
    match parameters.get(key) {
        None => Ok(current.to_string()),
        Some(Value::String(value)) => Ok(value.clone()),
        Some(_) => Err(DomainError::type_mismatch(format!(
            "parameter '{key}' must be a string"
        ))),
    }
}

fn abort(command: &crate::command::CommandRef, err: &DomainError) {
    if command.abort(Some(ErrorInfo::from(err))).is_err() {
        warn!(id = command.id(), "command not abortable");
    }
}

fn complete(command: &crate::command::CommandRef) {
    if command.complete(&JsonObject::new()).is_err() {
        warn!(id = command.id(), "command not completable");
    }
}
