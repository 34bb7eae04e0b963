//! Built-in `_accessRevocationList` trait: owner-scoped token
//! revocation over the command surface. Ids travel base64-encoded.

use std::rc::{Rc, Weak};

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use serde_json::{json, Value};
use tracing::warn;

use crate::auth::AccessRevocationManager;
use crate::command::{CommandRef, ErrorInfo, JsonObject, WeakCommand};
use crate::component::{ComponentManager, DomainError};

const COMPONENT: &str = "accessControl";

const TRAIT_DEFS: &str = r#"{
  "_accessRevocationList": {
    "commands": {
      "revoke": {
        "minimalRole": "owner",
        "parameters": {
          "userId": {
            "type": "string"
          },
          "applicationId": {
            "type": "string"
          },
          "expirationTime": {
            "type": "integer"
          }
        }
      },
      "list": {
        "minimalRole": "owner",
        "parameters": {},
        "results": {
          "revocationListEntries": {
            "type": "array",
            "items": {
              "type": "object",
              "properties": {
                "userId": {
                  "type": "string"
                },
                "applicationId": {
                  "type": "string"
                }
              },
              "additionalProperties": false
            }
          }
        }
      }
    },
    "state": {
      "capacity": {
        "type": "integer",
        "isRequired": true
      }
    }
  }
}"#;

pub struct AccessApiHandler {
    shared: Rc<Shared>,
}

struct Shared {
    components: Rc<ComponentManager>,
    revocation: Rc<AccessRevocationManager>,
}

impl AccessApiHandler {
    pub fn new(
        components: Rc<ComponentManager>,
        revocation: Rc<AccessRevocationManager>,
    ) -> Self {
        components
            .load_traits_from_json(TRAIT_DEFS)
            .expect("built-in revocation trait definitions are valid");
        components
            .add_component("", COMPONENT, &["_accessRevocationList"])
            .expect("accessControl component registers once");

        let shared = Rc::new(Shared {
            components,
            revocation,
        });
        shared.publish_capacity();

        let weak = Rc::downgrade(&shared);
        shared.components.add_command_handler(
            COMPONENT,
            "_accessRevocationList.revoke",
            Rc::new(move |command| Shared::revoke(&weak, command)),
        );
        let weak = Rc::downgrade(&shared);
        shared.components.add_command_handler(
            COMPONENT,
            "_accessRevocationList.list",
            Rc::new(move |command| Shared::list(&weak, command)),
        );

        Self { shared }
    }
}

impl Shared {
    fn publish_capacity(&self) {
        let state = json!({
            "_accessRevocationList": {"capacity": self.revocation.capacity()}
        });
        let state = state.as_object().expect("literal object");
        if let Err(err) = self.components.set_state_properties(COMPONENT, state) {
            warn!(%err, "failed to publish revocation capacity");
        }
    }

    fn revoke(weak: &Weak<Shared>, command: WeakCommand) {
        let (Some(shared), Some(command)) = (weak.upgrade(), command.upgrade()) else {
            return;
        };
        if command.set_progress(&JsonObject::new()).is_err() {
            return;
        }
        let parameters = command.parameters();

        let user_id = match decoded_id(&parameters, "userId") {
            Ok(id) => id,
            Err(err) => return abort(&command, &err),
        };
        let app_id = match decoded_id(&parameters, "applicationId") {
            Ok(id) => id,
            Err(err) => return abort(&command, &err),
        };
        let Some(expiration) = parameters.get("expirationTime").and_then(Value::as_u64) else {
            return abort(
                &command,
                &DomainError::invalid_prop_value("expiration time is missing".to_string()),
            );
        };

        shared.revocation.block(&user_id, &app_id, expiration);
        shared.publish_capacity();
        complete(&command, JsonObject::new());
    }

    fn list(weak: &Weak<Shared>, command: WeakCommand) {
        let (Some(shared), Some(command)) = (weak.upgrade(), command.upgrade()) else {
            return;
        };
        if command.set_progress(&JsonObject::new()).is_err() {
            return;
        }
        let entries: Vec<Value> = shared
            .revocation
            .entries()
            .iter()
            .map(|entry| {
                json!({
                    "userId": BASE64.encode(&entry.user_id),
                    "applicationId": BASE64.encode(&entry.app_id),
                })
            })
            .collect();
        let mut results = JsonObject::new();
        results.insert(
            "revocationListEntries".to_string(),
            Value::Array(entries),
        );
        complete(&command, results);
    }
}

fn decoded_id(parameters: &JsonObject, key: &str) -> Result<Vec<u8>, DomainError> {
    let raw = parameters.get(key).and_then(Value::as_str).unwrap_or("");
    BASE64.decode(raw.as_bytes()).map_err(|_| {
        DomainError::invalid_prop_value(format!("invalid {key} '{raw}'"))
    })
}

fn abort(command: &CommandRef, err: &DomainError) {
    if command.abort(Some(ErrorInfo::from(err))).is_err() {
        warn!(id = command.id(), "command not abortable");
    }
}

fn complete(command: &CommandRef, results: JsonObject) {
    if command.complete(&results).is_err() {
        warn!(id = command.id(), "command not completable");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::{CommandState, Origin};
    use crate::component::UserRole;
    use crate::provider::test::{FakeClock, FakeTaskRunner};

    struct Fixture {
        components: Rc<ComponentManager>,
        revocation: Rc<AccessRevocationManager>,
        _handler: AccessApiHandler,
    }

    fn fixture() -> Fixture {
        let runner = FakeTaskRunner::new();
        let revocation = Rc::new(AccessRevocationManager::new(
            None,
            FakeClock::at_unix(1_410_000_000),
        ));
        let components = Rc::new(ComponentManager::new(runner));
        let handler = AccessApiHandler::new(components.clone(), revocation.clone());
        Fixture {
            components,
            revocation,
            _handler: handler,
        }
    }

    impl Fixture {
        fn run_command(&self, json: &str) -> CommandRef {
            let value: Value = serde_json::from_str(json).unwrap();
            let instance = self
                .components
                .parse_command_instance(&value, Origin::Local, UserRole::Owner)
                .unwrap();
            let id = instance.id().to_string();
            self.components.add_command(instance);
            self.components.find_command(&id).unwrap()
        }
    }

    #[test]
    fn capacity_is_published_as_state() {
        let f = fixture();
        assert_eq!(
            f.components
                .get_state_property(COMPONENT, "_accessRevocationList.capacity")
                .unwrap(),
            json!(100)
        );
    }

    #[test]
    fn revoke_blocks_the_encoded_pair() {
        let f = fixture();
        let user = BASE64.encode(b"user7");
        let app = BASE64.encode(b"app9");
        let command = f.run_command(&format!(
            r#"{{
              "name": "_accessRevocationList.revoke",
              "parameters": {{
                "userId": "{user}",
                "applicationId": "{app}",
                "expirationTime": 1410000600
              }}
            }}"#
        ));
        assert_eq!(command.state(), CommandState::Done);
        assert!(f.revocation.is_blocked(b"user7", b"app9", 1_410_000_100));
    }

    #[test]
    fn revoke_requires_expiration_and_valid_base64() {
        let f = fixture();
        let command = f.run_command(
            r#"{
              "name": "_accessRevocationList.revoke",
              "parameters": {"userId": "AAA=", "applicationId": "AAA="}
            }"#,
        );
        assert_eq!(command.state(), CommandState::Aborted);
        assert_eq!(command.error().unwrap().code, "invalid_prop_value");

        let command = f.run_command(
            r#"{
              "name": "_accessRevocationList.revoke",
              "parameters": {"userId": "!!!", "applicationId": "", "expirationTime": 1}
            }"#,
        );
        assert_eq!(command.state(), CommandState::Aborted);
    }

    #[test]
    fn list_returns_live_entries() {
        let f = fixture();
        f.revocation.block(b"user7", b"app9", 1_410_000_600);
        let command = f.run_command(r#"{"name": "_accessRevocationList.list"}"#);
        assert_eq!(command.state(), CommandState::Done);
        let results = command.results();
        let entries = results["revocationListEntries"].as_array().unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0]["userId"], BASE64.encode(b"user7"));
        assert_eq!(entries[0]["applicationId"], BASE64.encode(b"app9"));
    }
}
