//! The component/trait/command model.
//!
//! Traits are named schema bundles; components form a tree, each node
//! declaring the traits it supports; commands route to components and
//! state mutations are journalled per component for cloud upload. The
//! schema itself is data: trait bodies and the component tree are plain
//! JSON trees, never static types.

mod error;
mod journal;
mod path;

use std::cell::{Cell, RefCell};
use std::collections::BTreeMap;
use std::rc::Rc;

use serde_json::{Map, Value};
use tracing::debug;

use crate::command::{
    CommandCallback, CommandHandler, CommandInstance, CommandQueue, CommandRef, JsonObject, Origin,
};
use crate::provider::{Clock, TaskRunner};

pub use error::DomainError;
pub use journal::{ComponentStateChange, StateChange, StateSnapshot, MAX_STATE_CHANGES};

use journal::StateChangeQueue;

/// Access tier used by command and state-property checks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum UserRole {
    Viewer,
    User,
    Manager,
    Owner,
}

impl UserRole {
    pub fn as_str(self) -> &'static str {
        match self {
            UserRole::Viewer => "viewer",
            UserRole::User => "user",
            UserRole::Manager => "manager",
            UserRole::Owner => "owner",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "viewer" => Some(UserRole::Viewer),
            "user" => Some(UserRole::User),
            "manager" => Some(UserRole::Manager),
            "owner" => Some(UserRole::Owner),
            _ => None,
        }
    }
}

/// Failure from [`ComponentManager::parse_command_instance`]. Carries the
/// command id found in the document (when any) so a cloud command that
/// failed validation can still be aborted upstream.
#[derive(Debug, Clone)]
pub struct CommandParseError {
    pub error: DomainError,
    pub command_id: Option<String>,
}

type VoidCallback = Rc<dyn Fn()>;
type UpdateIdCallback = Rc<dyn Fn(u64)>;

/// Registry of traits, tree of components, command router, and state
/// journal.
pub struct ComponentManager {
    clock: Rc<dyn Clock>,
    queue: CommandQueue,
    traits: RefCell<JsonObject>,
    components: RefCell<JsonObject>,
    journal: RefCell<BTreeMap<String, StateChangeQueue>>,
    next_command_id: Cell<u64>,
    last_update_id: Cell<u64>,
    on_trait_changed: RefCell<Vec<VoidCallback>>,
    on_tree_changed: RefCell<Vec<VoidCallback>>,
    on_state_changed: RefCell<Vec<VoidCallback>>,
    on_server_state_updated: RefCell<Vec<UpdateIdCallback>>,
}

impl ComponentManager {
    pub fn new(task_runner: Rc<dyn TaskRunner>) -> Self {
        Self {
            clock: task_runner.clock(),
            queue: CommandQueue::new(task_runner),
            traits: RefCell::new(JsonObject::new()),
            components: RefCell::new(JsonObject::new()),
            journal: RefCell::new(BTreeMap::new()),
            next_command_id: Cell::new(0),
            last_update_id: Cell::new(0),
            on_trait_changed: RefCell::new(Vec::new()),
            on_tree_changed: RefCell::new(Vec::new()),
            on_state_changed: RefCell::new(Vec::new()),
            on_server_state_updated: RefCell::new(Vec::new()),
        }
    }

    // ---- traits ----

    /// Merge trait definitions. Redefining an existing trait with a
    /// non-identical body fails, and nothing merges on failure.
    pub fn load_traits(&self, definitions: &Value) -> Result<(), DomainError> {
        let definitions = definitions
            .as_object()
            .ok_or_else(|| DomainError::ObjectExpected {
                context: "traits".to_string(),
            })?;
        {
            let traits = self.traits.borrow();
            for (name, body) in definitions {
                if !body.is_object() {
                    return Err(DomainError::type_mismatch(format!(
                        "trait '{name}' must be an object"
                    )));
                }
                if let Some(existing) = traits.get(name) {
                    if existing != body {
                        return Err(DomainError::type_mismatch(format!(
                            "trait '{name}' cannot be redefined"
                        )));
                    }
                }
            }
        }
        let mut modified = false;
        {
            let mut traits = self.traits.borrow_mut();
            for (name, body) in definitions {
                if !traits.contains_key(name) {
                    traits.insert(name.clone(), body.clone());
                    modified = true;
                }
            }
        }
        if modified {
            debug!(count = definitions.len(), "trait definitions loaded");
            self.fire(&self.on_trait_changed);
        }
        Ok(())
    }

    pub fn load_traits_from_json(&self, json: &str) -> Result<(), DomainError> {
        let value = serde_json::from_str::<Value>(json)
            .map_err(|err| DomainError::InvalidJson(err.to_string()))?;
        self.load_traits(&value)
    }

    pub fn traits(&self) -> Value {
        Value::Object(self.traits.borrow().clone())
    }

    pub fn find_trait(&self, name: &str) -> Option<Value> {
        self.traits.borrow().get(name).cloned()
    }

    pub fn find_command_definition(&self, command_name: &str) -> Option<Value> {
        let (trait_name, command) = split_two(command_name)?;
        self.traits
            .borrow()
            .get(trait_name)?
            .get("commands")?
            .get(command)
            .cloned()
    }

    pub fn find_state_definition(&self, property_name: &str) -> Option<Value> {
        let (trait_name, property) = split_two(property_name)?;
        self.traits
            .borrow()
            .get(trait_name)?
            .get("state")?
            .get(property)
            .cloned()
    }

    pub fn get_command_minimal_role(&self, command_name: &str) -> Result<UserRole, DomainError> {
        let definition = self.find_command_definition(command_name).ok_or_else(|| {
            DomainError::InvalidCommandName {
                name: command_name.to_string(),
            }
        })?;
        minimal_role_of(&definition, command_name)
    }

    pub fn get_state_minimal_role(&self, property_name: &str) -> Result<UserRole, DomainError> {
        let definition = self.find_state_definition(property_name).ok_or_else(|| {
            DomainError::invalid_state(format!(
                "state definition for '{property_name}' not found"
            ))
        })?;
        minimal_role_of(&definition, property_name)
    }

    pub fn add_trait_changed_callback(&self, callback: VoidCallback) {
        self.on_trait_changed.borrow_mut().push(callback.clone());
        callback();
    }

    // ---- components ----

    pub fn add_component(
        &self,
        parent_path: &str,
        name: &str,
        traits: &[&str],
    ) -> Result<(), DomainError> {
        self.check_traits_defined(traits)?;
        {
            let mut components = self.components.borrow_mut();
            let node = graft_node(&mut components, parent_path)?;
            if node.contains_key(name) {
                return Err(DomainError::invalid_state(format!(
                    "component '{name}' already exists at path '{parent_path}'"
                )));
            }
            node.insert(name.to_string(), new_component(traits));
        }
        debug!(parent = parent_path, name, "component added");
        self.fire(&self.on_tree_changed);
        Ok(())
    }

    pub fn add_component_array_item(
        &self,
        parent_path: &str,
        name: &str,
        traits: &[&str],
    ) -> Result<(), DomainError> {
        self.check_traits_defined(traits)?;
        {
            let mut components = self.components.borrow_mut();
            let node = graft_node(&mut components, parent_path)?;
            let entry = node
                .entry(name.to_string())
                .or_insert_with(|| Value::Array(Vec::new()));
            let items = entry.as_array_mut().ok_or_else(|| {
                DomainError::type_mismatch(format!(
                    "component '{name}' at path '{parent_path}' is not an array"
                ))
            })?;
            items.push(new_component(traits));
        }
        self.fire(&self.on_tree_changed);
        Ok(())
    }

    pub fn remove_component(&self, parent_path: &str, name: &str) -> Result<(), DomainError> {
        {
            let mut components = self.components.borrow_mut();
            let node = graft_node(&mut components, parent_path)?;
            if node.remove(name).is_none() {
                return Err(DomainError::invalid_state(format!(
                    "component '{name}' does not exist at path '{parent_path}'"
                )));
            }
        }
        self.fire(&self.on_tree_changed);
        Ok(())
    }

    pub fn remove_component_array_item(
        &self,
        parent_path: &str,
        name: &str,
        index: usize,
    ) -> Result<(), DomainError> {
        {
            let mut components = self.components.borrow_mut();
            let node = graft_node(&mut components, parent_path)?;
            let items = node
                .get_mut(name)
                .and_then(Value::as_array_mut)
                .ok_or_else(|| {
                    DomainError::invalid_state(format!(
                        "there is no component array named '{name}' at path '{parent_path}'"
                    ))
                })?;
            if index >= items.len() {
                return Err(DomainError::invalid_state(format!(
                    "component array '{name}' at path '{parent_path}' does not have an element {index}"
                )));
            }
            items.remove(index);
        }
        self.fire(&self.on_tree_changed);
        Ok(())
    }

    pub fn components(&self) -> Value {
        Value::Object(self.components.borrow().clone())
    }

    pub fn find_component(&self, component_path: &str) -> Result<Value, DomainError> {
        let components = self.components.borrow();
        path::find_component_at(&components, component_path)
            .map(|component| Value::Object(component.clone()))
    }

    /// First top-level component, in insertion order, declaring `trait_name`.
    pub fn find_component_with_trait(&self, trait_name: &str) -> Option<String> {
        let components = self.components.borrow();
        components
            .iter()
            .find(|(_, component)| declares_trait(component, trait_name))
            .map(|(name, _)| name.clone())
    }

    pub fn add_component_tree_changed_callback(&self, callback: VoidCallback) {
        self.on_tree_changed.borrow_mut().push(callback.clone());
        callback();
    }

    // ---- commands ----

    /// Validate, authorize, and route a command document. Allocates the
    /// next decimal id when the document carries none.
    pub fn parse_command_instance(
        &self,
        value: &Value,
        origin: Origin,
        role: UserRole,
    ) -> Result<CommandInstance, CommandParseError> {
        let mut instance = CommandInstance::from_json(value, origin)
            .map_err(|(error, command_id)| CommandParseError { error, command_id })?;
        let supplied_id =
            (!instance.id().is_empty()).then(|| instance.id().to_string());
        let fail = |error: DomainError| CommandParseError {
            error,
            command_id: supplied_id.clone(),
        };

        let minimal_role = self
            .get_command_minimal_role(instance.name())
            .map_err(&fail)?;
        if role < minimal_role {
            return Err(fail(DomainError::AccessDenied {
                role: role.as_str().to_string(),
                required: minimal_role.as_str().to_string(),
            }));
        }

        if instance.component().is_empty() {
            let trait_name = instance.trait_name().to_string();
            let component_path =
                self.find_component_with_trait(&trait_name)
                    .ok_or_else(|| {
                        fail(DomainError::UnroutedCommand {
                            name: instance.name().to_string(),
                            trait_name: trait_name.clone(),
                        })
                    })?;
            instance.set_component(component_path);
        }

        let component = self.find_component(instance.component()).map_err(&fail)?;
        if !declares_trait(&component, instance.trait_name()) {
            return Err(fail(DomainError::TraitNotSupported {
                component: instance.component().to_string(),
                trait_name: instance.trait_name().to_string(),
            }));
        }

        if instance.id().is_empty() {
            let id = self.next_command_id.get() + 1;
            self.next_command_id.set(id);
            instance.set_id(id.to_string());
        }
        Ok(instance)
    }

    pub fn add_command(&self, instance: CommandInstance) -> CommandRef {
        self.queue.add(instance)
    }

    pub fn find_command(&self, id: &str) -> Option<CommandRef> {
        self.queue.find(id)
    }

    /// Register a command handler. Non-default registrations must name a
    /// defined command; registering for an unknown command is a
    /// programmer error.
    pub fn add_command_handler(&self, component: &str, command_name: &str, handler: CommandHandler) {
        if !component.is_empty() || !command_name.is_empty() {
            assert!(
                self.find_command_definition(command_name).is_some(),
                "command undefined: {command_name}"
            );
        }
        self.queue.add_handler(component, command_name, handler);
    }

    pub fn add_command_added_callback(&self, callback: CommandCallback) {
        self.queue.add_on_added(callback);
    }

    pub fn add_command_removed_callback(&self, callback: CommandCallback) {
        self.queue.add_on_removed(callback);
    }

    // ---- state ----

    /// Merge `{trait: {property: value}}` dictionaries into a
    /// component's state, journal the change, and bump the update id.
    pub fn set_state_properties(
        &self,
        component_path: &str,
        properties: &JsonObject,
    ) -> Result<(), DomainError> {
        {
            let mut components = self.components.borrow_mut();
            let component = path::find_component_at_mut(&mut components, component_path)?;
            for (trait_name, value) in properties {
                if !value.is_object() {
                    return Err(DomainError::ObjectExpected {
                        context: format!("state.{trait_name}"),
                    });
                }
                if !declares_trait_obj(component, trait_name) {
                    return Err(DomainError::invalid_prop_value(format!(
                        "trait '{trait_name}' is not declared by component '{component_path}'"
                    )));
                }
            }
            let state = component
                .entry("state".to_string())
                .or_insert_with(|| Value::Object(JsonObject::new()));
            let state = state.as_object_mut().ok_or_else(|| {
                DomainError::type_mismatch(format!(
                    "state of component '{component_path}' is not an object"
                ))
            })?;
            merge_objects(state, properties);
        }
        self.last_update_id.set(self.last_update_id.get() + 1);
        self.journal
            .borrow_mut()
            .entry(component_path.to_string())
            .or_default()
            .record(self.clock.now(), properties.clone());
        self.fire(&self.on_state_changed);
        Ok(())
    }

    pub fn set_state_properties_from_json(
        &self,
        component_path: &str,
        json: &str,
    ) -> Result<(), DomainError> {
        let value = serde_json::from_str::<Value>(json)
            .map_err(|err| DomainError::InvalidJson(err.to_string()))?;
        let properties = value.as_object().ok_or_else(|| DomainError::ObjectExpected {
            context: "state".to_string(),
        })?;
        self.set_state_properties(component_path, properties)
    }

    /// Set a single `trait.property` value.
    pub fn set_state_property(
        &self,
        component_path: &str,
        name: &str,
        value: Value,
    ) -> Result<(), DomainError> {
        let (trait_name, property) = split_state_property(name)?;
        let mut inner = JsonObject::new();
        inner.insert(property.to_string(), value);
        let mut properties = JsonObject::new();
        properties.insert(trait_name.to_string(), Value::Object(inner));
        self.set_state_properties(component_path, &properties)
    }

    pub fn get_state_property(
        &self,
        component_path: &str,
        name: &str,
    ) -> Result<Value, DomainError> {
        let (trait_name, property) = split_state_property(name)?;
        let components = self.components.borrow();
        let component = path::find_component_at(&components, component_path)?;
        component
            .get("state")
            .and_then(|state| state.get(trait_name))
            .and_then(|trait_state| trait_state.get(property))
            .cloned()
            .ok_or_else(|| {
                DomainError::property_missing(format!(
                    "state property '{name}' not found in component '{component_path}'"
                ))
            })
    }

    /// Deep copy of the tree with state properties above `role` removed.
    /// Properties without a declared `minimalRole` default to `user`.
    /// Emptied `state` subtrees are pruned.
    pub fn get_components_for_user_role(&self, role: UserRole) -> Value {
        let mut copy = self.components.borrow().clone();
        for component in copy.values_mut() {
            if let Some(object) = component.as_object_mut() {
                self.filter_component(object, role);
            }
        }
        Value::Object(copy)
    }

    pub fn add_state_changed_callback(&self, callback: VoidCallback) {
        self.on_state_changed.borrow_mut().push(callback.clone());
        // Fire immediately so the observer reads current state.
        callback();
    }

    pub fn last_update_id(&self) -> u64 {
        self.last_update_id.get()
    }

    /// Drain the journal: all changes since the last drain, sorted by
    /// timestamp, plus the update id to acknowledge.
    pub fn get_and_clear_recorded_state_changes(&self) -> StateSnapshot {
        let mut state_changes = Vec::new();
        for (component, queue) in self.journal.borrow_mut().iter_mut() {
            for change in queue.drain() {
                state_changes.push(ComponentStateChange {
                    timestamp: change.timestamp,
                    component: component.clone(),
                    changed_properties: change.changed_properties,
                });
            }
        }
        self.journal.borrow_mut().clear();
        state_changes.sort_by_key(|change| change.timestamp);
        StateSnapshot {
            update_id: self.last_update_id.get(),
            state_changes,
        }
    }

    /// The server has acknowledged everything up to `update_id`.
    pub fn notify_state_updated_on_server(&self, update_id: u64) {
        let callbacks: Vec<_> = self.on_server_state_updated.borrow().clone();
        for callback in callbacks {
            callback(update_id);
        }
    }

    pub fn add_server_state_updated_callback(&self, callback: UpdateIdCallback) {
        if self.journal.borrow().is_empty() {
            callback(self.last_update_id.get());
        }
        self.on_server_state_updated.borrow_mut().push(callback);
    }

    // ---- internals ----

    fn check_traits_defined(&self, traits: &[&str]) -> Result<(), DomainError> {
        let registry = self.traits.borrow();
        for trait_name in traits {
            if !registry.contains_key(*trait_name) {
                return Err(DomainError::invalid_prop_value(format!(
                    "trait '{trait_name}' is undefined"
                )));
            }
        }
        Ok(())
    }

    fn filter_component(&self, component: &mut JsonObject, role: UserRole) {
        if let Some(state) = component.get_mut("state").and_then(Value::as_object_mut) {
            for (trait_name, trait_state) in state.iter_mut() {
                let Some(props) = trait_state.as_object_mut() else {
                    continue;
                };
                let hidden: Vec<String> = props
                    .keys()
                    .filter(|prop| {
                        matches!(
                            self.get_state_minimal_role(&format!("{trait_name}.{prop}")),
                            Ok(minimal) if minimal > role
                        )
                    })
                    .cloned()
                    .collect();
                for prop in hidden {
                    props.remove(&prop);
                }
            }
            let empty: Vec<String> = state
                .iter()
                .filter(|(_, v)| v.as_object().map(Map::is_empty).unwrap_or(false))
                .map(|(k, _)| k.clone())
                .collect();
            for key in empty {
                state.remove(&key);
            }
        }
        if component
            .get("state")
            .and_then(Value::as_object)
            .map(Map::is_empty)
            .unwrap_or(false)
        {
            component.remove("state");
        }

        if let Some(children) = component.get_mut("components").and_then(Value::as_object_mut) {
            for child in children.values_mut() {
                match child {
                    Value::Object(object) => self.filter_component(object, role),
                    Value::Array(items) => {
                        for item in items {
                            if let Some(object) = item.as_object_mut() {
                                self.filter_component(object, role);
                            }
                        }
                    }
                    _ => {}
                }
            }
        }
    }

    fn fire(&self, callbacks: &RefCell<Vec<VoidCallback>>) {
        let snapshot: Vec<_> = callbacks.borrow().clone();
        for callback in snapshot {
            callback();
        }
    }
}

fn new_component(traits: &[&str]) -> Value {
    let list: Vec<Value> = traits
        .iter()
        .map(|name| Value::String(name.to_string()))
        .collect();
    let mut component = JsonObject::new();
    component.insert("traits".to_string(), Value::Array(list));
    Value::Object(component)
}

fn graft_node<'a>(
    components: &'a mut JsonObject,
    parent_path: &str,
) -> Result<&'a mut JsonObject, DomainError> {
    if parent_path.is_empty() {
        return Ok(components);
    }
    let component = path::find_component_at_mut(components, parent_path)?;
    let children = component
        .entry("components".to_string())
        .or_insert_with(|| Value::Object(JsonObject::new()));
    children.as_object_mut().ok_or_else(|| {
        DomainError::type_mismatch(format!(
            "children of component '{parent_path}' are not an object"
        ))
    })
}

fn declares_trait(component: &Value, trait_name: &str) -> bool {
    component
        .get("traits")
        .and_then(Value::as_array)
        .map(|traits| traits.iter().any(|t| t.as_str() == Some(trait_name)))
        .unwrap_or(false)
}

fn declares_trait_obj(component: &JsonObject, trait_name: &str) -> bool {
    component
        .get("traits")
        .and_then(Value::as_array)
        .map(|traits| traits.iter().any(|t| t.as_str() == Some(trait_name)))
        .unwrap_or(false)
}

fn minimal_role_of(definition: &Value, name: &str) -> Result<UserRole, DomainError> {
    match definition.get("minimalRole") {
        None => Ok(UserRole::User),
        Some(Value::String(role)) => UserRole::parse(role).ok_or_else(|| {
            DomainError::invalid_prop_value(format!(
                "invalid minimalRole '{role}' in definition of '{name}'"
            ))
        }),
        Some(_) => Err(DomainError::type_mismatch(format!(
            "minimalRole of '{name}' must be a string"
        ))),
    }
}

fn split_two(name: &str) -> Option<(&str, &str)> {
    let (first, second) = name.split_once('.')?;
    // Exactly two segments; deeper paths are not definitions.
    if first.is_empty() || second.is_empty() || second.contains('.') {
        return None;
    }
    Some((first, second))
}

fn split_state_property(name: &str) -> Result<(&str, &str), DomainError> {
    let (trait_name, property) = name.split_once('.').unwrap_or((name, ""));
    if trait_name.is_empty() {
        return Err(DomainError::property_missing(format!(
            "empty state package in '{name}'"
        )));
    }
    if property.is_empty() {
        return Err(DomainError::property_missing(format!(
            "state property name not specified in '{name}'"
        )));
    }
    Ok((trait_name, property))
}

fn merge_objects(dest: &mut JsonObject, src: &JsonObject) {
    for (key, value) in src {
        match (dest.get_mut(key), value) {
            (Some(Value::Object(dest_child)), Value::Object(src_child)) => {
                merge_objects(dest_child, src_child)
            }
            _ => {
                dest.insert(key.clone(), value.clone());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::cell::Cell;

    use serde_json::json;

    use super::*;
    use crate::provider::test::FakeTaskRunner;

    fn manager() -> ComponentManager {
        ComponentManager::new(FakeTaskRunner::new())
    }

    fn load_basic_traits(manager: &ComponentManager) {
        manager
            .load_traits(&json!({
                "onOff": {
                    "commands": {"setConfig": {"minimalRole": "user", "parameters": {}}},
                    "state": {"state": {"type": "string"}}
                },
                "power": {
                    "commands": {"reboot": {"minimalRole": "manager"}},
                    "state": {
                        "battery_level": {"type": "integer", "minimalRole": "manager"},
                        "charging": {"type": "boolean"}
                    }
                }
            }))
            .unwrap();
    }

    #[test]
    fn identical_trait_reload_succeeds() {
        let manager = manager();
        load_basic_traits(&manager);
        load_basic_traits(&manager);
    }

    #[test]
    fn conflicting_trait_reload_fails_without_partial_merge() {
        let manager = manager();
        load_basic_traits(&manager);
        let err = manager
            .load_traits(&json!({
                "lock": {"commands": {}},
                "onOff": {"commands": {}}
            }))
            .unwrap_err();
        assert_eq!(err.code(), "type_mismatch");
        // The valid new trait in the same batch must not have merged.
        assert!(manager.find_trait("lock").is_none());
    }

    #[test]
    fn component_requires_known_traits_and_unique_name() {
        let manager = manager();
        load_basic_traits(&manager);
        assert_eq!(
            manager
                .add_component("", "lamp", &["nope"])
                .unwrap_err()
                .code(),
            "invalid_prop_value"
        );
        manager.add_component("", "lamp", &["onOff"]).unwrap();
        assert_eq!(
            manager
                .add_component("", "lamp", &["onOff"])
                .unwrap_err()
                .code(),
            "invalid_state"
        );
    }

    #[test]
    fn nested_and_array_components() {
        let manager = manager();
        load_basic_traits(&manager);
        manager.add_component("", "lamp", &["onOff"]).unwrap();
        manager
            .add_component_array_item("lamp", "bulbs", &["power"])
            .unwrap();
        manager
            .add_component_array_item("lamp", "bulbs", &["power"])
            .unwrap();
        assert!(manager.find_component("lamp.bulbs[1]").is_ok());
        manager.remove_component_array_item("lamp", "bulbs", 0).unwrap();
        assert!(manager.find_component("lamp.bulbs[1]").is_err());
        manager.remove_component("", "lamp").unwrap();
        assert!(manager.find_component("lamp").is_err());
    }

    #[test]
    fn command_routes_to_first_component_with_trait() {
        let manager = manager();
        manager
            .load_traits(&json!({
                "a": {"commands": {"x": {"minimalRole": "user"}}},
                "b": {"commands": {"x": {"minimalRole": "user"}}}
            }))
            .unwrap();
        manager.add_component("", "c1", &["a"]).unwrap();
        manager.add_component("", "c2", &["b"]).unwrap();

        let command = manager
            .parse_command_instance(&json!({"name": "a.x"}), Origin::Local, UserRole::Owner)
            .unwrap();
        assert_eq!(command.component(), "c1");
        assert_eq!(command.id(), "1");

        let command = manager
            .parse_command_instance(&json!({"name": "b.x"}), Origin::Local, UserRole::Owner)
            .unwrap();
        assert_eq!(command.component(), "c2");
        assert_eq!(command.id(), "2");

        let err = manager
            .parse_command_instance(&json!({"name": "x.y"}), Origin::Local, UserRole::Owner)
            .unwrap_err();
        assert_eq!(err.error.code(), "invalid_command_name");

        manager
            .load_traits(&json!({"x": {"commands": {"y": {}}}}))
            .unwrap();
        let err = manager
            .parse_command_instance(&json!({"name": "x.y"}), Origin::Local, UserRole::Owner)
            .unwrap_err();
        assert_eq!(err.error.code(), "unrouted_command");
    }

    #[test]
    fn parse_checks_minimal_role() {
        let manager = manager();
        load_basic_traits(&manager);
        manager.add_component("", "battery", &["power"]).unwrap();
        let err = manager
            .parse_command_instance(
                &json!({"name": "power.reboot"}),
                Origin::Local,
                UserRole::User,
            )
            .unwrap_err();
        assert_eq!(err.error.code(), "access_denied");
        assert!(manager
            .parse_command_instance(
                &json!({"name": "power.reboot"}),
                Origin::Local,
                UserRole::Manager,
            )
            .is_ok());
    }

    #[test]
    fn parse_keeps_supplied_id_on_failure() {
        let manager = manager();
        let err = manager
            .parse_command_instance(
                &json!({"id": "77", "name": "ghost.cmd"}),
                Origin::Cloud,
                UserRole::Owner,
            )
            .unwrap_err();
        assert_eq!(err.command_id.as_deref(), Some("77"));
    }

    #[test]
    fn parse_rejects_component_without_trait() {
        let manager = manager();
        load_basic_traits(&manager);
        manager.add_component("", "lamp", &["onOff"]).unwrap();
        let err = manager
            .parse_command_instance(
                &json!({"name": "power.reboot", "component": "lamp"}),
                Origin::Local,
                UserRole::Owner,
            )
            .unwrap_err();
        assert_eq!(err.error.code(), "trait_not_supported");
    }

    #[test]
    fn state_updates_journal_and_update_id() {
        let manager = manager();
        load_basic_traits(&manager);
        manager.add_component("", "battery", &["power"]).unwrap();

        assert_eq!(manager.last_update_id(), 0);
        manager
            .set_state_property("battery", "power.battery_level", json!(44))
            .unwrap();
        manager
            .set_state_property("battery", "power.charging", json!(true))
            .unwrap();
        assert_eq!(manager.last_update_id(), 2);

        let snapshot = manager.get_and_clear_recorded_state_changes();
        assert_eq!(snapshot.update_id, 2);
        assert_eq!(snapshot.state_changes.len(), 2);
        assert_eq!(snapshot.state_changes[0].component, "battery");
        assert_eq!(
            snapshot.state_changes[0].changed_properties["power"]["battery_level"],
            44
        );

        // Drained: the next snapshot is empty.
        assert!(manager
            .get_and_clear_recorded_state_changes()
            .state_changes
            .is_empty());

        assert_eq!(
            manager
                .get_state_property("battery", "power.battery_level")
                .unwrap(),
            json!(44)
        );
    }

    #[test]
    fn state_rejects_undeclared_trait() {
        let manager = manager();
        load_basic_traits(&manager);
        manager.add_component("", "lamp", &["onOff"]).unwrap();
        let err = manager
            .set_state_property("lamp", "power.battery_level", json!(1))
            .unwrap_err();
        assert_eq!(err.code(), "invalid_prop_value");
    }

    #[test]
    fn state_property_name_errors() {
        let manager = manager();
        load_basic_traits(&manager);
        manager.add_component("", "battery", &["power"]).unwrap();
        assert_eq!(
            manager
                .get_state_property("battery", ".level")
                .unwrap_err()
                .code(),
            "property_missing"
        );
        assert_eq!(
            manager
                .get_state_property("battery", "power")
                .unwrap_err()
                .code(),
            "property_missing"
        );
        assert_eq!(
            manager
                .get_state_property("battery", "power.unset")
                .unwrap_err()
                .code(),
            "property_missing"
        );
    }

    #[test]
    fn role_filter_hides_privileged_properties() {
        let manager = manager();
        load_basic_traits(&manager);
        manager.add_component("", "battery", &["power"]).unwrap();
        manager
            .set_state_properties(
                "battery",
                json!({"power": {"battery_level": 44, "charging": false}})
                    .as_object()
                    .unwrap(),
            )
            .unwrap();

        let for_user = manager.get_components_for_user_role(UserRole::User);
        let power = &for_user["battery"]["state"]["power"];
        assert!(power.get("battery_level").is_none());
        assert_eq!(power["charging"], false);

        let for_manager = manager.get_components_for_user_role(UserRole::Manager);
        assert_eq!(
            for_manager["battery"]["state"]["power"]["battery_level"],
            44
        );
    }

    #[test]
    fn role_filter_prunes_emptied_state() {
        let manager = manager();
        manager
            .load_traits(&json!({
                "secrets": {"state": {"key": {"type": "string", "minimalRole": "owner"}}}
            }))
            .unwrap();
        manager.add_component("", "vault", &["secrets"]).unwrap();
        manager
            .set_state_property("vault", "secrets.key", json!("s3cr3t"))
            .unwrap();
        let filtered = manager.get_components_for_user_role(UserRole::Viewer);
        assert!(filtered["vault"].get("state").is_none());
    }

    #[test]
    fn server_state_callback_fires_immediately_when_journal_empty() {
        let manager = manager();
        let seen = Rc::new(Cell::new(None));
        let sink = seen.clone();
        manager.add_server_state_updated_callback(Rc::new(move |id| sink.set(Some(id))));
        assert_eq!(seen.get(), Some(0));

        manager.notify_state_updated_on_server(9);
        assert_eq!(seen.get(), Some(9));
    }
}
