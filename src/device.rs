//! Device facade: wires the subsystems over the host's capabilities and
//! exposes the public control surface.

use std::rc::Rc;

use serde_json::Value;

use crate::auth::{AccessRevocationManager, AuthManager};
use crate::cloud::{Cloud, CloudOptions, GcdState, RegisterCallback};
use crate::command::{CommandCallback, CommandHandler, CommandRef, JsonObject, Origin};
use crate::component::{ComponentManager, UserRole};
use crate::config::{Config, Settings, SettingsChangedCallback};
use crate::discovery::DiscoveryPublisher;
use crate::handlers::{AccessApiHandler, BaseApiHandler};
use crate::provider::{
    Bluetooth, ConfigStore, DnsServiceDiscovery, HttpClient, HttpServer, Network, TaskRunner, Wifi,
};
use crate::wifi::WifiBootstrapper;
use crate::Result;

#[derive(Debug, Clone, Copy, Default)]
pub struct DeviceOptions {
    pub cloud: CloudOptions,
}

/// A device joined (or joinable) to the fleet.
///
/// Capabilities the host does not supply disable the matching surface:
/// no `HttpServer` means no local auth or revocation API, no `DnsSd`
/// means no discovery, no `Wifi` means no bootstrap AP.
pub struct Device {
    config: Rc<Config>,
    components: Rc<ComponentManager>,
    auth: Option<Rc<AuthManager>>,
    revocation: Option<Rc<AccessRevocationManager>>,
    cloud: Cloud,
    wifi: Option<WifiBootstrapper>,
    _discovery: Option<DiscoveryPublisher>,
    _base_api: BaseApiHandler,
    _access_api: Option<AccessApiHandler>,
}

impl Device {
    #[allow(clippy::too_many_arguments)]
    pub fn create(
        options: DeviceOptions,
        config_store: Rc<dyn ConfigStore>,
        task_runner: Rc<dyn TaskRunner>,
        http_client: Rc<dyn HttpClient>,
        network: Rc<dyn Network>,
        dns_sd: Option<Rc<dyn DnsServiceDiscovery>>,
        http_server: Option<Rc<dyn HttpServer>>,
        wifi: Option<Rc<dyn Wifi>>,
        bluetooth: Option<Rc<dyn Bluetooth>>,
    ) -> Device {
        assert!(
            http_server.is_some() || dns_sd.is_none(),
            "local discovery requires the http server"
        );
        let _ = bluetooth;

        let config = Rc::new(Config::new(Some(config_store.clone())));
        let components = Rc::new(ComponentManager::new(task_runner.clone()));

        let mut auth = None;
        let mut revocation = None;
        let mut access_api = None;
        if let Some(http_server) = &http_server {
            let revocation_manager = Rc::new(AccessRevocationManager::new(
                Some(config_store),
                task_runner.clock(),
            ));
            auth = Some(Rc::new(AuthManager::new(
                config.clone(),
                Some(revocation_manager.clone()),
                http_server.https_certificate_fingerprint(),
                task_runner.clock(),
            )));
            access_api = Some(AccessApiHandler::new(
                components.clone(),
                revocation_manager.clone(),
            ));
            revocation = Some(revocation_manager);
        }

        let base_api = BaseApiHandler::new(config.clone(), components.clone());

        let cloud = Cloud::new(
            config.clone(),
            components.clone(),
            task_runner.clone(),
            http_client,
            Some(network.clone()),
            options.cloud,
        );
        cloud.start();

        let discovery = match (&dns_sd, &http_server) {
            (Some(dns_sd), Some(http_server)) => {
                let publisher = DiscoveryPublisher::new(
                    dns_sd.clone(),
                    config.clone(),
                    components.clone(),
                    http_server.http_port(),
                    wifi.is_some(),
                );
                publisher.start(&cloud);
                Some(publisher)
            }
            _ => None,
        };

        let wifi = wifi.map(|wifi| {
            let bootstrapper =
                WifiBootstrapper::new(config.clone(), task_runner.clone(), network, wifi);
            bootstrapper.start();
            bootstrapper
        });

        Device {
            config,
            components,
            auth,
            revocation,
            cloud,
            wifi,
            _discovery: discovery,
            _base_api: base_api,
            _access_api: access_api,
        }
    }

    // ---- settings ----

    pub fn settings(&self) -> Settings {
        self.config.settings()
    }

    pub fn add_settings_changed_callback(&self, callback: SettingsChangedCallback) {
        self.config.add_on_changed(callback);
    }

    pub fn config(&self) -> &Rc<Config> {
        &self.config
    }

    // ---- component model ----

    pub fn component_manager(&self) -> &Rc<ComponentManager> {
        &self.components
    }

    pub fn add_trait_definitions_from_json(&self, json: &str) -> Result<()> {
        Ok(self.components.load_traits_from_json(json)?)
    }

    pub fn traits(&self) -> Value {
        self.components.traits()
    }

    pub fn components(&self) -> Value {
        self.components.components()
    }

    pub fn add_component(&self, name: &str, traits: &[&str]) -> Result<()> {
        Ok(self.components.add_component("", name, traits)?)
    }

    pub fn remove_component(&self, name: &str) -> Result<()> {
        Ok(self.components.remove_component("", name)?)
    }

    pub fn set_state_properties(&self, component: &str, properties: &JsonObject) -> Result<()> {
        Ok(self.components.set_state_properties(component, properties)?)
    }

    pub fn set_state_properties_from_json(&self, component: &str, json: &str) -> Result<()> {
        Ok(self.components.set_state_properties_from_json(component, json)?)
    }

    pub fn set_state_property(&self, component: &str, name: &str, value: Value) -> Result<()> {
        Ok(self.components.set_state_property(component, name, value)?)
    }

    pub fn get_state_property(&self, component: &str, name: &str) -> Result<Value> {
        Ok(self.components.get_state_property(component, name)?)
    }

    // ---- commands ----

    pub fn add_command_handler(&self, component: &str, command_name: &str, handler: CommandHandler) {
        self.components
            .add_command_handler(component, command_name, handler);
    }

    /// Queue a locally-originated command document; returns its id.
    pub fn add_command(&self, command: &Value) -> Result<String> {
        let instance = self
            .components
            .parse_command_instance(command, Origin::Local, UserRole::Owner)
            .map_err(|parse_error| parse_error.error)?;
        let id = instance.id().to_string();
        self.components.add_command(instance);
        Ok(id)
    }

    pub fn find_command(&self, id: &str) -> Option<CommandRef> {
        self.components.find_command(id)
    }

    pub fn add_command_added_callback(&self, callback: CommandCallback) {
        self.components.add_command_added_callback(callback);
    }

    pub fn add_command_removed_callback(&self, callback: CommandCallback) {
        self.components.add_command_removed_callback(callback);
    }

    pub fn add_state_changed_callback(&self, callback: Rc<dyn Fn()>) {
        self.components.add_state_changed_callback(callback);
    }

    // ---- cloud ----

    pub fn register(&self, ticket: &str, done: RegisterCallback) {
        self.cloud.register_device(ticket, done);
    }

    pub fn gcd_state(&self) -> GcdState {
        self.cloud.gcd_state()
    }

    pub fn add_gcd_state_changed_callback(&self, callback: Rc<dyn Fn(GcdState)>) {
        self.cloud.add_gcd_state_changed_callback(callback);
    }

    pub fn check_for_commands(&self) {
        self.cloud.check_for_commands();
    }

    // ---- local access ----

    pub fn auth_manager(&self) -> Option<&Rc<AuthManager>> {
        self.auth.as_ref()
    }

    pub fn revocation_manager(&self) -> Option<&Rc<AccessRevocationManager>> {
        self.revocation.as_ref()
    }

    pub fn wifi_bootstrapper(&self) -> Option<&WifiBootstrapper> {
        self.wifi.as_ref()
    }
}
