//! Local discovery: mDNS announcement of the privet surface.

use std::cell::Cell;
use std::rc::Rc;

use tracing::debug;

use crate::cloud::{Cloud, GcdState};
use crate::component::ComponentManager;
use crate::config::Config;
use crate::provider::DnsServiceDiscovery;

const SERVICE_TYPE: &str = "_privet._tcp";
const TXT_VERSION: &str = "3";

/// Keeps the `_privet._tcp` TXT record in sync with settings, loaded
/// traits, and cloud connection state.
pub struct DiscoveryPublisher {
    shared: Rc<Shared>,
}

impl DiscoveryPublisher {
    pub fn new(
        dns_sd: Rc<dyn DnsServiceDiscovery>,
        config: Rc<Config>,
        components: Rc<ComponentManager>,
        http_port: u16,
        has_wifi: bool,
    ) -> Self {
        Self {
            shared: Rc::new(Shared {
                dns_sd,
                config,
                components,
                http_port,
                has_wifi,
                gcd_state: Cell::new(GcdState::Unconfigured),
            }),
        }
    }

    /// Register for every input that changes the record; each
    /// registration fires immediately, publishing the initial record.
    pub fn start(&self, cloud: &Cloud) {
        let weak = Rc::downgrade(&self.shared);
        cloud.add_gcd_state_changed_callback(Rc::new(move |state| {
            if let Some(shared) = weak.upgrade() {
                shared.gcd_state.set(state);
                shared.publish();
            }
        }));

        let weak = Rc::downgrade(&self.shared);
        self.shared.config.add_on_changed(Rc::new(move |_| {
            if let Some(shared) = weak.upgrade() {
                shared.publish();
            }
        }));

        let weak = Rc::downgrade(&self.shared);
        self.shared
            .components
            .add_trait_changed_callback(Rc::new(move || {
                if let Some(shared) = weak.upgrade() {
                    shared.publish();
                }
            }));
    }

    pub fn publish(&self) {
        self.shared.publish();
    }
}

impl Drop for DiscoveryPublisher {
    fn drop(&mut self) {
        self.shared.dns_sd.stop_publishing(SERVICE_TYPE);
    }
}

struct Shared {
    dns_sd: Rc<dyn DnsServiceDiscovery>,
    config: Rc<Config>,
    components: Rc<ComponentManager>,
    http_port: u16,
    has_wifi: bool,
    gcd_state: Cell<GcdState>,
}

impl Shared {
    fn publish(&self) {
        let settings = self.config.settings();
        if !settings.local_access_enabled || !settings.local_discovery_enabled {
            self.dns_sd.stop_publishing(SERVICE_TYPE);
            return;
        }

        let services = self
            .components
            .traits()
            .as_object()
            .map(|traits| {
                traits
                    .keys()
                    .map(|name| {
                        if name.starts_with('_') {
                            name.clone()
                        } else {
                            format!("_{name}")
                        }
                    })
                    .collect::<Vec<_>>()
                    .join(",")
            })
            .unwrap_or_default();

        let mut txt = vec![
            format!("txtvers={TXT_VERSION}"),
            format!("ty={}", settings.name),
            format!("mmid={}", settings.model_id),
            format!("services={services}"),
            format!("id={}", settings.device_id),
            format!("flags={}", self.flags(&settings)),
        ];
        if settings.is_registered() {
            txt.push(format!("gcd_id={}", settings.cloud_id));
        }
        debug!(port = self.http_port, "publishing privet record");
        self.dns_sd.publish_service(SERVICE_TYPE, self.http_port, &txt);
    }

    fn flags(&self, settings: &crate::config::Settings) -> &'static str {
        if !self.has_wifi {
            // No radio to provision.
            "CB"
        } else if settings.is_registered() && self.gcd_state.get() == GcdState::Connected {
            "BB"
        } else {
            "DB"
        }
    }
}
