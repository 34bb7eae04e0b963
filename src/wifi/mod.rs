//! WiFi bootstrap controller.
//!
//! Toggles the device between station mode and a soft-AP provisioning
//! mode based on observed connectivity: a device that cannot reach the
//! network eventually opens an AP so a client can hand it credentials,
//! then periodically drops the AP to retry station mode.
//!
//! Deferred transitions carry the generation current at scheduling time
//! and self-cancel when connectivity has moved on since.

use std::cell::Cell;
use std::rc::Rc;
use std::time::Duration;

use tracing::{info, warn};

use crate::config::Config;
use crate::provider::{ConnectionState, Network, TaskRunner, Wifi};

/// How long to stay in station mode after going offline before opening
/// the provisioning AP.
pub const WAIT_RECONNECT: Duration = Duration::from_secs(60);
/// How long the provisioning AP stays up before retrying station mode.
pub const AP_WINDOW: Duration = Duration::from_secs(300);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BootstrapState {
    /// Online, watching for drops.
    Monitoring,
    /// Offline, giving station mode a chance to reconnect.
    Waiting,
    /// Soft-AP up, accepting provisioning.
    Bootstrapping,
}

pub struct WifiBootstrapper {
    shared: Rc<Shared>,
}

impl WifiBootstrapper {
    pub fn new(
        config: Rc<Config>,
        task_runner: Rc<dyn TaskRunner>,
        network: Rc<dyn Network>,
        wifi: Rc<dyn Wifi>,
    ) -> Self {
        Self {
            shared: Rc::new(Shared {
                config,
                task_runner,
                network,
                wifi,
                state: Cell::new(BootstrapState::Monitoring),
                generation: Cell::new(0),
            }),
        }
    }

    /// Observe connectivity and pick the initial mode: a device that
    /// starts offline with no provisioned SSID has nothing to retry, so
    /// the AP opens immediately; with a prior SSID station mode gets
    /// [`WAIT_RECONNECT`] first.
    pub fn start(&self) {
        let shared = &self.shared;
        let weak = Rc::downgrade(shared);
        shared
            .network
            .add_connection_changed_callback(Rc::new(move || {
                if let Some(shared) = weak.upgrade() {
                    shared.on_connectivity_changed();
                }
            }));

        if shared.network.connection_state() == ConnectionState::Connected {
            shared.state.set(BootstrapState::Monitoring);
        } else if shared.config.with_settings(|s| s.last_configured_ssid.is_empty()) {
            shared.start_access_point();
        } else {
            shared.begin_wait();
        }
    }

    /// Join `ssid` in station mode on behalf of a provisioning client.
    /// On success the SSID is committed as the last configured network.
    pub fn connect(&self, ssid: &str, passphrase: &str) {
        let shared = &self.shared;
        if shared.state.get() == BootstrapState::Bootstrapping {
            shared.wifi.stop_access_point();
            shared.state.set(BootstrapState::Waiting);
        }
        shared.bump_generation();
        let weak = Rc::downgrade(shared);
        let ssid_owned = ssid.to_string();
        info!(ssid, "connecting to wifi network");
        shared.wifi.connect(
            ssid,
            passphrase,
            Box::new(move |result| {
                let Some(shared) = weak.upgrade() else {
                    return;
                };
                match result {
                    Ok(()) => {
                        let mut tx = shared.config.edit();
                        tx.set_last_configured_ssid(ssid_owned.clone());
                        tx.commit();
                        info!(ssid = %ssid_owned, "wifi network configured");
                    }
                    Err(message) => {
                        warn!(ssid = %ssid_owned, %message, "wifi connect failed");
                        if shared.network.connection_state() != ConnectionState::Connected {
                            shared.start_access_point();
                        }
                    }
                }
            }),
        );
    }

    /// True while the provisioning AP is up.
    pub fn in_bootstrap_mode(&self) -> bool {
        self.shared.state.get() == BootstrapState::Bootstrapping
    }
}

struct Shared {
    config: Rc<Config>,
    task_runner: Rc<dyn TaskRunner>,
    network: Rc<dyn Network>,
    wifi: Rc<dyn Wifi>,
    state: Cell<BootstrapState>,
    generation: Cell<u64>,
}

impl Shared {
    fn bump_generation(&self) {
        self.generation.set(self.generation.get() + 1);
    }

    fn ap_ssid(&self) -> String {
        self.config.with_settings(|settings| {
            let suffix: String = settings
                .device_id
                .chars()
                .filter(|c| c.is_ascii_alphanumeric())
                .take(4)
                .collect();
            format!("{}.{}.prv", settings.name, suffix)
        })
    }

    fn offline(&self) -> bool {
        self.network.connection_state() != ConnectionState::Connected
    }

    fn on_connectivity_changed(self: &Rc<Self>) {
        if !self.offline() {
            // Stale wait/window timers must not fire after reconnect.
            self.bump_generation();
            if self.state.get() == BootstrapState::Bootstrapping {
                info!("network restored, stopping provisioning access point");
                self.wifi.stop_access_point();
            }
            self.state.set(BootstrapState::Monitoring);
            return;
        }
        // Offline: the wait/AP cycle drives itself once started.
        if self.state.get() == BootstrapState::Monitoring {
            self.begin_wait();
        }
    }

    fn begin_wait(self: &Rc<Self>) {
        self.state.set(BootstrapState::Waiting);
        info!(delay = ?WAIT_RECONNECT, "offline, waiting for reconnect");
        self.schedule(WAIT_RECONNECT, |shared| {
            if shared.state.get() == BootstrapState::Waiting && shared.offline() {
                shared.start_access_point();
            }
        });
    }

    fn start_access_point(self: &Rc<Self>) {
        let ssid = self.ap_ssid();
        info!(%ssid, "starting provisioning access point");
        self.state.set(BootstrapState::Bootstrapping);
        self.wifi.start_access_point(&ssid);
        self.schedule(AP_WINDOW, |shared| {
            if shared.state.get() == BootstrapState::Bootstrapping {
                shared.end_access_point_window();
            }
        });
    }

    fn end_access_point_window(self: &Rc<Self>) {
        info!("provisioning window over, retrying station mode");
        self.wifi.stop_access_point();
        if self.offline() {
            self.begin_wait();
        } else {
            self.state.set(BootstrapState::Monitoring);
        }
    }

    fn schedule(self: &Rc<Self>, delay: Duration, action: fn(&Rc<Shared>)) {
        let generation = self.generation.get();
        let weak = Rc::downgrade(self);
        self.task_runner.post_delayed(
            delay,
            Box::new(move || {
                if let Some(shared) = weak.upgrade() {
                    if shared.generation.get() == generation {
                        action(&shared);
                    }
                }
            }),
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Settings;
    use crate::provider::test::{FakeNetwork, FakeTaskRunner, FakeWifi, MemConfigStore, WifiEventKind};

    fn fixture(
        last_ssid: &str,
        initial: ConnectionState,
    ) -> (Rc<FakeTaskRunner>, Rc<FakeNetwork>, Rc<FakeWifi>, WifiBootstrapper) {
        let runner = FakeTaskRunner::new();
        let network = FakeNetwork::new(initial);
        let wifi = FakeWifi::new(runner.clock());
        let store = MemConfigStore::with_defaults(Settings {
            device_id: "d1e2f3a4".to_string(),
            name: "TEST_NAME".to_string(),
            last_configured_ssid: last_ssid.to_string(),
            ..Settings::default()
        });
        let config = Rc::new(Config::new(Some(store)));
        let bootstrapper =
            WifiBootstrapper::new(config, runner.clone(), network.clone(), wifi.clone());
        (runner, network, wifi, bootstrapper)
    }

    #[test]
    fn offline_start_without_ssid_opens_ap_immediately() {
        let (_runner, _network, wifi, bootstrapper) = fixture("", ConnectionState::Offline);
        bootstrapper.start();
        let starts = wifi.ap_starts();
        assert_eq!(starts.len(), 1);
        assert!(starts[0].1.starts_with("TEST_NAME."));
        assert!(starts[0].1.ends_with(".prv"));
        assert!(bootstrapper.in_bootstrap_mode());
    }

    #[test]
    fn connect_success_records_ssid() {
        let (runner, network, wifi, bootstrapper) = fixture("", ConnectionState::Offline);
        bootstrapper.start();
        bootstrapper.connect("HOME_SSID", "hunter2");
        network.notify_changed(&*runner, ConnectionState::Connected, Duration::ZERO);
        runner.run_for(Duration::from_secs(1));
        assert!(wifi
            .events()
            .iter()
            .any(|e| e.kind == WifiEventKind::Connect("HOME_SSID".to_string())));
        assert!(!bootstrapper.in_bootstrap_mode());
    }

    #[test]
    fn connect_failure_while_offline_reopens_ap() {
        let (_runner, _network, wifi, bootstrapper) = fixture("", ConnectionState::Offline);
        bootstrapper.start();
        wifi.set_connect_result(Err("auth failure".to_string()));
        bootstrapper.connect("HOME_SSID", "wrong");
        // AP from start, stopped for the attempt, reopened on failure.
        assert_eq!(wifi.ap_starts().len(), 2);
        assert_eq!(wifi.ap_stops().len(), 1);
        assert!(bootstrapper.in_bootstrap_mode());
    }
}
