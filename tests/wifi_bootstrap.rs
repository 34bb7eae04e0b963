//! WiFi bootstrap timing scenarios: when the provisioning AP may start,
//! how long it stays up, and what reconnecting does to it.

use std::rc::Rc;
use std::time::{Duration, SystemTime};

use tether::provider::test::{FakeNetwork, FakeTaskRunner, FakeWifi, MemConfigStore};
use tether::provider::{Clock, ConnectionState, TaskRunner};
use tether::wifi::{AP_WINDOW, WAIT_RECONNECT};
use tether::{Config, Settings, WifiBootstrapper};

struct Harness {
    runner: Rc<FakeTaskRunner>,
    network: Rc<FakeNetwork>,
    wifi: Rc<FakeWifi>,
    config: Rc<Config>,
    bootstrapper: WifiBootstrapper,
}

fn start(last_ssid: &str, connection: ConnectionState) -> Harness {
    let runner = FakeTaskRunner::new();
    let network = FakeNetwork::new(connection);
    let wifi = FakeWifi::new(runner.clock());
    let store = MemConfigStore::with_defaults(Settings {
        device_id: "a1b2c3d4".to_string(),
        name: "TEST_NAME".to_string(),
        last_configured_ssid: last_ssid.to_string(),
        ..Settings::default()
    });
    let config = Rc::new(Config::new(Some(store)));
    let bootstrapper = WifiBootstrapper::new(
        config.clone(),
        runner.clone(),
        network.clone(),
        wifi.clone(),
    );
    bootstrapper.start();
    Harness {
        runner,
        network,
        wifi,
        config,
        bootstrapper,
    }
}

impl Harness {
    fn go(&self, state: ConnectionState) {
        self.network
            .notify_changed(&*self.runner, state, Duration::ZERO);
    }

    fn now(&self) -> SystemTime {
        self.runner.clock().now()
    }
}

#[test]
fn short_disconnect_does_not_open_ap() {
    let h = start("", ConnectionState::Connected);
    assert!(h.wifi.ap_starts().is_empty());

    h.go(ConnectionState::Offline);
    h.runner.run_for(Duration::from_secs(10));
    h.go(ConnectionState::Connected);
    h.runner.run_for(WAIT_RECONNECT * 3);

    assert!(h.wifi.ap_starts().is_empty());
    assert!(!h.bootstrapper.in_bootstrap_mode());
}

#[test]
fn long_disconnect_opens_ap_after_reconnect_wait() {
    let h = start("", ConnectionState::Connected);
    h.go(ConnectionState::Offline);
    let offline_from = h.now();

    h.runner.run_for(WAIT_RECONNECT - Duration::from_secs(1));
    assert!(h.wifi.ap_starts().is_empty(), "AP must not start early");

    h.runner.run_for(Duration::from_secs(2));
    let starts = h.wifi.ap_starts();
    assert_eq!(starts.len(), 1);
    assert!(starts[0].0 >= offline_from + WAIT_RECONNECT);
    assert!(starts[0].1.starts_with("TEST_NAME"));
    assert!(starts[0].1.ends_with("prv"));
}

#[test]
fn ap_cycles_with_station_retries_until_reconnect() {
    let h = start("TEST_ssid", ConnectionState::Connected);
    let mut wait_from = h.now();
    h.go(ConnectionState::Offline);

    for cycle in 0..5 {
        h.runner.run_for(WAIT_RECONNECT + Duration::from_secs(1));
        let starts = h.wifi.ap_starts();
        assert_eq!(starts.len(), cycle + 1, "cycle {cycle}: AP should be up");
        assert!(starts[cycle].0 >= wait_from + WAIT_RECONNECT);

        h.runner.run_for(AP_WINDOW + Duration::from_secs(1));
        let stops = h.wifi.ap_stops();
        assert_eq!(stops.len(), cycle + 1, "cycle {cycle}: AP window should end");
        assert!(stops[cycle] >= starts[cycle].0 + AP_WINDOW);
        wait_from = stops[cycle];
    }

    // Reconnect while waiting: the cycle stops and the provisioned SSID
    // is preserved.
    h.go(ConnectionState::Connected);
    h.runner.run_for(Duration::from_secs(1));
    let ap_count = h.wifi.ap_starts().len();
    h.runner.run_for(WAIT_RECONNECT * 3);
    assert_eq!(h.wifi.ap_starts().len(), ap_count);
    assert_eq!(h.config.settings().last_configured_ssid, "TEST_ssid");
    assert!(!h.bootstrapper.in_bootstrap_mode());
}

#[test]
fn reconnect_during_ap_window_stops_the_ap() {
    let h = start("TEST_ssid", ConnectionState::Connected);
    h.go(ConnectionState::Offline);
    h.runner.run_for(WAIT_RECONNECT + Duration::from_secs(1));
    assert!(h.bootstrapper.in_bootstrap_mode());

    h.go(ConnectionState::Connected);
    h.runner.run_for(Duration::from_secs(1));
    assert_eq!(h.wifi.ap_stops().len(), 1);
    assert!(!h.bootstrapper.in_bootstrap_mode());
    assert_eq!(h.config.settings().last_configured_ssid, "TEST_ssid");
}

#[test]
fn offline_start_with_provisioned_ssid_waits_before_ap() {
    let h = start("TEST_ssid", ConnectionState::Offline);
    let start_time = h.now();

    h.runner.run_for(WAIT_RECONNECT - Duration::from_secs(1));
    assert!(h.wifi.ap_starts().is_empty());

    h.runner.run_for(Duration::from_secs(2));
    let starts = h.wifi.ap_starts();
    assert_eq!(starts.len(), 1);
    assert!(starts[0].0 >= start_time + WAIT_RECONNECT);
}
