//! WiFi and Bluetooth capabilities supplied by the host.

/// Completion callback for station-mode connection attempts.
pub type ConnectCallback = Box<dyn FnOnce(Result<(), String>)>;

pub trait Wifi {
    /// Join `ssid` in station mode.
    fn connect(&self, ssid: &str, passphrase: &str, done: ConnectCallback);

    /// Bring up the provisioning soft-AP. Idempotent.
    fn start_access_point(&self, ssid: &str);

    /// Tear down the soft-AP. Idempotent.
    fn stop_access_point(&self);
}

/// Presence-only capability; the core keys behavior off availability.
pub trait Bluetooth {}
