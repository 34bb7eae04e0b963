//! Connectivity capability supplied by the host.

use std::rc::Rc;

/// Observed state of the device's uplink.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Offline,
    Connecting,
    Connected,
}

/// Delegate for a raw SSL socket opened through the host.
///
/// Used by the cloud push channel; the core only cares that bytes
/// arrived, not what they say.
pub trait SslSocketDelegate {
    fn on_connected(&self);
    fn on_data(&self, data: &[u8]);
    fn on_error(&self, message: &str);
}

pub trait Network {
    fn connection_state(&self) -> ConnectionState;

    /// Register for connectivity transitions. Callbacks are posted on the
    /// task runner by the host.
    fn add_connection_changed_callback(&self, callback: Rc<dyn Fn()>);

    fn open_ssl_socket(&self, host: &str, port: u16, delegate: Rc<dyn SslSocketDelegate>);
}
