//! Push notification channel.
//!
//! A raw SSL connection to the notification endpoint; any inbound bytes
//! are treated as "check for commands now", which short-circuits the
//! poll timer. The actual stream protocol is the host's concern.

use std::rc::Rc;

use tracing::{debug, warn};

use crate::provider::{Network, SslSocketDelegate};

const PUSH_HOST: &str = "talk.google.com";
const PUSH_PORT: u16 = 5223;

/// Open the channel; `on_notification` fires on every inbound payload.
pub(crate) fn open_push_channel(network: &Rc<dyn Network>, on_notification: Rc<dyn Fn()>) {
    network.open_ssl_socket(PUSH_HOST, PUSH_PORT, Rc::new(PushDelegate { on_notification }));
}

struct PushDelegate {
    on_notification: Rc<dyn Fn()>,
}

impl SslSocketDelegate for PushDelegate {
    fn on_connected(&self) {
        debug!(host = PUSH_HOST, "push channel connected");
    }

    fn on_data(&self, _data: &[u8]) {
        (self.on_notification)();
    }

    fn on_error(&self, message: &str) {
        warn!(message, "push channel error");
    }
}
