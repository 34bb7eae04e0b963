//! Host-supplied capabilities.
//!
//! The core holds references to these traits and never owns the
//! underlying resources; test doubles substitute at the same boundary.

mod config_store;
mod dns_sd;
mod http;
mod network;
mod task_runner;
mod wifi;

pub use config_store::ConfigStore;
pub use dns_sd::DnsServiceDiscovery;
pub use http::{
    HttpClient, HttpServer, Request, RequestHandler, Response, ResponseCallback, ServerRequest,
    ServerResponse, TransportError,
};
pub use network::{ConnectionState, Network, SslSocketDelegate};
pub use task_runner::{unix_seconds, Clock, SystemClock, Task, TaskRunner};
pub use wifi::{Bluetooth, ConnectCallback, Wifi};
