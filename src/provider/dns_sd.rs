//! DNS-SD (mDNS) capability supplied by the host.

pub trait DnsServiceDiscovery {
    /// (Re-)announce `service_type` on `port` with the given TXT records.
    /// Publishing the same type again replaces the previous record.
    fn publish_service(&self, service_type: &str, port: u16, txt: &[String]);

    fn stop_publishing(&self, service_type: &str);
}
