use std::net::SocketAddr;
use std::time::Duration;

/// Configuration for the control-plane process.
#[derive(Debug, Clone)]
pub struct ControllerConfig {
    pub listen_addr: SocketAddr,
    /// Store endpoints, host:port format, supports both IP and hostnames.
    pub store_endpoints: Vec<String>,
    pub store_connect_timeout: Duration,
    /// Deadline applied to single-shot client RPCs.
    pub request_deadline: Duration,
    /// Lease TTL for executor liveness pings. Executors are expected to ping
    /// every `ping_ttl / missed_ping_threshold`, so the lease survives up to
    /// `missed_ping_threshold - 1` missed pings.
    pub ping_ttl_secs: i64,
    pub missed_ping_threshold: u32,
    /// Token required by the operator surface (approve/reject).
    pub admin_token: String,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            listen_addr: "127.0.0.1:5050".parse().unwrap(),
            store_endpoints: vec!["localhost:2379".to_string()],
            store_connect_timeout: Duration::from_secs(5),
            request_deadline: Duration::from_secs(5),
            ping_ttl_secs: 10,
            missed_ping_threshold: 3,
            admin_token: String::new(),
        }
    }
}

impl ControllerConfig {
    pub fn new(listen_addr: SocketAddr) -> Self {
        Self {
            listen_addr,
            ..Default::default()
        }
    }

    pub fn with_store_endpoints(mut self, endpoints: Vec<String>) -> Self {
        self.store_endpoints = endpoints;
        self
    }

    pub fn with_admin_token(mut self, token: String) -> Self {
        self.admin_token = token;
        self
    }
}
