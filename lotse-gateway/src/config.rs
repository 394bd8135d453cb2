use std::net::SocketAddr;

/// Gateway-level settings layered on top of [`lotse_engine::Config`]: the
/// HTTP bind address and the message-broker ingress settings. Split out of
/// the engine's own config because these concern the HTTP process, not
/// the execution engine library, the way the teacher keeps CLI-only flags
/// out of its reconciler's config.
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    pub bind_addr: SocketAddr,
    /// Port the owning-replica cancel hop (`task.ip_address:<port>`) is
    /// assumed to be listening on; always this process's own bind port.
    pub control_port: u16,
    pub broker: BrokerConfig,
}

#[derive(Debug, Clone)]
pub struct BrokerConfig {
    pub active: bool,
    pub host: String,
    pub port: u16,
    pub user: String,
    pub password: String,
    pub queue_name: String,
}

impl GatewayConfig {
    pub fn from_env() -> Self {
        let port: u16 = std::env::var("GATEWAY_PORT").ok().and_then(|s| s.parse().ok()).unwrap_or(8000);
        GatewayConfig {
            bind_addr: SocketAddr::from(([0, 0, 0, 0], port)),
            control_port: port,
            broker: BrokerConfig {
                active: std::env::var("ACTIVEMQ_ACTIVE").map(|v| v.eq_ignore_ascii_case("true")).unwrap_or(false),
                host: std::env::var("ACTIVEMQ_HOST").unwrap_or_else(|_| "localhost".to_owned()),
                port: std::env::var("ACTIVEMQ_PORT").ok().and_then(|s| s.parse().ok()).unwrap_or(61613),
                user: std::env::var("ACTIVEMQ_USER").unwrap_or_else(|_| "admin".to_owned()),
                password: std::env::var("ACTIVEMQ_PASSWORD").unwrap_or_default(),
                queue_name: std::env::var("ACTIVEMQ_QUEUE_NAME").unwrap_or_else(|_| "default_queue".to_owned()),
            },
        }
    }
}
