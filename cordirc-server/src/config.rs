use std::time::Duration;

use clap::Parser;

/// cordirc: an IRC server whose channels are Discord guild channels.
#[derive(Parser, Debug, Clone)]
#[command(name = "cordirc-server", version, about)]
pub struct ServerConfig {
    /// Plain TCP listener address.
    #[arg(long, default_value = "127.0.0.1:6667")]
    pub listen_addr: String,

    /// TLS listener address. Only active if --tls-cert and --tls-key are set.
    #[arg(long, default_value = "127.0.0.1:6697")]
    pub tls_listen_addr: String,

    /// Path to TLS certificate PEM file.
    #[arg(long)]
    pub tls_cert: Option<String>,

    /// Path to TLS private key PEM file.
    #[arg(long)]
    pub tls_key: Option<String>,

    /// Server name used in IRC messages.
    #[arg(long, default_value = "cordirc")]
    pub server_name: String,

    /// Shared connection password. When set, clients send
    /// `PASS <password>:<token>` instead of a bare token.
    #[arg(long, env = "CORDIRC_SERVER_PASSWORD", hide_env_values = true)]
    pub server_password: Option<String>,

    /// Capabilities offered to clients.
    #[arg(
        long,
        value_delimiter = ',',
        default_value = "server-time,batch,echo-message"
    )]
    pub capabilities: Vec<String>,

    /// Message of the Day text. If not set, no MOTD is sent.
    #[arg(long)]
    pub motd: Option<String>,

    /// Read the MOTD from a file (overrides --motd).
    #[arg(long)]
    pub motd_file: Option<String>,

    /// Upper bound on how long NAMES waits for a guild's member list.
    #[arg(long, default_value = "120")]
    pub roster_timeout_secs: u64,

    /// Outgoing lines buffered per client before it is considered stuck.
    #[arg(long, default_value = "4096")]
    pub send_queue: usize,

    /// Messages remembered per channel for edit/delete/pin notices.
    #[arg(long, default_value = "1000")]
    pub message_cache_size: usize,

    /// Idle seconds before the server pings a client.
    #[arg(long, default_value = "60")]
    pub ping_interval_secs: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: "127.0.0.1:6667".to_string(),
            tls_listen_addr: "127.0.0.1:6697".to_string(),
            tls_cert: None,
            tls_key: None,
            server_name: "cordirc".to_string(),
            server_password: None,
            capabilities: vec![
                "server-time".to_string(),
                "batch".to_string(),
                "echo-message".to_string(),
            ],
            motd: None,
            motd_file: None,
            roster_timeout_secs: 120,
            send_queue: 4096,
            message_cache_size: 1000,
            ping_interval_secs: 60,
        }
    }
}

impl ServerConfig {
    /// Returns true if TLS is configured.
    pub fn tls_enabled(&self) -> bool {
        self.tls_cert.is_some() && self.tls_key.is_some()
    }

    pub fn roster_timeout(&self) -> Duration {
        Duration::from_secs(self.roster_timeout_secs)
    }

    pub fn ping_interval(&self) -> Duration {
        Duration::from_secs(self.ping_interval_secs.max(1))
    }

    /// Offered capabilities, lowercased and de-duplicated.
    pub fn supported_caps(&self) -> Vec<String> {
        let mut caps: Vec<String> = Vec::new();
        for cap in &self.capabilities {
            let cap = cap.trim().to_ascii_lowercase();
            if !cap.is_empty() && !caps.contains(&cap) {
                caps.push(cap);
            }
        }
        caps
    }
}
