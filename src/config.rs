use std::path::PathBuf;

use clap::Parser;
use tracing::warn;

use crate::crypto::keys::DEFAULT_KEY_BITS;

/// Node configuration. Every knob is a flag with an environment-variable
/// fallback, so containerised deployments can run the bare binary.
#[derive(Parser, Debug, Clone)]
#[command(name = "socp", version, about = "Federated end-to-end encrypted chat overlay node")]
pub struct Config {
    /// Address the websocket listener binds to.
    #[arg(long, env = "LISTEN_HOST", default_value = "0.0.0.0")]
    pub listen_host: String,

    /// Port the websocket listener binds to. 0 picks an ephemeral port.
    #[arg(long, env = "LISTEN_PORT", default_value_t = 8765)]
    pub listen_port: u16,

    /// Stable node id; a fresh v4 UUID is generated and persisted otherwise.
    #[arg(long, env = "SERVER_ID")]
    pub server_id: Option<String>,

    /// Comma-separated host:port list of peers to join on startup.
    #[arg(long, env = "BOOTSTRAP_PEERS", value_delimiter = ',')]
    pub bootstrap_peers: Vec<String>,

    /// Directory for the node keypair and the durable user directory.
    #[arg(long, env = "STORAGE_DIR", default_value = "storage")]
    pub storage_dir: PathBuf,

    /// Address announced to peers; defaults to the listen host, or 127.0.0.1
    /// when listening on a wildcard.
    #[arg(long, env = "ADVERTISE_HOST")]
    pub advertise_host: Option<String>,

    /// Reject a second USER_HELLO for an already-connected user id instead of
    /// replacing the older connection.
    #[arg(long, env = "STRICT_USER_HELLO", default_value_t = false, action = clap::ArgAction::Set, num_args = 0..=1, default_missing_value = "true")]
    pub strict_user_hello: bool,

    /// RSA modulus size for a freshly generated node key.
    #[arg(long, env = "KEY_BITS", default_value_t = DEFAULT_KEY_BITS)]
    pub key_bits: usize,
}

impl Config {
    /// The host peers should dial; a wildcard bind is not dialable.
    pub fn advertised_host(&self) -> String {
        if let Some(host) = &self.advertise_host {
            return host.clone();
        }
        match self.listen_host.as_str() {
            "0.0.0.0" | "::" | "[::]" => "127.0.0.1".to_string(),
            host => host.to_string(),
        }
    }

    /// Parsed bootstrap list; malformed entries are logged and skipped.
    pub fn bootstrap_addrs(&self) -> Vec<(String, u16)> {
        self.bootstrap_peers
            .iter()
            .filter(|s| !s.trim().is_empty())
            .filter_map(|entry| {
                let (host, port) = entry.trim().rsplit_once(':')?;
                match port.parse::<u16>() {
                    Ok(port) if !host.is_empty() => Some((host.to_string(), port)),
                    _ => {
                        warn!("ignoring malformed bootstrap peer {entry:?}");
                        None
                    }
                }
            })
            .collect()
    }
}

impl Default for Config {
    fn default() -> Self {
        Config {
            listen_host: "0.0.0.0".to_string(),
            listen_port: 8765,
            server_id: None,
            bootstrap_peers: Vec::new(),
            storage_dir: PathBuf::from("storage"),
            advertise_host: None,
            strict_user_hello: false,
            key_bits: DEFAULT_KEY_BITS,
        }
    }
}
