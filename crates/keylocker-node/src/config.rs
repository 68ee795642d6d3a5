use clap::Parser;
use keylocker_crypto::SymmetricKey;
use keylocker_protocol::constants::{
    CONN_GRACE_SECS, CONN_HIGH_WATER, CONN_LOW_WATER, DEFAULT_FAULT_TOLERANCE_TIMES,
    RELAY_POLL_INTERVAL_SECS,
};
use libp2p::Multiaddr;
use std::{net::SocketAddr, time::Duration};

#[derive(Parser, Debug, Clone)]
#[command(name = "keylocker-node", about = "Multi-backend secret custody node")]
pub struct Config {
    /// Print a freshly generated private key in the form the key variable
    /// accepts, then exit.
    #[arg(long)]
    pub gen_key: bool,

    /// Host part of the libp2p listen address.
    #[arg(long, env = "KEYLOCKER_LISTEN_HOST", default_value = "0.0.0.0")]
    pub listen_host: String,

    /// TCP port of the libp2p listen address.
    #[arg(long, env = "KEYLOCKER_LISTEN_PORT", default_value_t = 4001)]
    pub listen_port: u16,

    /// Rendezvous string. Only peers advertising the same value are used.
    #[arg(long, env = "KEYLOCKER_RENDEZVOUS", default_value = "keylocker")]
    pub rendezvous: String,

    /// Chains to register adaptors for (comma separated).
    #[arg(
        long,
        env = "KEYLOCKER_CHAINS",
        value_delimiter = ',',
        default_value = "Ethereum,Ipfs,Filecoin"
    )]
    pub chains: Vec<String>,

    /// Name of the environment variable holding the protobuf-encoded libp2p
    /// private key, hex or base64.
    #[arg(long, env = "KEYLOCKER_PRIVATE_KEY_ENV", default_value = "KEYLOCKER_P2P_PRIVATE_KEY")]
    pub private_key_env: String,

    /// Relay attempts per get-key miss. Capped by the number of known peers.
    #[arg(long, env = "KEYLOCKER_FAULT_TOLERANCE_TIMES", default_value_t = DEFAULT_FAULT_TOLERANCE_TIMES)]
    pub fault_tolerance_times: usize,

    /// Tick interval while waiting on a relayed response.
    #[arg(long, env = "KEYLOCKER_RELAY_POLL_INTERVAL_SECS", default_value_t = RELAY_POLL_INTERVAL_SECS)]
    pub relay_poll_interval_secs: u64,

    /// Upper bound on the wait for a relayed response.
    #[arg(long, env = "KEYLOCKER_RELAY_TIMEOUT_SECS", default_value_t = 30)]
    pub relay_timeout_secs: u64,

    #[arg(long, env = "KEYLOCKER_CONN_LOW_WATER", default_value_t = CONN_LOW_WATER)]
    pub conn_low_water: usize,

    #[arg(long, env = "KEYLOCKER_CONN_HIGH_WATER", default_value_t = CONN_HIGH_WATER)]
    pub conn_high_water: usize,

    /// New connections are never trimmed within this many seconds.
    #[arg(long, env = "KEYLOCKER_CONN_GRACE_SECS", default_value_t = CONN_GRACE_SECS)]
    pub conn_grace_secs: u64,

    /// AES key (hex, 16 or 32 bytes) protecting stored RSA private keys.
    /// If absent an ephemeral key is generated and stored secrets do not
    /// survive a restart.
    #[arg(long, env = "KEYLOCKER_AES_KEY")]
    pub aes_key: Option<String>,

    /// Modulus size for generated per-identity RSA keys.
    #[arg(long, env = "KEYLOCKER_RSA_BITS", default_value_t = 2048)]
    pub rsa_bits: usize,

    /// JSON API listen address, e.g. 127.0.0.1:8080. Not started if absent.
    #[arg(long, env = "KEYLOCKER_API_ADDR")]
    pub api_addr: Option<SocketAddr>,

    /// Contract address recorded by the Ethereum/Moonbeam adaptors.
    #[arg(long, env = "KEYLOCKER_ETHEREUM_CONTRACT")]
    pub ethereum_contract: Option<String>,

    /// Content network nodes for the Ipfs adaptor (can repeat).
    #[arg(long, env = "KEYLOCKER_IPFS_NODE")]
    pub ipfs_node: Vec<String>,
}

impl Config {
    /// `/ip4/<host>/tcp/<port>`, or `/ip6/...` for an IPv6 host.
    pub fn listen_multiaddr(&self) -> anyhow::Result<Multiaddr> {
        let proto = if self.listen_host.contains(':') { "ip6" } else { "ip4" };
        format!("/{proto}/{}/tcp/{}", self.listen_host, self.listen_port)
            .parse()
            .map_err(|e| anyhow::anyhow!("invalid listen address {}: {e}", self.listen_host))
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.conn_high_water < self.conn_low_water {
            anyhow::bail!(
                "conn_high_water ({}) must be >= conn_low_water ({})",
                self.conn_high_water,
                self.conn_low_water,
            );
        }
        if self.fault_tolerance_times == 0 {
            anyhow::bail!("fault_tolerance_times must be at least 1");
        }
        if self.relay_poll_interval_secs == 0 {
            anyhow::bail!("relay_poll_interval_secs must be > 0");
        }
        if self.rendezvous.is_empty() {
            anyhow::bail!("rendezvous must not be empty");
        }
        self.listen_multiaddr()?;
        Ok(())
    }

    /// Parse `--aes-key`, or generate an ephemeral key when absent.
    pub fn aes_key_bytes(&self) -> anyhow::Result<SymmetricKey> {
        match &self.aes_key {
            None => {
                tracing::warn!(
                    "No --aes-key set. Using an ephemeral key; stored private keys \
                     cannot be decrypted after restart."
                );
                Ok(SymmetricKey::generate())
            }
            Some(s) => {
                let bytes = hex::decode(s.trim().trim_start_matches("0x"))
                    .map_err(|e| anyhow::anyhow!("invalid aes_key hex: {e}"))?;
                SymmetricKey::from_slice(&bytes).map_err(|e| anyhow::anyhow!("invalid aes_key: {e}"))
            }
        }
    }

    pub fn relay_poll_interval(&self) -> Duration {
        Duration::from_secs(self.relay_poll_interval_secs)
    }

    pub fn relay_timeout(&self) -> Duration {
        Duration::from_secs(self.relay_timeout_secs)
    }

    pub fn conn_grace(&self) -> Duration {
        Duration::from_secs(self.conn_grace_secs)
    }
}
