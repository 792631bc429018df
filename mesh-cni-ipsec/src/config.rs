use std::net::IpAddr;
use std::path::PathBuf;
use std::time::Duration;

use clap::{Parser, Subcommand};
use ipnetwork::IpNetwork;

use crate::endpoint::Direction;
use crate::keys::Spi;
use crate::xfrm::MAX_MARK_SPI;
use crate::{Error, Result};

pub const DEFAULT_MAX_KEY_VERSION: Spi = 15;
pub const DEFAULT_KEY_DELETE_DELAY: Duration = Duration::from_secs(5 * 60);

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct IpsecConfig {
    /// Largest key version accepted from the key source.
    pub max_key_version: Spi,
    /// How long state from a rotated-out key is kept before it is reclaimed.
    pub key_delete_delay: Duration,
}

impl Default for IpsecConfig {
    fn default() -> Self {
        Self {
            max_key_version: DEFAULT_MAX_KEY_VERSION,
            key_delete_delay: DEFAULT_KEY_DELETE_DELAY,
        }
    }
}

impl IpsecConfig {
    pub fn validate(&self) -> Result<()> {
        if self.max_key_version == 0 || self.max_key_version > MAX_MARK_SPI {
            return Err(Error::Config(format!(
                "max key version must be between 1 and {MAX_MARK_SPI}, got {}",
                self.max_key_version
            )));
        }
        Ok(())
    }
}

#[derive(Debug, Parser)]
#[command(version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Clone, Subcommand, Debug)]
pub enum Commands {
    /// Load keys and keep them current, reclaiming state from rotated keys
    Agent(AgentArgs),
    /// Parse and validate a key file without touching the kernel
    CheckKeys(KeyArgs),
    /// Program the associations and policies for one endpoint pair
    Upsert(UpsertArgs),
    /// Remove the associations for one peer
    Delete(DeleteArgs),
}

#[derive(Parser, Debug, Clone)]
pub struct KeyArgs {
    /// Path to the IPsec key file
    #[arg(long, env = "IPSEC_KEY_FILE", default_value = "/etc/ipsec/keys")]
    pub keys_file: PathBuf,

    /// Largest key version accepted
    #[arg(long, env = "IPSEC_MAX_KEY_VERSION", default_value_t = DEFAULT_MAX_KEY_VERSION)]
    pub max_key_version: Spi,
}

#[derive(Parser, Debug, Clone)]
pub struct AgentArgs {
    #[command(flatten)]
    pub keys: KeyArgs,

    /// Seconds to keep state from a rotated-out key
    #[arg(long, env = "IPSEC_KEY_DELETE_DELAY_SECS", default_value_t = 300)]
    pub key_delete_delay_secs: u64,

    /// Enable ipv6 forwarding before loading keys
    #[arg(long, env = "IPSEC_ENABLE_IPV6_FORWARDING")]
    pub enable_ipv6_forwarding: bool,

    /// Path to the proc fs
    #[arg(long, default_value = "/proc")]
    pub proc_root: PathBuf,
}

#[derive(Parser, Debug, Clone)]
pub struct UpsertArgs {
    #[command(flatten)]
    pub keys: KeyArgs,

    /// Local address and the subnet it routes for
    #[arg(long)]
    pub local: IpNetwork,

    /// Remote address and the subnet it routes for
    #[arg(long)]
    pub remote: IpNetwork,

    #[arg(long, value_enum, default_value_t = Direction::Both)]
    pub direction: Direction,
}

#[derive(Parser, Debug, Clone)]
pub struct DeleteArgs {
    /// Peer whose associations are removed
    #[arg(long)]
    pub peer: IpAddr,

    /// Local address paired with the peer
    #[arg(long)]
    pub local: IpAddr,
}

impl KeyArgs {
    pub fn to_config(&self) -> IpsecConfig {
        IpsecConfig {
            max_key_version: self.max_key_version,
            ..Default::default()
        }
    }
}

impl AgentArgs {
    pub fn to_config(&self) -> IpsecConfig {
        IpsecConfig {
            max_key_version: self.keys.max_key_version,
            key_delete_delay: Duration::from_secs(self.key_delete_delay_secs),
        }
    }
}
