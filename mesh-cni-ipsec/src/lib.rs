pub mod config;
pub mod endpoint;
pub mod keys;
pub mod reclaim;
pub mod registry;
pub mod sysctl;
pub mod xfrm;

use std::fs::File;
use std::io::{BufReader, Read};
use std::net::IpAddr;
use std::path::Path;
use std::sync::Arc;

use ipnetwork::IpNetwork;
use thiserror::Error;
use tracing::info;

pub use crate::config::IpsecConfig;
pub use crate::endpoint::Direction;
pub use crate::keys::{KeyMaterial, KeyScope, Spi};
pub use crate::reclaim::Reclaimer;
pub use crate::registry::KeyRegistry;
pub use crate::xfrm::XfrmDriver;

#[derive(Error, Debug)]
pub enum Error {
    #[error("io error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("missing IPsec keys or invalid format: {0}")]
    InvalidKeyFormat(String),

    #[error(
        "zero is not a valid key version, disable encryption explicitly instead; id must be nonzero and at most {max}, attempted {attempted:?}"
    )]
    ZeroKeyVersion { max: Spi, attempted: String },

    #[error("encryption key space exhausted, id must be nonzero and at most {max}, attempted {attempted:?}")]
    KeyVersionExhausted { max: Spi, attempted: String },

    #[error("unable to decode {kind} key for algorithm {algorithm:?}")]
    KeyDecode {
        kind: &'static str,
        algorithm: String,
        #[source]
        source: hex::FromHexError,
    },

    #[error("invalid key scope {0:?}, expected a peer ip address")]
    InvalidKeyScope(String),

    #[error("no IPsec keys found in key source")]
    NoKeys,

    #[error("IPsec key missing for {0}")]
    KeyMissing(IpAddr),

    #[error("xfrm entry already exists")]
    AlreadyExists,

    #[error("xfrm entry not found")]
    NotFound,

    #[error("xfrm driver error: {0}")]
    Driver(String),

    #[error("unable to replace {dir} state: {source}")]
    ReplaceState {
        dir: xfrm::PolicyDirection,
        #[source]
        source: Box<Error>,
    },

    #[error("unable to replace policy {dir}: {source}")]
    ReplacePolicy {
        dir: xfrm::PolicyDirection,
        #[source]
        source: Box<Error>,
    },

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("no tokio runtime available to schedule key reclaim")]
    NoRuntime,
}

impl Error {
    pub fn is_exists(&self) -> bool {
        matches!(self, Error::AlreadyExists)
    }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Entry points for the endpoint-discovery side: key loading, endpoint
/// programming and removal over a shared registry and kernel driver.
pub struct Ipsec<D: XfrmDriver> {
    registry: Arc<KeyRegistry>,
    driver: Arc<D>,
    reclaimer: Reclaimer<D>,
    config: IpsecConfig,
}

impl<D: XfrmDriver + 'static> Ipsec<D> {
    /// Must be called from within a tokio runtime, rotations are swept on it.
    pub fn try_new(driver: D, config: IpsecConfig) -> Result<Self> {
        config.validate()?;
        let registry = Arc::new(KeyRegistry::default());
        let driver = Arc::new(driver);
        let reclaimer = Reclaimer::try_new(
            Arc::clone(&driver),
            Arc::clone(&registry),
            config.key_delete_delay,
        )?;
        Ok(Self {
            registry,
            driver,
            reclaimer,
            config,
        })
    }

    pub fn load_keys_from_file(&self, path: impl AsRef<Path>) -> Result<Spi> {
        let path = path.as_ref();
        info!(path = %path.display(), "loading IPsec keys");
        let file = File::open(path)?;
        self.load_keys(file)
    }

    pub fn load_keys<R: Read>(&self, reader: R) -> Result<Spi> {
        let outcome = self
            .registry
            .load(BufReader::new(reader), self.config.max_key_version)?;
        for rotation in outcome.rotations {
            self.reclaimer.schedule(rotation);
        }
        Ok(outcome.spi)
    }

    pub fn upsert_endpoint(
        &self,
        local: IpNetwork,
        remote: IpNetwork,
        dir: Direction,
    ) -> Result<Spi> {
        endpoint::upsert_endpoint(self.driver.as_ref(), &self.registry, local, remote, dir)
    }

    pub fn delete_endpoint(&self, peer: IpAddr, local: IpAddr) -> Result<()> {
        endpoint::delete_endpoint(self.driver.as_ref(), peer, local)
    }

    pub fn registry(&self) -> &KeyRegistry {
        &self.registry
    }

    pub fn driver(&self) -> &D {
        &self.driver
    }

    /// Cancels pending key reclaims and waits for running sweeps to finish.
    pub async fn shutdown(&self) {
        self.reclaimer.shutdown().await;
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;
    use std::time::Duration;

    use super::*;
    use crate::xfrm::memory::MemoryXfrm;

    fn config() -> IpsecConfig {
        IpsecConfig {
            key_delete_delay: Duration::from_secs(60),
            ..Default::default()
        }
    }

    #[tokio::test(start_paused = true)]
    async fn load_then_upsert_uses_loaded_key() -> Result<()> {
        let ipsec = Ipsec::try_new(MemoryXfrm::default(), config())?;
        let spi = ipsec.load_keys("3 hmac(sha256) 0x00112233 cbc(aes) 44556677\n".as_bytes())?;
        assert_eq!(spi, 3);

        let local: IpNetwork = "10.0.1.0/24".parse().expect("local");
        let remote: IpNetwork = "10.0.2.0/24".parse().expect("remote");
        let spi = ipsec.upsert_endpoint(local, remote, Direction::Both)?;
        assert_eq!(spi, 3);
        assert_eq!(ipsec.driver().states().len(), 2);
        assert_eq!(ipsec.driver().policies().len(), 3);

        ipsec.shutdown().await;
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn load_keys_from_file_reads_every_line() -> Result<()> {
        let mut file = tempfile::NamedTempFile::new()?;
        writeln!(file, "1 auth-x 00112233 crypt-y 44556677")?;
        writeln!(file, "2 auth-x 00112233 crypt-y 44556677 10.0.0.5")?;

        let ipsec = Ipsec::try_new(MemoryXfrm::default(), config())?;
        let spi = ipsec.load_keys_from_file(file.path())?;
        assert_eq!(spi, 2);

        let peer: IpAddr = "10.0.0.5".parse().expect("peer");
        let other: IpAddr = "10.0.0.6".parse().expect("other");
        assert_eq!(ipsec.registry().get(peer).map(|k| k.spi), Some(2));
        assert_eq!(ipsec.registry().get(other).map(|k| k.spi), Some(1));

        ipsec.shutdown().await;
        Ok(())
    }

    #[tokio::test]
    async fn missing_key_file_is_io_error() -> Result<()> {
        let ipsec = Ipsec::try_new(MemoryXfrm::default(), config())?;
        let err = ipsec
            .load_keys_from_file("/nonexistent/ipsec/keys")
            .expect_err("missing file");
        assert!(matches!(err, Error::IoError(_)));
        Ok(())
    }

    #[test]
    fn try_new_outside_runtime_fails() {
        let res = Ipsec::try_new(MemoryXfrm::default(), config());
        assert!(matches!(res, Err(Error::NoRuntime)));
    }
}
