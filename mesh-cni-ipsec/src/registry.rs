use std::collections::BTreeSet;
use std::io::BufRead;
use std::net::IpAddr;
use std::sync::{Arc, PoisonError, RwLock};

use ahash::HashMap;
use tracing::{debug, info};

use crate::keys::{self, KeyMaterial, KeyScope, Spi};
use crate::{Error, Result};

/// A scope whose key version changed during a load. `previous` is 0 when the
/// scope had no key before, which is how stale kernel state from an earlier
/// run gets reclaimed after a restart.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Rotation {
    pub scope: KeyScope,
    pub previous: Spi,
    pub current: Spi,
}

#[derive(Debug, PartialEq, Eq)]
pub struct LoadOutcome {
    /// Version of the last line loaded.
    pub spi: Spi,
    pub rotations: Vec<Rotation>,
}

/// Active key per scope. Readers take the lock shared; a load stages every
/// line against a copy and swaps it in with one write, so a failed load
/// leaves the registry untouched.
#[derive(Default)]
pub struct KeyRegistry {
    keys: RwLock<HashMap<KeyScope, Arc<KeyMaterial>>>,
}

impl KeyRegistry {
    /// Key for `ip`, falling back to the wildcard entry.
    pub fn get(&self, ip: IpAddr) -> Option<Arc<KeyMaterial>> {
        let keys = self.keys.read().unwrap_or_else(PoisonError::into_inner);
        keys.get(&KeyScope::Peer(ip))
            .or_else(|| keys.get(&KeyScope::Wildcard))
            .cloned()
    }

    pub fn get_scope(&self, scope: &KeyScope) -> Option<Arc<KeyMaterial>> {
        let keys = self.keys.read().unwrap_or_else(PoisonError::into_inner);
        keys.get(scope).cloned()
    }

    /// Versions currently referenced by any scope.
    pub fn active_spis(&self) -> BTreeSet<Spi> {
        let keys = self.keys.read().unwrap_or_else(PoisonError::into_inner);
        keys.values().map(|k| k.spi).collect()
    }

    pub fn len(&self) -> usize {
        self.keys
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn insert(&self, scope: KeyScope, key: KeyMaterial) -> Option<Arc<KeyMaterial>> {
        let mut keys = self.keys.write().unwrap_or_else(PoisonError::into_inner);
        keys.insert(scope, Arc::new(key))
    }

    /// Parses every line of `reader` and replaces the key of each line's
    /// scope. Later lines for the same scope win. The source is read and
    /// parsed before the lock is taken, so lookups never wait on its I/O.
    pub fn load<R: BufRead>(&self, reader: R, max_version: Spi) -> Result<LoadOutcome> {
        let mut records = vec![];
        for line in reader.lines() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            records.push(keys::parse_line(&line, max_version)?);
        }
        let spi = records.last().map(|r| r.key.spi).ok_or(Error::NoKeys)?;

        let mut keys = self.keys.write().unwrap_or_else(PoisonError::into_inner);
        let mut staged = keys.clone();
        let mut rotations = vec![];
        for record in records {
            let scope = record.scope;
            let current = record.key.spi;
            let previous = staged
                .insert(scope, Arc::new(record.key))
                .map(|k| k.spi)
                .unwrap_or(0);

            debug!(%scope, previous, current, "parsed IPsec key");
            if previous != current {
                rotations.push(Rotation {
                    scope,
                    previous,
                    current,
                });
            }
        }

        *keys = staged;
        info!(spi, scopes = keys.len(), "loaded IPsec keys");
        Ok(LoadOutcome { spi, rotations })
    }
}

#[cfg(test)]
mod tests {
    use std::io::{self, BufReader, Read};
    use std::sync::mpsc;
    use std::thread;
    use std::time::Duration;

    use super::*;

    const MAX: Spi = 15;

    fn load(registry: &KeyRegistry, input: &str) -> Result<LoadOutcome> {
        registry.load(input.as_bytes(), MAX)
    }

    fn peer(ip: &str) -> IpAddr {
        ip.parse().expect("ip")
    }

    #[test]
    fn wildcard_fallback() -> Result<()> {
        let registry = KeyRegistry::default();
        load(&registry, "1 auth-x 00112233 crypt-y 44556677\n")?;
        let key = registry.get(peer("10.0.0.9")).expect("wildcard key");
        assert_eq!(key.spi, 1);
        Ok(())
    }

    #[test]
    fn scoped_key_leaves_wildcard() -> Result<()> {
        let registry = KeyRegistry::default();
        load(
            &registry,
            "1 auth-x 00112233 crypt-y 44556677\n2 auth-x 00112233 crypt-y 44556677 10.0.0.5\n",
        )?;
        assert_eq!(registry.get(peer("10.0.0.5")).map(|k| k.spi), Some(2));
        assert_eq!(
            registry.get_scope(&KeyScope::Wildcard).map(|k| k.spi),
            Some(1)
        );
        assert_eq!(registry.get(peer("10.0.0.6")).map(|k| k.spi), Some(1));
        Ok(())
    }

    #[test]
    fn no_key_without_wildcard() -> Result<()> {
        let registry = KeyRegistry::default();
        load(&registry, "2 auth-x 00112233 crypt-y 44556677 10.0.0.5\n")?;
        assert!(registry.get(peer("10.0.0.6")).is_none());
        Ok(())
    }

    #[test]
    fn returns_last_version() -> Result<()> {
        let registry = KeyRegistry::default();
        let outcome = load(
            &registry,
            "3 auth-x 00112233 crypt-y 44556677 10.0.0.5\n1 auth-x 00112233 crypt-y 44556677\n",
        )?;
        assert_eq!(outcome.spi, 1);
        Ok(())
    }

    #[test]
    fn boot_load_rotates_from_zero() -> Result<()> {
        let registry = KeyRegistry::default();
        let outcome = load(&registry, "1 auth-x 00112233 crypt-y 44556677\n")?;
        assert_eq!(
            outcome.rotations,
            vec![Rotation {
                scope: KeyScope::Wildcard,
                previous: 0,
                current: 1,
            }]
        );
        Ok(())
    }

    #[test]
    fn version_change_rotates_once() -> Result<()> {
        let registry = KeyRegistry::default();
        load(&registry, "1 auth-x 00112233 crypt-y 44556677\n")?;

        let outcome = load(&registry, "2 auth-x 00112233 crypt-y 44556677\n")?;
        assert_eq!(
            outcome.rotations,
            vec![Rotation {
                scope: KeyScope::Wildcard,
                previous: 1,
                current: 2,
            }]
        );
        Ok(())
    }

    #[test]
    fn same_version_does_not_rotate() -> Result<()> {
        let registry = KeyRegistry::default();
        load(&registry, "1 auth-x 00112233 crypt-y 44556677\n")?;

        let outcome = load(&registry, "1 auth-x 8899aabb crypt-y ccddeeff\n")?;
        assert!(outcome.rotations.is_empty());
        let key = registry.get(peer("10.0.0.1")).expect("key");
        assert_eq!(key.auth.key, vec![0x88, 0x99, 0xaa, 0xbb]);
        Ok(())
    }

    #[test]
    fn rotation_within_one_load() -> Result<()> {
        let registry = KeyRegistry::default();
        let outcome = load(
            &registry,
            "1 auth-x 00112233 crypt-y 44556677\n2 auth-x 00112233 crypt-y 44556677\n",
        )?;
        let previous: Vec<Spi> = outcome.rotations.iter().map(|r| r.previous).collect();
        assert_eq!(previous, vec![0, 1]);
        assert_eq!(registry.active_spis(), BTreeSet::from([2]));
        Ok(())
    }

    #[test]
    fn rejected_load_does_not_mutate() -> Result<()> {
        let registry = KeyRegistry::default();
        load(&registry, "1 auth-x 00112233 crypt-y 44556677\n")?;

        let err = load(
            &registry,
            "2 auth-x 00112233 crypt-y 44556677\n0 auth-x 00112233 crypt-y 44556677\n",
        )
        .expect_err("zero version");
        assert!(matches!(err, Error::ZeroKeyVersion { .. }));

        let err = load(&registry, "16 auth-x 00112233 crypt-y 44556677\n").expect_err("max");
        assert!(matches!(err, Error::KeyVersionExhausted { .. }));

        assert_eq!(registry.len(), 1);
        assert_eq!(registry.active_spis(), BTreeSet::from([1]));
        Ok(())
    }

    /// Blocks on its first read until released.
    struct GatedReader {
        started: mpsc::Sender<()>,
        release: mpsc::Receiver<()>,
        inner: &'static [u8],
        opened: bool,
    }

    impl Read for GatedReader {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            if !self.opened {
                self.opened = true;
                let _ = self.started.send(());
                let _ = self.release.recv();
            }
            self.inner.read(buf)
        }
    }

    #[test]
    fn lookup_not_blocked_by_key_source_io() -> Result<()> {
        let registry = Arc::new(KeyRegistry::default());
        load(&registry, "1 auth-x 00112233 crypt-y 44556677\n")?;

        let (started_tx, started_rx) = mpsc::channel();
        let (release_tx, release_rx) = mpsc::channel();
        let reader = GatedReader {
            started: started_tx,
            release: release_rx,
            inner: b"2 auth-x 00112233 crypt-y 44556677\n",
            opened: false,
        };
        let loader = {
            let registry = Arc::clone(&registry);
            thread::spawn(move || registry.load(BufReader::new(reader), MAX))
        };
        started_rx.recv().expect("loader started");

        let (got_tx, got_rx) = mpsc::channel();
        {
            let registry = Arc::clone(&registry);
            thread::spawn(move || {
                let _ = got_tx.send(registry.get(peer("10.0.0.1")).map(|k| k.spi));
            });
        }
        let during = got_rx.recv_timeout(Duration::from_secs(5));

        release_tx.send(()).expect("release loader");
        let outcome = loader.join().expect("loader thread")?;

        assert_eq!(during, Ok(Some(1)));
        assert_eq!(outcome.spi, 2);
        assert_eq!(registry.get(peer("10.0.0.1")).map(|k| k.spi), Some(2));
        Ok(())
    }

    #[test]
    fn empty_source_is_error() {
        let registry = KeyRegistry::default();
        let err = load(&registry, "\n\n").expect_err("empty");
        assert!(matches!(err, Error::NoKeys));
        assert!(registry.is_empty());
    }
}
