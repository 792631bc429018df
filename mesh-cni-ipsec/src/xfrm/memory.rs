use std::net::IpAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

use ahash::HashMap;

use crate::keys::Spi;
use crate::xfrm::{
    PolicySelector, SecurityAssociation, SecurityPolicy, StateSelector, XfrmDriver, XfrmProto,
};
use crate::{Error, Result};

type StateKey = (IpAddr, Spi, XfrmProto);

#[derive(Default)]
struct Tables {
    states: HashMap<StateKey, SecurityAssociation>,
    policies: HashMap<PolicySelector, SecurityPolicy>,
}

/// In-memory SAD/SPD following the kernel's identity rules. Every driver
/// call, including failed ones, bumps `ops`.
#[derive(Default)]
pub struct MemoryXfrm {
    tables: Mutex<Tables>,
    ops: AtomicUsize,
}

impl MemoryXfrm {
    fn tables(&self) -> MutexGuard<'_, Tables> {
        self.ops.fetch_add(1, Ordering::Relaxed);
        self.lock()
    }

    fn lock(&self) -> MutexGuard<'_, Tables> {
        self.tables.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Number of driver calls made so far.
    pub fn ops(&self) -> usize {
        self.ops.load(Ordering::Relaxed)
    }

    pub fn states(&self) -> Vec<SecurityAssociation> {
        self.lock().states.values().cloned().collect()
    }

    pub fn policies(&self) -> Vec<SecurityPolicy> {
        self.lock().policies.values().cloned().collect()
    }
}

impl XfrmDriver for MemoryXfrm {
    fn state_add(&self, sa: &SecurityAssociation) -> Result<()> {
        let mut tables = self.tables();
        let key = (sa.dst, sa.spi, sa.proto);
        if tables.states.contains_key(&key) {
            return Err(Error::AlreadyExists);
        }
        tables.states.insert(key, sa.clone());
        Ok(())
    }

    fn state_delete(&self, selector: &StateSelector) -> Result<()> {
        let mut tables = self.tables();
        let before = tables.states.len();
        tables.states.retain(|_, sa| !selector.matches(sa));
        if tables.states.len() == before {
            return Err(Error::NotFound);
        }
        Ok(())
    }

    fn state_list(&self) -> Result<Vec<SecurityAssociation>> {
        Ok(self.tables().states.values().cloned().collect())
    }

    fn policy_update(&self, policy: &SecurityPolicy) -> Result<()> {
        let mut tables = self.tables();
        tables.policies.insert(policy.selector(), policy.clone());
        Ok(())
    }

    fn policy_delete(&self, selector: &PolicySelector) -> Result<()> {
        let mut tables = self.tables();
        match tables.policies.remove(selector) {
            Some(_) => Ok(()),
            None => Err(Error::NotFound),
        }
    }

    fn policy_list(&self) -> Result<Vec<SecurityPolicy>> {
        Ok(self.tables().policies.values().cloned().collect())
    }
}

#[cfg(test)]
mod tests {
    use ipnetwork::IpNetwork;

    use super::*;
    use crate::keys::{KeyMaterial, XfrmAlgorithm};
    use crate::xfrm::{PolicyDirection, XfrmMark};

    fn key(spi: Spi) -> KeyMaterial {
        KeyMaterial {
            spi,
            req_id: 1,
            auth: XfrmAlgorithm::new("hmac(sha256)", vec![0; 32]),
            crypt: XfrmAlgorithm::new("cbc(aes)", vec![1; 16]),
        }
    }

    fn ip(s: &str) -> IpAddr {
        s.parse().expect("ip")
    }

    fn net(s: &str) -> IpNetwork {
        s.parse().expect("network")
    }

    #[test]
    fn state_add_twice_already_exists() -> Result<()> {
        let xfrm = MemoryXfrm::default();
        let sa = SecurityAssociation::tunnel(ip("10.0.0.1"), ip("10.0.0.2"), &key(1));
        xfrm.state_add(&sa)?;
        let err = xfrm.state_add(&sa).expect_err("duplicate");
        assert!(err.is_exists());
        assert_eq!(xfrm.states().len(), 1);
        assert_eq!(xfrm.ops(), 2);
        Ok(())
    }

    #[test]
    fn state_identity_includes_spi() -> Result<()> {
        let xfrm = MemoryXfrm::default();
        xfrm.state_add(&SecurityAssociation::tunnel(
            ip("10.0.0.1"),
            ip("10.0.0.2"),
            &key(1),
        ))?;
        xfrm.state_add(&SecurityAssociation::tunnel(
            ip("10.0.0.1"),
            ip("10.0.0.2"),
            &key(2),
        ))?;
        assert_eq!(xfrm.states().len(), 2);

        let selector = StateSelector {
            src: ip("10.0.0.1"),
            dst: ip("10.0.0.2"),
            proto: XfrmProto::Esp,
            spi: None,
        };
        xfrm.state_delete(&selector)?;
        assert!(xfrm.states().is_empty());
        assert!(matches!(xfrm.state_delete(&selector), Err(Error::NotFound)));
        Ok(())
    }

    #[test]
    fn policy_update_replaces() -> Result<()> {
        let xfrm = MemoryXfrm::default();
        let mut policy = SecurityPolicy {
            src: net("10.0.1.0/24"),
            dst: net("10.0.2.0/24"),
            dir: PolicyDirection::Out,
            mark: Some(XfrmMark::encrypt(1)),
            templates: vec![],
        };
        xfrm.policy_update(&policy)?;
        policy.templates = vec![crate::xfrm::PolicyTemplate {
            src: ip("10.0.1.1"),
            dst: ip("10.0.2.1"),
            proto: XfrmProto::Esp,
            mode: crate::xfrm::XfrmMode::Tunnel,
            spi: 1,
            req_id: 1,
        }];
        xfrm.policy_update(&policy)?;
        assert_eq!(xfrm.policies(), vec![policy.clone()]);

        xfrm.policy_delete(&policy.selector())?;
        assert!(xfrm.policies().is_empty());
        Ok(())
    }
}
