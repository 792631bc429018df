//! SAD/SPD programming for one endpoint pair.
//!
//! The kernel looks associations up by (daddr, saddr, reqid, encap),
//! (daddr, wildcard, reqid, encap) and (mark, daddr, spi, proto, encap), then
//! checks the SPI of any hit. A policy/state match therefore needs one state
//! per destination address, and since IPsec is unidirectional a node programs
//! an inbound and an outbound association for every peer.
//!
//! Keys are resolved per entry: an association uses the key scoped to its
//! source address, a policy the key scoped to its destination address. With a
//! single wildcard key the two agree.

use std::fmt;
use std::net::IpAddr;
use std::sync::Arc;

use ipnetwork::IpNetwork;
use tracing::{debug, warn};

use crate::keys::{KeyMaterial, Spi};
use crate::registry::KeyRegistry;
use crate::xfrm::{
    PolicyDirection, PolicyTemplate, SecurityAssociation, SecurityPolicy, StateSelector,
    XfrmDriver, XfrmMark, XfrmMode, XfrmProto,
};
use crate::{Error, Result};

#[derive(Clone, Copy, Debug, PartialEq, Eq, clap::ValueEnum)]
pub enum Direction {
    In,
    Out,
    Both,
}

impl Direction {
    fn inbound(self) -> bool {
        matches!(self, Direction::In | Direction::Both)
    }

    fn outbound(self) -> bool {
        matches!(self, Direction::Out | Direction::Both)
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::In => write!(f, "in"),
            Direction::Out => write!(f, "out"),
            Direction::Both => write!(f, "both"),
        }
    }
}

/// One direction's association and the policies selecting it.
#[derive(Debug)]
struct Half {
    dir: PolicyDirection,
    state: SecurityAssociation,
    policies: Vec<SecurityPolicy>,
}

impl Half {
    fn inbound(registry: &KeyRegistry, local: IpNetwork, remote: IpNetwork) -> Result<Self> {
        let state_key = lookup(registry, remote.ip())?;
        let policy_key = lookup(registry, local.ip())?;
        let state = SecurityAssociation::tunnel(remote.ip(), local.ip(), &state_key);
        let policies = [PolicyDirection::In, PolicyDirection::Fwd]
            .into_iter()
            .map(|dir| SecurityPolicy {
                src: remote,
                dst: local,
                dir,
                mark: Some(XfrmMark::decrypt(policy_key.spi)),
                templates: vec![template(&policy_key, remote.ip(), local.ip())],
            })
            .collect();
        Ok(Self {
            dir: PolicyDirection::In,
            state,
            policies,
        })
    }

    fn outbound(registry: &KeyRegistry, local: IpNetwork, remote: IpNetwork) -> Result<Self> {
        let state_key = lookup(registry, local.ip())?;
        let policy_key = lookup(registry, remote.ip())?;
        let state = SecurityAssociation::tunnel(local.ip(), remote.ip(), &state_key);
        let policy = SecurityPolicy {
            src: local,
            dst: remote,
            dir: PolicyDirection::Out,
            mark: Some(XfrmMark::encrypt(policy_key.spi)),
            templates: vec![template(&policy_key, local.ip(), remote.ip())],
        };
        Ok(Self {
            dir: PolicyDirection::Out,
            state,
            policies: vec![policy],
        })
    }

    fn apply<D: XfrmDriver + ?Sized>(&self, driver: &D) -> Result<Spi> {
        if let Err(e) = driver.state_add(&self.state)
            && !e.is_exists()
        {
            return Err(Error::ReplaceState {
                dir: self.dir,
                source: Box::new(e),
            });
        }
        debug!(
            src = %self.state.src,
            dst = %self.state.dst,
            spi = self.state.spi,
            dir = %self.dir,
            "replaced IPsec state"
        );
        for policy in &self.policies {
            if let Err(e) = driver.policy_update(policy)
                && !e.is_exists()
            {
                return Err(Error::ReplacePolicy {
                    dir: policy.dir,
                    source: Box::new(e),
                });
            }
            debug!(
                src = %policy.src,
                dst = %policy.dst,
                dir = %policy.dir,
                "replaced IPsec policy"
            );
        }
        Ok(self.state.spi)
    }
}

fn lookup(registry: &KeyRegistry, ip: IpAddr) -> Result<Arc<KeyMaterial>> {
    registry.get(ip).ok_or(Error::KeyMissing(ip))
}

fn template(key: &KeyMaterial, src: IpAddr, dst: IpAddr) -> PolicyTemplate {
    PolicyTemplate {
        src,
        dst,
        proto: XfrmProto::Esp,
        mode: XfrmMode::Tunnel,
        spi: key.spi,
        req_id: key.req_id,
    }
}

/// Installs the associations and policies carrying traffic between `local`
/// and `remote` in `dir`, returning the SPI of the last association written.
/// Keys are resolved before the first kernel call, so a missing key leaves the
/// kernel untouched. Entries that already exist count as installed.
pub fn upsert_endpoint<D: XfrmDriver + ?Sized>(
    driver: &D,
    registry: &KeyRegistry,
    local: IpNetwork,
    remote: IpNetwork,
    dir: Direction,
) -> Result<Spi> {
    // traffic between two addresses of the same host is never encrypted
    if local.ip() == remote.ip() {
        return Ok(0);
    }

    let inbound = dir
        .inbound()
        .then(|| Half::inbound(registry, local, remote))
        .transpose()?;
    let outbound = dir
        .outbound()
        .then(|| Half::outbound(registry, local, remote))
        .transpose()?;

    let mut spi = 0;
    for half in inbound.iter().chain(outbound.iter()) {
        spi = half.apply(driver)?;
    }
    Ok(spi)
}

/// Removes the associations between `peer` and `local`. Failures are logged
/// and never returned.
pub fn delete_endpoint<D: XfrmDriver + ?Sized>(
    driver: &D,
    peer: IpAddr,
    local: IpAddr,
) -> Result<()> {
    let inbound = StateSelector {
        src: peer,
        dst: local,
        proto: XfrmProto::Esp,
        spi: None,
    };
    if let Err(e) = driver.state_delete(&inbound) {
        warn!(%peer, %e, "unable to delete IPsec (stateIn) context");
    }

    let outbound = StateSelector {
        src: local,
        dst: peer,
        proto: XfrmProto::Esp,
        spi: None,
    };
    if let Err(e) = driver.state_delete(&outbound) {
        warn!(%peer, %e, "unable to delete IPsec (stateOut) context");
    }

    if let Err(e) = delete_policies(peer, local) {
        warn!(%peer, %e, "unable to delete IPsec (policy) context");
    }
    Ok(())
}

// Policies are keyed by subnet, which a delete does not know. They are
// overwritten by the next upsert for the subnet pair and stale generations are
// dropped by the SPI reclaim sweep.
fn delete_policies(peer: IpAddr, local: IpAddr) -> Result<()> {
    debug!(%peer, %local, "skipping IPsec policy removal");
    Ok(())
}
