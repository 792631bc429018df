//! Kernel security database (SAD/SPD) entries and the driver seam used to
//! program them.

pub mod iproute;
pub mod memory;

use std::fmt;
use std::net::IpAddr;

use ipnetwork::IpNetwork;

use crate::Result;
use crate::keys::{KeyMaterial, Spi, XfrmAlgorithm};

// Mark layout shared with the datapath: bits 8-11 carry the route mark,
// bits 12-15 the SPI.
pub const ROUTE_MARK_DECRYPT: u32 = 0x0D00;
pub const ROUTE_MARK_ENCRYPT: u32 = 0x0E00;
pub const ROUTE_MARK_MASK: u32 = 0x0F00;
pub const IPSEC_MARK_MASK: u32 = 0xFF00;
pub const SPI_MARK_SHIFT: u32 = 12;

/// Largest SPI that still fits in the mark.
pub const MAX_MARK_SPI: Spi = (IPSEC_MARK_MASK >> SPI_MARK_SHIFT) as Spi;

#[derive(Clone, Copy, Debug, Default, Hash, PartialEq, Eq)]
pub enum XfrmMode {
    Transport,
    #[default]
    Tunnel,
}

impl fmt::Display for XfrmMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            XfrmMode::Transport => write!(f, "transport"),
            XfrmMode::Tunnel => write!(f, "tunnel"),
        }
    }
}

#[derive(Clone, Copy, Debug, Default, Hash, PartialEq, Eq)]
pub enum XfrmProto {
    #[default]
    Esp,
    Ah,
}

impl fmt::Display for XfrmProto {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            XfrmProto::Esp => write!(f, "esp"),
            XfrmProto::Ah => write!(f, "ah"),
        }
    }
}

#[derive(Clone, Copy, Debug, Hash, PartialEq, Eq)]
pub enum PolicyDirection {
    In,
    Out,
    Fwd,
}

impl fmt::Display for PolicyDirection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PolicyDirection::In => write!(f, "in"),
            PolicyDirection::Out => write!(f, "out"),
            PolicyDirection::Fwd => write!(f, "fwd"),
        }
    }
}

#[derive(Clone, Copy, Debug, Hash, PartialEq, Eq)]
pub struct XfrmMark {
    pub value: u32,
    pub mask: u32,
}

impl XfrmMark {
    pub fn decrypt(spi: Spi) -> Self {
        Self::with_route_mark(spi, ROUTE_MARK_DECRYPT)
    }

    pub fn encrypt(spi: Spi) -> Self {
        Self::with_route_mark(spi, ROUTE_MARK_ENCRYPT)
    }

    fn with_route_mark(spi: Spi, route_mark: u32) -> Self {
        Self {
            value: (u32::from(spi) << SPI_MARK_SHIFT) | route_mark,
            mask: IPSEC_MARK_MASK,
        }
    }

    /// True for marks this crate installs on encrypt or decrypt policies.
    pub fn is_ipsec(&self) -> bool {
        let route = self.value & ROUTE_MARK_MASK;
        route == ROUTE_MARK_DECRYPT || route == ROUTE_MARK_ENCRYPT
    }
}

/// SAD entry. The kernel finds it by (dst, spi, proto).
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SecurityAssociation {
    pub src: IpAddr,
    pub dst: IpAddr,
    pub proto: XfrmProto,
    pub mode: XfrmMode,
    pub spi: Spi,
    pub req_id: u32,
    pub auth: Option<XfrmAlgorithm>,
    pub crypt: Option<XfrmAlgorithm>,
    pub esn: bool,
}

impl SecurityAssociation {
    /// Tunnel mode ESP association carrying `key`.
    pub fn tunnel(src: IpAddr, dst: IpAddr, key: &KeyMaterial) -> Self {
        Self {
            src,
            dst,
            proto: XfrmProto::Esp,
            mode: XfrmMode::Tunnel,
            spi: key.spi,
            req_id: key.req_id,
            auth: Some(key.auth.clone()),
            crypt: Some(key.crypt.clone()),
            esn: false,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PolicyTemplate {
    pub src: IpAddr,
    pub dst: IpAddr,
    pub proto: XfrmProto,
    pub mode: XfrmMode,
    pub spi: Spi,
    pub req_id: u32,
}

/// SPD entry. The kernel identifies it by (src, dst, dir, mark).
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SecurityPolicy {
    pub src: IpNetwork,
    pub dst: IpNetwork,
    pub dir: PolicyDirection,
    pub mark: Option<XfrmMark>,
    pub templates: Vec<PolicyTemplate>,
}

impl SecurityPolicy {
    pub fn selector(&self) -> PolicySelector {
        PolicySelector {
            src: self.src,
            dst: self.dst,
            dir: self.dir,
            mark: self.mark,
        }
    }

    /// SPI of the association the first template selects.
    pub fn spi(&self) -> Option<Spi> {
        self.templates.first().map(|t| t.spi)
    }
}

/// Selects associations for deletion. Without an SPI every association
/// between `src` and `dst` for `proto` matches.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct StateSelector {
    pub src: IpAddr,
    pub dst: IpAddr,
    pub proto: XfrmProto,
    pub spi: Option<Spi>,
}

impl StateSelector {
    pub fn matches(&self, sa: &SecurityAssociation) -> bool {
        sa.src == self.src
            && sa.dst == self.dst
            && sa.proto == self.proto
            && self.spi.is_none_or(|spi| spi == sa.spi)
    }
}

impl From<&SecurityAssociation> for StateSelector {
    fn from(sa: &SecurityAssociation) -> Self {
        Self {
            src: sa.src,
            dst: sa.dst,
            proto: sa.proto,
            spi: Some(sa.spi),
        }
    }
}

#[derive(Clone, Copy, Debug, Hash, PartialEq, Eq)]
pub struct PolicySelector {
    pub src: IpNetwork,
    pub dst: IpNetwork,
    pub dir: PolicyDirection,
    pub mark: Option<XfrmMark>,
}

/// Kernel security database operations. Calls are synchronous and may block
/// on the kernel; async callers should run them on the blocking pool.
pub trait XfrmDriver: Send + Sync {
    /// Adds an association, failing with [`crate::Error::AlreadyExists`] if
    /// one with the same identity is installed.
    fn state_add(&self, sa: &SecurityAssociation) -> Result<()>;
    fn state_delete(&self, selector: &StateSelector) -> Result<()>;
    fn state_list(&self) -> Result<Vec<SecurityAssociation>>;
    /// Adds or replaces a policy.
    fn policy_update(&self, policy: &SecurityPolicy) -> Result<()>;
    fn policy_delete(&self, selector: &PolicySelector) -> Result<()>;
    fn policy_list(&self) -> Result<Vec<SecurityPolicy>>;
}
