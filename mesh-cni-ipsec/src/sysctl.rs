use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};

use tracing::info;

use crate::Result;

const IPV6_FORWARDING: &str = "sys/net/ipv6/conf/all/forwarding";

/// Turns on IPv6 forwarding, which the kernel requires before it accepts
/// IPv6 tunnel mode policies in the forward direction.
pub fn enable_ipv6_forwarding(proc_root: impl AsRef<Path>) -> Result<()> {
    let mut path = PathBuf::new();
    path.push(proc_root);
    path.push(IPV6_FORWARDING);

    info!(path = %path.display(), "enabling ipv6 forwarding");
    let mut file = OpenOptions::new().write(true).truncate(true).open(path)?;
    file.write_all(b"1")?;
    Ok(())
}
