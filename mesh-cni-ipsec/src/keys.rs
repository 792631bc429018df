use std::fmt;
use std::net::IpAddr;

use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::{Error, Result};

/// Security parameter index. Doubles as the key generation.
pub type Spi = u8;

/// Only one association group is in use.
pub const DEFAULT_REQ_ID: u32 = 1;

/// Keys for any peer without a scoped entry live under `Wildcard`.
#[derive(Clone, Copy, Debug, Hash, PartialEq, Eq, PartialOrd, Ord)]
pub enum KeyScope {
    Wildcard,
    Peer(IpAddr),
}

impl fmt::Display for KeyScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            KeyScope::Wildcard => write!(f, "*"),
            KeyScope::Peer(ip) => write!(f, "{ip}"),
        }
    }
}

#[derive(Clone, PartialEq, Eq, Zeroize, ZeroizeOnDrop)]
pub struct XfrmAlgorithm {
    pub name: String,
    pub key: Vec<u8>,
}

impl XfrmAlgorithm {
    pub fn new(name: impl Into<String>, key: Vec<u8>) -> Self {
        Self {
            name: name.into(),
            key,
        }
    }
}

// key bytes never reach logs
impl fmt::Debug for XfrmAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("XfrmAlgorithm")
            .field("name", &self.name)
            .field("key", &format_args!("<{} bytes>", self.key.len()))
            .finish()
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct KeyMaterial {
    pub spi: Spi,
    pub req_id: u32,
    pub auth: XfrmAlgorithm,
    pub crypt: XfrmAlgorithm,
}

/// One parsed line of the key file.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct KeyRecord {
    pub scope: KeyScope,
    pub key: KeyMaterial,
}

/// Parses a single key line. Lines starting with an integer are versioned
/// (`spi auth-algo auth-key enc-algo enc-key [peer]`), anything else is the
/// legacy unversioned form (`auth-algo auth-key enc-algo enc-key`).
pub fn parse_line(line: &str, max_version: Spi) -> Result<KeyRecord> {
    let fields: Vec<&str> = line.split_whitespace().collect();
    if fields.len() < 4 {
        return Err(Error::InvalidKeyFormat(format!(
            "expected at least 4 fields, found {}",
            fields.len()
        )));
    }
    match fields[0].parse::<i64>() {
        Ok(version) => parse_versioned(version, &fields, max_version),
        Err(_) => parse_legacy(&fields),
    }
}

fn parse_versioned(version: i64, fields: &[&str], max_version: Spi) -> Result<KeyRecord> {
    let attempted = fields[0].to_string();
    if version == 0 {
        return Err(Error::ZeroKeyVersion {
            max: max_version,
            attempted,
        });
    }
    let spi = match Spi::try_from(version) {
        Ok(spi) if spi <= max_version => spi,
        _ => {
            return Err(Error::KeyVersionExhausted {
                max: max_version,
                attempted,
            });
        }
    };

    let (algorithms, scope) = match fields {
        [_, auth_name, auth_key, crypt_name, crypt_key] => {
            (
                [*auth_name, *auth_key, *crypt_name, *crypt_key],
                KeyScope::Wildcard,
            )
        }
        [_, auth_name, auth_key, crypt_name, crypt_key, peer] => {
            let peer: IpAddr = peer
                .parse()
                .map_err(|_| Error::InvalidKeyScope(peer.to_string()))?;
            (
                [*auth_name, *auth_key, *crypt_name, *crypt_key],
                KeyScope::Peer(peer),
            )
        }
        _ => {
            return Err(Error::InvalidKeyFormat(format!(
                "versioned key line expects 5 or 6 fields, found {}",
                fields.len()
            )));
        }
    };
    let key = key_material(spi, algorithms)?;
    Ok(KeyRecord { scope, key })
}

fn parse_legacy(fields: &[&str]) -> Result<KeyRecord> {
    let [auth_name, auth_key, crypt_name, crypt_key] = fields else {
        return Err(Error::InvalidKeyFormat(format!(
            "unversioned key line expects 4 fields, found {}",
            fields.len()
        )));
    };
    let key = key_material(1, [*auth_name, *auth_key, *crypt_name, *crypt_key])?;
    Ok(KeyRecord {
        scope: KeyScope::Wildcard,
        key,
    })
}

fn key_material(
    spi: Spi,
    [auth_name, auth_key, crypt_name, crypt_key]: [&str; 4],
) -> Result<KeyMaterial> {
    let auth = decode_key(auth_key).map_err(|source| Error::KeyDecode {
        kind: "auth",
        algorithm: auth_name.to_string(),
        source,
    })?;
    let crypt = decode_key(crypt_key).map_err(|source| Error::KeyDecode {
        kind: "enc",
        algorithm: crypt_name.to_string(),
        source,
    })?;
    Ok(KeyMaterial {
        spi,
        req_id: DEFAULT_REQ_ID,
        auth: XfrmAlgorithm::new(auth_name, auth),
        crypt: XfrmAlgorithm::new(crypt_name, crypt),
    })
}

/// Hex decodes a key, accepting an optional `0x` prefix.
pub fn decode_key(raw: &str) -> std::result::Result<Vec<u8>, hex::FromHexError> {
    hex::decode(raw.strip_prefix("0x").unwrap_or(raw))
}
