//! Driver backed by iproute2's `ip xfrm`.
//!
//! Listings are parsed back into typed entries for the reclaimer. Records the
//! parser does not understand (socket policies, other protocols, SPIs wider
//! than the mark can carry) are skipped, since nothing in this crate could
//! have installed them.

use std::ffi::OsString;
use std::io::Write;
use std::net::IpAddr;
use std::process::{Command, Stdio};

use ipnetwork::IpNetwork;
use tracing::{debug, trace};
use zeroize::Zeroizing;

use crate::keys::{self, Spi, XfrmAlgorithm};
use crate::xfrm::{
    PolicyDirection, PolicySelector, PolicyTemplate, SecurityAssociation, SecurityPolicy,
    StateSelector, XfrmDriver, XfrmMark, XfrmMode, XfrmProto,
};
use crate::{Error, Result};

pub struct IpXfrm {
    program: OsString,
}

impl Default for IpXfrm {
    fn default() -> Self {
        Self::new("ip")
    }
}

impl IpXfrm {
    pub fn new(program: impl Into<OsString>) -> Self {
        Self {
            program: program.into(),
        }
    }

    /// `ip` reads the command from stdin so key material never shows up in
    /// the process argv.
    fn command(&self) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.args(["-batch", "-"])
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        cmd
    }

    fn run(&self, args: &[String]) -> Result<String> {
        trace!(op = %operation(args), "ip xfrm");
        let mut child = self.command().spawn()?;
        let written = child.stdin.take().map(|mut stdin| {
            let line = Zeroizing::new(batch_line(args));
            stdin.write_all(line.as_bytes())
        });
        let output = child.wait_with_output()?;
        if output.status.success() {
            if let Some(Err(e)) = written {
                return Err(e.into());
            }
            return Ok(String::from_utf8_lossy(&output.stdout).into_owned());
        }
        let stderr = String::from_utf8_lossy(&output.stderr);
        Err(classify(args, stderr.trim()))
    }
}

fn batch_line(args: &[String]) -> String {
    format!("xfrm {}\n", args.join(" "))
}

/// Object and command only, the rest may carry keys.
fn operation(args: &[String]) -> String {
    args.iter().take(2).cloned().collect::<Vec<_>>().join(" ")
}

fn classify(args: &[String], stderr: &str) -> Error {
    if stderr.contains("File exists") {
        Error::AlreadyExists
    } else if stderr.contains("No such") {
        Error::NotFound
    } else {
        Error::Driver(format!("ip xfrm {}: {stderr}", operation(args)))
    }
}

impl XfrmDriver for IpXfrm {
    fn state_add(&self, sa: &SecurityAssociation) -> Result<()> {
        self.run(&Zeroizing::new(state_add_args(sa))).map(drop)
    }

    fn state_delete(&self, selector: &StateSelector) -> Result<()> {
        self.run(&state_delete_args(selector)).map(drop)
    }

    fn state_list(&self) -> Result<Vec<SecurityAssociation>> {
        let out = self.run(&args([&"state", &"list"]))?;
        Ok(parse_states(&out))
    }

    fn policy_update(&self, policy: &SecurityPolicy) -> Result<()> {
        self.run(&policy_update_args(policy)).map(drop)
    }

    fn policy_delete(&self, selector: &PolicySelector) -> Result<()> {
        self.run(&policy_delete_args(selector)).map(drop)
    }

    fn policy_list(&self) -> Result<Vec<SecurityPolicy>> {
        let out = self.run(&args([&"policy", &"list"]))?;
        Ok(parse_policies(&out))
    }
}

fn args<const N: usize>(parts: [&dyn ToString; N]) -> Vec<String> {
    parts.iter().map(|p| p.to_string()).collect()
}

fn spi_arg(spi: Spi) -> String {
    format!("0x{spi:08x}")
}

fn mark_args(mark: Option<XfrmMark>) -> Vec<String> {
    match mark {
        Some(m) => args([
            &"mark",
            &format!("0x{:x}", m.value),
            &"mask",
            &format!("0x{:x}", m.mask),
        ]),
        None => vec![],
    }
}

fn algorithm_args(kind: &str, alg: &XfrmAlgorithm) -> Vec<String> {
    args([&kind, &alg.name, &format!("0x{}", hex::encode(&alg.key))])
}

fn state_add_args(sa: &SecurityAssociation) -> Vec<String> {
    let mut out = args([
        &"state",
        &"add",
        &"src",
        &sa.src,
        &"dst",
        &sa.dst,
        &"proto",
        &sa.proto,
        &"spi",
        &spi_arg(sa.spi),
        &"reqid",
        &sa.req_id,
        &"mode",
        &sa.mode,
    ]);
    if let Some(auth) = &sa.auth {
        out.extend(algorithm_args("auth", auth));
    }
    if let Some(crypt) = &sa.crypt {
        out.extend(algorithm_args("enc", crypt));
    }
    if sa.esn {
        out.extend(args([&"flag", &"esn"]));
    }
    out
}

fn state_delete_args(selector: &StateSelector) -> Vec<String> {
    match selector.spi {
        Some(spi) => args([
            &"state",
            &"delete",
            &"src",
            &selector.src,
            &"dst",
            &selector.dst,
            &"proto",
            &selector.proto,
            &"spi",
            &spi_arg(spi),
        ]),
        None => args([
            &"state",
            &"deleteall",
            &"src",
            &selector.src,
            &"dst",
            &selector.dst,
            &"proto",
            &selector.proto,
        ]),
    }
}

fn policy_update_args(policy: &SecurityPolicy) -> Vec<String> {
    let mut out = args([
        &"policy",
        &"update",
        &"src",
        &policy.src,
        &"dst",
        &policy.dst,
        &"dir",
        &policy.dir,
    ]);
    out.extend(mark_args(policy.mark));
    for tmpl in &policy.templates {
        out.extend(args([
            &"tmpl",
            &"src",
            &tmpl.src,
            &"dst",
            &tmpl.dst,
            &"proto",
            &tmpl.proto,
            &"spi",
            &spi_arg(tmpl.spi),
            &"reqid",
            &tmpl.req_id,
            &"mode",
            &tmpl.mode,
        ]));
    }
    out
}

fn policy_delete_args(selector: &PolicySelector) -> Vec<String> {
    let mut out = args([
        &"policy",
        &"delete",
        &"src",
        &selector.src,
        &"dst",
        &selector.dst,
        &"dir",
        &selector.dir,
    ]);
    out.extend(mark_args(selector.mark));
    out
}

/// Splits listing output into records; a record starts at every line that is
/// not indented.
fn records(out: &str) -> Vec<Vec<Vec<&str>>> {
    let mut records: Vec<Vec<Vec<&str>>> = vec![];
    for line in out.lines() {
        let tokens: Vec<&str> = line.split_whitespace().collect();
        if tokens.is_empty() {
            continue;
        }
        if !line.starts_with(char::is_whitespace) || records.is_empty() {
            records.push(vec![tokens]);
        } else if let Some(record) = records.last_mut() {
            record.push(tokens);
        }
    }
    records
}

fn value<'a>(tokens: &[&'a str], key: &str) -> Option<&'a str> {
    tokens
        .iter()
        .position(|t| *t == key)
        .and_then(|i| tokens.get(i + 1))
        .copied()
}

fn parse_hex_u32(raw: &str) -> Option<u32> {
    u32::from_str_radix(raw.trim_start_matches("0x"), 16).ok()
}

fn parse_spi(raw: &str) -> Option<Spi> {
    parse_hex_u32(raw).and_then(|spi| Spi::try_from(spi).ok())
}

fn parse_proto(raw: &str) -> Option<XfrmProto> {
    match raw {
        "esp" => Some(XfrmProto::Esp),
        "ah" => Some(XfrmProto::Ah),
        _ => None,
    }
}

fn parse_mode(raw: &str) -> Option<XfrmMode> {
    match raw {
        "tunnel" => Some(XfrmMode::Tunnel),
        "transport" => Some(XfrmMode::Transport),
        _ => None,
    }
}

fn parse_dir(raw: &str) -> Option<PolicyDirection> {
    match raw {
        "in" => Some(PolicyDirection::In),
        "out" => Some(PolicyDirection::Out),
        "fwd" => Some(PolicyDirection::Fwd),
        _ => None,
    }
}

fn parse_mark(raw: &str) -> Option<XfrmMark> {
    let (value, mask) = raw.split_once('/').unwrap_or((raw, "0xffffffff"));
    Some(XfrmMark {
        value: parse_hex_u32(value)?,
        mask: parse_hex_u32(mask)?,
    })
}

fn parse_algorithm(tokens: &[&str]) -> Option<XfrmAlgorithm> {
    let name = tokens.get(1)?;
    let key = keys::decode_key(tokens.get(2)?).ok()?;
    Some(XfrmAlgorithm::new(*name, key))
}

fn parse_ip(tokens: &[&str], key: &str) -> Option<IpAddr> {
    value(tokens, key)?.parse().ok()
}

fn parse_net(tokens: &[&str], key: &str) -> Option<IpNetwork> {
    value(tokens, key)?.parse().ok()
}

fn parse_state(record: &[Vec<&str>]) -> Option<SecurityAssociation> {
    let (head, body) = record.split_first()?;
    let mut sa = SecurityAssociation {
        src: parse_ip(head, "src")?,
        dst: parse_ip(head, "dst")?,
        proto: XfrmProto::Esp,
        mode: XfrmMode::Tunnel,
        spi: 0,
        req_id: 0,
        auth: None,
        crypt: None,
        esn: false,
    };
    let mut seen_spi = false;
    for tokens in body {
        match tokens.first().copied() {
            Some("proto") => {
                sa.proto = parse_proto(value(tokens, "proto")?)?;
                sa.spi = parse_spi(value(tokens, "spi")?)?;
                sa.req_id = value(tokens, "reqid").and_then(|r| r.parse().ok())?;
                sa.mode = parse_mode(value(tokens, "mode")?)?;
                seen_spi = true;
            }
            Some("auth" | "auth-trunc") => sa.auth = parse_algorithm(tokens),
            Some("enc") => sa.crypt = parse_algorithm(tokens),
            _ if tokens.contains(&"flag") && tokens.contains(&"esn") => sa.esn = true,
            _ => {}
        }
    }
    seen_spi.then_some(sa)
}

fn parse_policy(record: &[Vec<&str>]) -> Option<SecurityPolicy> {
    let (head, body) = record.split_first()?;
    let src = parse_net(head, "src")?;
    let dst = parse_net(head, "dst")?;
    let mut dir = None;
    let mut mark = None;
    let mut templates = vec![];
    let mut tmpl_addrs = None;

    for tokens in body {
        match tokens.first().copied() {
            Some("dir") => dir = parse_dir(value(tokens, "dir")?),
            Some("mark") => mark = parse_mark(value(tokens, "mark")?),
            Some("tmpl") => {
                tmpl_addrs = Some((parse_ip(tokens, "src")?, parse_ip(tokens, "dst")?));
            }
            Some("proto") => {
                let (src, dst) = tmpl_addrs.take()?;
                templates.push(PolicyTemplate {
                    src,
                    dst,
                    proto: parse_proto(value(tokens, "proto")?)?,
                    spi: parse_spi(value(tokens, "spi")?)?,
                    req_id: value(tokens, "reqid").and_then(|r| r.parse().ok())?,
                    mode: parse_mode(value(tokens, "mode")?)?,
                });
            }
            _ => {}
        }
    }

    Some(SecurityPolicy {
        src,
        dst,
        dir: dir?,
        mark,
        templates,
    })
}

pub fn parse_states(out: &str) -> Vec<SecurityAssociation> {
    records(out)
        .iter()
        .filter_map(|record| {
            let sa = parse_state(record);
            if sa.is_none() {
                debug!(record = ?record.first(), "skipping unrecognized xfrm state");
            }
            sa
        })
        .collect()
}

pub fn parse_policies(out: &str) -> Vec<SecurityPolicy> {
    records(out)
        .iter()
        .filter_map(|record| {
            let policy = parse_policy(record);
            if policy.is_none() {
                debug!(record = ?record.first(), "skipping unrecognized xfrm policy");
            }
            policy
        })
        .collect()
}
