//! Protocol descriptions used in rules.
//!
//! Supported forms:
//!
//! - `ip`
//! - `tcp`, `tcp 80`, `tcp 1024-65535`, `tcp 1024-65535:80` (source:destination)
//! - `udp ...` like tcp
//! - `icmp`, `icmp 8`, `icmp 3/13`
//! - `proto 50`
//!
//! Named protocols (`protocol:x`) and protocol groups (`protocolgroup:x`)
//! are resolved recursively by [`ProtocolTable`].

use std::collections::HashMap;
use std::fmt;

use crate::diag::Diagnostics;
use crate::input::ObjectTree;
use crate::setup::check_typed;

/// Inclusive port range.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PortRange {
    pub lo: u16,
    pub hi: u16,
}

impl PortRange {
    pub const ALL: PortRange = PortRange { lo: 1, hi: 65535 };

    pub fn covers(self, other: PortRange) -> bool {
        self.lo <= other.lo && other.hi <= self.hi
    }

    fn is_all(self) -> bool {
        self == Self::ALL
    }
}

impl fmt::Display for PortRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.lo == self.hi {
            write!(f, "{}", self.lo)
        } else {
            write!(f, "{}-{}", self.lo, self.hi)
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Protocol {
    Ip,
    Tcp { src: PortRange, dst: PortRange },
    Udp { src: PortRange, dst: PortRange },
    Icmp { kind: Option<u8>, code: Option<u8> },
    Proto(u8),
}

impl Protocol {
    /// True if every packet matched by `other` is matched by `self`.
    pub fn covers(&self, other: &Protocol) -> bool {
        match (self, other) {
            (Protocol::Ip, _) => true,
            (Protocol::Tcp { src: s1, dst: d1 }, Protocol::Tcp { src: s2, dst: d2 })
            | (Protocol::Udp { src: s1, dst: d1 }, Protocol::Udp { src: s2, dst: d2 }) => {
                s1.covers(*s2) && d1.covers(*d2)
            }
            (Protocol::Icmp { kind: None, .. }, Protocol::Icmp { .. }) => true,
            (
                Protocol::Icmp {
                    kind: Some(k1),
                    code: None,
                },
                Protocol::Icmp { kind: Some(k2), .. },
            ) => k1 == k2,
            (Protocol::Icmp { kind: k1, code: c1 }, Protocol::Icmp { kind: k2, code: c2 }) => {
                k1 == k2 && c1 == c2
            }
            (Protocol::Proto(a), Protocol::Proto(b)) => a == b,
            _ => false,
        }
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Protocol::Ip => write!(f, "ip"),
            Protocol::Tcp { src, dst } | Protocol::Udp { src, dst } => {
                let name = if matches!(self, Protocol::Tcp { .. }) { "tcp" } else { "udp" };
                match (src.is_all(), dst.is_all()) {
                    (true, true) => write!(f, "{name}"),
                    (true, false) => write!(f, "{name} {dst}"),
                    (false, _) => write!(f, "{name} {src}:{dst}"),
                }
            }
            Protocol::Icmp { kind: None, .. } => write!(f, "icmp"),
            Protocol::Icmp {
                kind: Some(kind),
                code: None,
            } => write!(f, "icmp {kind}"),
            Protocol::Icmp {
                kind: Some(kind),
                code: Some(code),
            } => write!(f, "icmp {kind}/{code}"),
            Protocol::Proto(n) => write!(f, "proto {n}"),
        }
    }
}

fn parse_port(raw: &str) -> Result<u16, String> {
    match raw.trim().parse::<u16>() {
        Ok(port) if port > 0 => Ok(port),
        _ => Err(format!("Expected port number between 1 and 65535, got '{}'", raw.trim())),
    }
}

fn parse_range(raw: &str) -> Result<PortRange, String> {
    let raw = raw.trim();
    if raw.is_empty() {
        return Ok(PortRange::ALL);
    }
    let (lo, hi) = match raw.split_once('-') {
        Some((lo, hi)) => (parse_port(lo)?, parse_port(hi)?),
        None => {
            let port = parse_port(raw)?;
            (port, port)
        }
    };
    if lo > hi {
        return Err(format!("Invalid port range '{raw}'"));
    }
    Ok(PortRange { lo, hi })
}

fn parse_u8(raw: &str, what: &str) -> Result<u8, String> {
    raw.trim()
        .parse::<u8>()
        .map_err(|_| format!("Expected {what} between 0 and 255, got '{}'", raw.trim()))
}

/// Parse one literal protocol.
pub fn parse_protocol(raw: &str) -> Result<Protocol, String> {
    let raw = raw.trim();
    let (name, rest) = raw.split_once(char::is_whitespace).unwrap_or((raw, ""));
    let rest = rest.trim();
    match name {
        "ip" if rest.is_empty() => Ok(Protocol::Ip),
        "tcp" | "udp" => {
            let (src, dst) = match rest.split_once(':') {
                Some((src, dst)) => (parse_range(src)?, parse_range(dst)?),
                None => (PortRange::ALL, parse_range(rest)?),
            };
            Ok(if name == "tcp" {
                Protocol::Tcp { src, dst }
            } else {
                Protocol::Udp { src, dst }
            })
        }
        "icmp" => {
            if rest.is_empty() {
                return Ok(Protocol::Icmp {
                    kind: None,
                    code: None,
                });
            }
            let (kind, code) = match rest.split_once('/') {
                Some((kind, code)) => (parse_u8(kind, "icmp type")?, Some(parse_u8(code, "icmp code")?)),
                None => (parse_u8(rest, "icmp type")?, None),
            };
            Ok(Protocol::Icmp {
                kind: Some(kind),
                code,
            })
        }
        "proto" => {
            let n = parse_u8(rest, "protocol number")?;
            match n {
                1 => Err("Must not use 'proto 1', use 'icmp' instead".to_string()),
                6 => Err("Must not use 'proto 6', use 'tcp' instead".to_string()),
                17 => Err("Must not use 'proto 17', use 'udp' instead".to_string()),
                n => Ok(Protocol::Proto(n)),
            }
        }
        _ => Err(format!("Unknown protocol '{raw}'")),
    }
}

/// Named protocols and protocol groups of one object tree.
#[derive(Debug, Default)]
pub struct ProtocolTable {
    named: HashMap<String, String>,
    groups: HashMap<String, Vec<String>>,
}

impl ProtocolTable {
    pub fn new(tree: &ObjectTree, diag: &Diagnostics) -> Self {
        let mut table = Self::default();
        for def in &tree.protocols {
            if !check_typed(&def.name, "protocol", diag) {
                continue;
            }
            if table.named.insert(def.name.clone(), def.value.clone()).is_some() {
                diag.error(format!("Duplicate definition of {}", def.name));
            }
        }
        for def in &tree.protocolgroups {
            if !check_typed(&def.name, "protocolgroup", diag) {
                continue;
            }
            if table.groups.insert(def.name.clone(), def.elements.clone()).is_some() {
                diag.error(format!("Duplicate definition of {}", def.name));
            }
        }
        table
    }

    /// Expand protocol references of a rule, keeping their order without duplicates.
    pub fn expand(&self, refs: &[String], context: &str, diag: &Diagnostics) -> Vec<Protocol> {
        let mut out = Vec::new();
        let mut visiting = Vec::new();
        for name in refs {
            self.expand_one(name, context, &mut visiting, &mut out, diag);
        }
        out
    }

    fn expand_one(
        &self,
        name: &str,
        context: &str,
        visiting: &mut Vec<String>,
        out: &mut Vec<Protocol>,
        diag: &Diagnostics,
    ) {
        let push = |prt: Protocol, out: &mut Vec<Protocol>| {
            if !out.contains(&prt) {
                out.push(prt);
            }
        };
        if name.starts_with("protocol:") {
            match self.named.get(name) {
                Some(value) => match parse_protocol(value) {
                    Ok(prt) => push(prt, out),
                    Err(e) => diag.error(format!("{e} in {name}")),
                },
                None => diag.error(format!("Can't resolve reference to {name} in {context}")),
            }
            return;
        }
        if name.starts_with("protocolgroup:") {
            let Some(elements) = self.groups.get(name) else {
                diag.error(format!("Can't resolve reference to {name} in {context}"));
                return;
            };
            if visiting.iter().any(|v| v == name) {
                diag.error(format!("Found recursion in definition of {name}"));
                return;
            }
            visiting.push(name.to_string());
            for element in elements {
                self.expand_one(element, name, visiting, out, diag);
            }
            visiting.pop();
            return;
        }
        match parse_protocol(name) {
            Ok(prt) => push(prt, out),
            Err(e) => diag.error(format!("{e} in {context}")),
        }
    }
}
