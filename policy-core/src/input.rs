//! Serde model of the object tree handed to the compiler.
//!
//! The tree is a plain description of the policy: networks with hosts,
//! routers with interfaces, areas, path restrictions, crypto definitions,
//! groups, protocols and services. All cross references are typed names
//! such as `network:n1` or `interface:r1.n1`; they are resolved during
//! setup, not here.

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use serde::Deserialize;
use thiserror::Error;

/// Errors that can occur while loading an [`ObjectTree`].
#[derive(Debug, Error)]
pub enum InputError {
    /// Failed to read input file.
    #[error("failed to read input file {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    /// JSON input did not match the object tree schema.
    #[error("failed to parse JSON input: {0}")]
    Json(#[from] serde_json::Error),
    /// TOML input did not match the object tree schema.
    #[error("failed to parse TOML input: {0}")]
    Toml(#[from] toml::de::Error),
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ObjectTree {
    pub networks: Vec<NetworkDef>,
    pub aggregates: Vec<AggregateDef>,
    pub routers: Vec<RouterDef>,
    pub areas: Vec<AreaDef>,
    pub pathrestrictions: Vec<PathRestrictionDef>,
    pub crypto: Vec<CryptoDef>,
    pub groups: Vec<GroupDef>,
    pub protocols: Vec<ProtocolDef>,
    pub protocolgroups: Vec<GroupDef>,
    pub services: Vec<ServiceDef>,
    pub owners: Vec<OwnerDef>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct NatDef {
    pub ip: Option<String>,
    pub hidden: bool,
    pub identity: bool,
    pub dynamic: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct NetworkDef {
    pub name: String,
    pub ip: Option<String>,
    pub unnumbered: bool,
    pub subnet_of: Option<String>,
    pub owner: Option<String>,
    pub disabled: bool,
    pub nat: BTreeMap<String, NatDef>,
    pub hosts: Vec<HostDef>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct HostDef {
    pub name: String,
    pub ip: Option<String>,
    /// Address range written as `first-last`.
    pub range: Option<String>,
    pub owner: Option<String>,
    pub nat: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct AggregateDef {
    pub name: String,
    pub link: String,
    pub ip: Option<String>,
    pub owner: Option<String>,
    pub nat: BTreeMap<String, NatDef>,
}

/// `managed` may be written as boolean or as one of the management kinds.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(untagged)]
pub enum ManagedDef {
    Flag(bool),
    Kind(String),
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RouterDef {
    pub name: String,
    pub managed: Option<ManagedDef>,
    pub model: Option<String>,
    pub owner: Option<String>,
    pub disabled: bool,
    pub interfaces: Vec<InterfaceDef>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct VirtualDef {
    pub ip: String,
    #[serde(rename = "type")]
    pub kind: Option<String>,
    pub id: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct InterfaceDef {
    /// Attached network, e.g. `network:n1`; a plain name for loopback interfaces.
    pub network: String,
    pub ip: Option<String>,
    pub unnumbered: bool,
    pub negotiated: bool,
    pub loopback: bool,
    pub hardware: Option<String>,
    pub bind_nat: Vec<String>,
    pub hub: Vec<String>,
    pub spoke: Option<String>,
    #[serde(rename = "virtual")]
    pub redundancy: Option<VirtualDef>,
    pub nat: BTreeMap<String, String>,
    pub owner: Option<String>,
    pub disabled: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct AreaDef {
    pub name: String,
    pub anchor: Option<String>,
    pub border: Vec<String>,
    pub inclusive_border: Vec<String>,
    pub owner: Option<String>,
    pub nat: BTreeMap<String, NatDef>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct PathRestrictionDef {
    pub name: String,
    pub elements: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct CryptoDef {
    pub name: String,
    pub bind_nat: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct GroupDef {
    pub name: String,
    pub elements: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ProtocolDef {
    pub name: String,
    pub value: String,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Action {
    #[default]
    Permit,
    Deny,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RuleDef {
    pub action: Action,
    pub src: Vec<String>,
    pub dst: Vec<String>,
    pub prt: Vec<String>,
    pub log: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ServiceDef {
    pub name: String,
    pub description: Option<String>,
    pub disabled: bool,
    pub user: Vec<String>,
    pub rules: Vec<RuleDef>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct OwnerDef {
    pub name: String,
    pub admins: Vec<String>,
}

/// Parse a JSON object tree.
pub fn parse_json(raw: &str) -> Result<ObjectTree, InputError> {
    Ok(serde_json::from_str(raw)?)
}

/// Parse a TOML object tree.
pub fn parse_toml(raw: &str) -> Result<ObjectTree, InputError> {
    Ok(toml::from_str(raw)?)
}

/// Load an object tree from `path`; `*.toml` files are read as TOML, anything else as JSON.
pub fn parse_file(path: &Path) -> Result<ObjectTree, InputError> {
    let raw = fs::read_to_string(path).map_err(|source| InputError::Io {
        path: path.display().to_string(),
        source,
    })?;
    match path.extension().and_then(|ext| ext.to_str()) {
        Some("toml") => parse_toml(&raw),
        _ => parse_json(&raw),
    }
}

#[cfg(test)]
mod tests {
    use super::{parse_json, parse_toml, Action, ManagedDef};

    #[test]
    fn parses_minimal_json_tree() {
        let tree = parse_json(
            r#"{
                "networks": [{ "name": "network:n1", "ip": "10.1.1.0/24",
                               "hosts": [{ "name": "host:h1", "ip": "10.1.1.10" }] }],
                "routers": [{ "name": "router:r1", "managed": true, "model": "ASA",
                              "interfaces": [{ "network": "network:n1", "ip": "10.1.1.1",
                                               "hardware": "inside" }] }]
            }"#,
        )
        .expect("parse");
        assert_eq!(tree.networks.len(), 1);
        assert_eq!(tree.networks[0].hosts[0].name, "host:h1");
        assert_eq!(tree.routers[0].managed, Some(ManagedDef::Flag(true)));
    }

    #[test]
    fn parses_rules_and_virtual_interfaces_from_toml() {
        let tree = parse_toml(
            r#"
[[routers]]
name = "router:r1"
managed = "routing_only"
model = "IOS"

[[routers.interfaces]]
network = "network:n1"
ip = "10.1.1.2"
virtual = { ip = "10.1.1.1", type = "VRRP", id = "7" }

[[services]]
name = "service:s1"
user = ["network:n1"]

[[services.rules]]
action = "deny"
src = ["user"]
dst = ["network:n2"]
prt = ["tcp 22"]
"#,
        )
        .expect("parse");
        let intf = &tree.routers[0].interfaces[0];
        let redundancy = intf.redundancy.as_ref().expect("virtual");
        assert_eq!(redundancy.kind.as_deref(), Some("VRRP"));
        assert_eq!(tree.services[0].rules[0].action, Action::Deny);
        assert_eq!(
            tree.routers[0].managed,
            Some(ManagedDef::Kind("routing_only".to_string()))
        );
    }

    #[test]
    fn rejects_unknown_attributes() {
        let err = parse_json(r#"{ "networks": [{ "name": "network:n1", "mask": "24" }] }"#)
            .expect_err("unknown field");
        assert!(err.to_string().contains("mask"));
    }
}
