//! JSON output for device code generators and the ownership report.
//!
//! Layout of an output directory:
//!
//! - `<device>`: model and access lists of one device
//! - `owner/<owner>/nat_set`: combined NAT tags active for one owner
//! - `objects`: real and translated addresses of every object

use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::Path;

use ipnetwork::IpNetwork;
use serde::Serialize;
use thiserror::Error;

use crate::acl::{AclEntry, DeviceAcls, RuleSet};
use crate::diag::Diagnostics;
use crate::model::{IntfAddr, IntfId, NatSet, NetworkId, Object, Topology};
use crate::nat::{combine_nat_sets, object_addresses, NatError};

/// Errors that can occur while writing output files.
#[derive(Debug, Error)]
pub enum WriteError {
    /// Failed to serialize JSON.
    #[error("failed to encode JSON: {0}")]
    Json(#[from] serde_json::Error),
    /// Failed to write output file.
    #[error("failed to write output file: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Serialize)]
struct DeviceCode<'a> {
    model: Option<&'a str>,
    acls: Vec<AclCode>,
}

#[derive(Debug, Serialize)]
struct AclCode {
    name: String,
    rules: Vec<RuleCode>,
}

#[derive(Debug, PartialEq, Serialize)]
struct RuleCode {
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    deny: bool,
    src: Vec<String>,
    dst: Vec<String>,
    prt: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    log: Option<String>,
}

/// Host prefixes are printed without length.
pub fn format_addr(addr: IpNetwork) -> String {
    let full = if addr.is_ipv4() { 32 } else { 128 };
    if addr.prefix() == full {
        addr.ip().to_string()
    } else {
        addr.to_string()
    }
}

/// Join neighbouring entries that differ only in protocol.
fn rule_code(entries: &[AclEntry]) -> Vec<RuleCode> {
    let mut out: Vec<RuleCode> = Vec::new();
    for entry in entries {
        let src = vec![format_addr(entry.src)];
        let dst = vec![format_addr(entry.dst)];
        if let Some(last) = out.last_mut() {
            if last.deny == entry.deny && last.log == entry.log && last.src == src && last.dst == dst {
                last.prt.push(entry.prt.to_string());
                continue;
            }
        }
        out.push(RuleCode {
            deny: entry.deny,
            src,
            dst,
            prt: vec![entry.prt.to_string()],
            log: entry.log.clone(),
        });
    }
    out
}

/// Serialize the access lists of one device into JSON bytes.
pub fn write_device(device: &DeviceAcls) -> Result<Vec<u8>, WriteError> {
    let code = DeviceCode {
        model: device.model.as_deref(),
        acls: device
            .acls
            .iter()
            .map(|(name, entries)| AclCode {
                name: name.clone(),
                rules: rule_code(entries),
            })
            .collect(),
    };
    let mut bytes = serde_json::to_vec_pretty(&code)?;
    bytes.push(b'\n');
    Ok(bytes)
}

/// Write one file per device into `dir`; returns the number of files.
pub fn write_code(rules: &RuleSet, dir: &Path) -> Result<usize, WriteError> {
    fs::create_dir_all(dir)?;
    for (device, acls) in &rules.devices {
        let bytes = write_device(acls)?;
        fs::write(dir.join(Topology::short_name(device)), bytes)?;
    }
    Ok(rules.devices.len())
}

/// Address and NAT addresses of one object.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ObjectInfo {
    pub ip: String,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub nat: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct NatExport {
    /// Active NAT tags per owner.
    pub owners: BTreeMap<String, Vec<String>>,
    pub objects: BTreeMap<String, ObjectInfo>,
}

fn format_addrs(result: Result<Vec<IpNetwork>, NatError>) -> Option<String> {
    match result {
        Ok(addrs) => Some(addrs.into_iter().map(format_addr).collect::<Vec<_>>().join(",")),
        Err(NatError::Hidden { .. }) => Some("hidden".to_string()),
        Err(NatError::NoAddress { .. }) => None,
    }
}

fn object_info(topo: &Topology, obj: Object, network: Option<NetworkId>) -> Option<ObjectInfo> {
    let ip = format_addrs(object_addresses(topo, obj, &NatSet::new()))?;
    let tags: Vec<&String> = match obj {
        Object::Aggregate(id) => topo.aggregate(id).nat.keys().collect(),
        _ => network.map(|n| topo.network(n).nat.keys().collect()).unwrap_or_default(),
    };
    let nat = tags
        .into_iter()
        .filter_map(|tag| {
            let set: NatSet = [tag.as_str()].into_iter().collect();
            let addr = format_addrs(object_addresses(topo, obj, &set))?;
            Some((tag.clone(), addr))
        })
        .collect();
    Some(ObjectInfo { ip, nat })
}

/// Combined NAT sets per owner and addresses of all objects.
///
/// Networks seen at different addresses by one owner are reported as a
/// warning and shown with their real address.
pub fn nat_export(topo: &Topology, diag: &Diagnostics) -> NatExport {
    let mut export = NatExport::default();

    let mut owner_domains: BTreeMap<&str, BTreeSet<usize>> = BTreeMap::new();
    for net in &topo.networks {
        let (Some(owner), Some(zone)) = (&net.owner, net.zone) else {
            continue;
        };
        if let Some(domain) = topo.zone(zone).nat_domain {
            owner_domains.entry(owner.as_str()).or_default().insert(domain.index());
        }
    }
    for owner in topo.owners.keys() {
        let sets: Vec<&NatSet> = owner_domains
            .get(owner.as_str())
            .map(|ids| ids.iter().map(|&d| &topo.nat_domains[d].nat_set).collect())
            .unwrap_or_default();
        let combined = combine_nat_sets(topo, &sets);
        for net in &combined.conflicts {
            diag.warning(format!(
                "{} is visible at different addresses for {owner}, using its real address",
                topo.network(*net).name
            ));
        }
        export
            .owners
            .insert(owner.clone(), combined.set.tags().map(str::to_string).collect());
    }

    for (idx, net) in topo.networks.iter().enumerate() {
        if net.tunnel {
            continue;
        }
        let id = NetworkId(idx);
        if let Some(info) = object_info(topo, Object::Network(id), Some(id)) {
            export.objects.insert(net.name.clone(), info);
        }
        for &host in &net.hosts {
            if let Some(info) = object_info(topo, Object::Host(host), Some(id)) {
                export.objects.insert(topo.host(host).name.clone(), info);
            }
        }
    }
    for (idx, intf) in topo.interfaces.iter().enumerate() {
        if !matches!(intf.addr, IntfAddr::Ip(_)) || intf.split_other.is_some() {
            continue;
        }
        let obj = Object::Interface(IntfId(idx));
        if let Some(info) = object_info(topo, obj, Some(intf.network)) {
            export.objects.insert(intf.name.clone(), info);
        }
    }
    for (name, ids) in &topo.aggregate_names {
        if let Some(&first) = ids.first() {
            if let Some(info) = object_info(topo, Object::Aggregate(first), None) {
                export.objects.insert(name.clone(), info);
            }
        }
    }
    export
}

/// Write `owner/<owner>/nat_set` files and the `objects` file below `dir`.
pub fn write_nat_export(export: &NatExport, dir: &Path) -> Result<(), WriteError> {
    for (owner, tags) in &export.owners {
        let owner_dir = dir.join("owner").join(Topology::short_name(owner));
        fs::create_dir_all(&owner_dir)?;
        fs::write(owner_dir.join("nat_set"), serde_json::to_vec_pretty(tags)?)?;
    }
    fs::create_dir_all(dir)?;
    fs::write(dir.join("objects"), serde_json::to_vec_pretty(&export.objects)?)?;
    Ok(())
}
