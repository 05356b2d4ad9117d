//! Expand rules along their paths into per-device access lists.
//!
//! Every filtering router on a path gets one entry per (source address,
//! destination address, protocol). Transit traffic is filtered at the
//! egress interface in ACL `<hardware>_out`, addresses resolved with the
//! NAT set seen there; traffic addressed to the device itself lands in
//! `<hardware>_in` of the interface it arrives at.
//!
//! Finally each ACL is ordered deny before permit, duplicates are merged
//! and entries fully covered by another entry with the same action and log
//! tag are dropped as secondary.

use std::collections::{BTreeMap, HashMap, HashSet};

use ipnetwork::IpNetwork;
use tracing::{debug, trace};

use crate::addr::covers;
use crate::diag::Diagnostics;
use crate::model::{IntfId, NatSet, Object, RouterId, Topology};
use crate::nat::{check_dynamic_nat, nat_set_at, object_addresses, NatError};
use crate::path::{PathEngine, PathNode};
use crate::protocol::Protocol;
use crate::service::Rule;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct AclEntry {
    pub deny: bool,
    pub src: IpNetwork,
    pub dst: IpNetwork,
    pub prt: Protocol,
    pub log: Option<String>,
}

impl AclEntry {
    /// True if `self` matches every packet `other` matches, with the same effect.
    pub fn covers(&self, other: &AclEntry) -> bool {
        self.deny == other.deny
            && self.log == other.log
            && covers(self.src, other.src)
            && covers(self.dst, other.dst)
            && self.prt.covers(&other.prt)
    }
}

/// ACLs of one device; fragments of a split router share one entry.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeviceAcls {
    pub model: Option<String>,
    pub acls: BTreeMap<String, Vec<AclEntry>>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RuleSet {
    pub devices: BTreeMap<String, DeviceAcls>,
    /// Entries dropped because a broader entry covers them.
    pub secondary: usize,
    /// Entries merged with an identical one.
    pub duplicates: usize,
}

impl RuleSet {
    pub fn acl(&self, device: &str, name: &str) -> &[AclEntry] {
        self.devices
            .get(device)
            .and_then(|d| d.acls.get(name))
            .map_or(&[], Vec::as_slice)
    }
}

struct Assembler<'a> {
    topo: &'a Topology,
    diag: &'a Diagnostics,
    raw: BTreeMap<String, DeviceAcls>,
    nat_sets: HashMap<IntfId, NatSet>,
    unstable: HashSet<(Object, String, String)>,
    hidden: HashSet<(Object, String)>,
    no_path: HashSet<(String, PathNode, PathNode)>,
}

impl<'a> Assembler<'a> {
    fn nat_set(&mut self, intf: IntfId) -> NatSet {
        let topo = self.topo;
        self.nat_sets
            .entry(intf)
            .or_insert_with(|| nat_set_at(topo, intf))
            .clone()
    }

    fn acl_name(&self, intf: IntfId, suffix: &str) -> String {
        let intf = self.topo.intf(intf);
        let hw = intf
            .hardware
            .as_deref()
            .unwrap_or_else(|| Topology::short_name(&intf.name));
        format!("{hw}_{suffix}")
    }

    fn addresses(&mut self, obj: Object, set: &NatSet, rule: &Rule, router: &str) -> Vec<IpNetwork> {
        if !check_dynamic_nat(self.topo, obj, set, router, &mut self.unstable, self.diag) {
            return Vec::new();
        }
        match object_addresses(self.topo, obj, set) {
            Ok(addrs) => addrs,
            Err(NatError::Hidden { object, tag }) => {
                if self.hidden.insert((obj, rule.service.clone())) {
                    self.diag.error(format!(
                        "{object} is hidden by nat:{tag} in rule of {}",
                        rule.service
                    ));
                }
                Vec::new()
            }
            Err(NatError::NoAddress { object }) => {
                if self.hidden.insert((obj, rule.service.clone())) {
                    self.diag
                        .error(format!("{object} has no IP address, used in {}", rule.service));
                }
                Vec::new()
            }
        }
    }

    /// Emit entries for `srcs` to `dsts` at `router`, filtered at `intf`.
    fn emit(
        &mut self,
        rule: &Rule,
        router: RouterId,
        intf: IntfId,
        suffix: &str,
        srcs: &[Object],
        dsts: &[Object],
    ) -> usize {
        let topo = self.topo;
        let r = topo.router(router);
        let set = self.nat_set(intf);
        let src_addrs: Vec<IpNetwork> = srcs
            .iter()
            .flat_map(|&obj| self.addresses(obj, &set, rule, &r.name))
            .collect();
        let dst_addrs: Vec<IpNetwork> = dsts
            .iter()
            .flat_map(|&obj| self.addresses(obj, &set, rule, &r.name))
            .collect();
        let name = self.acl_name(intf, suffix);
        let device = self.raw.entry(r.device.clone()).or_insert_with(|| DeviceAcls {
            model: r.model.clone(),
            acls: BTreeMap::new(),
        });
        let acl = device.acls.entry(name).or_default();
        let mut count = 0;
        for &src in &src_addrs {
            for &dst in &dst_addrs {
                for &prt in &rule.prt {
                    acl.push(AclEntry {
                        deny: rule.deny,
                        src,
                        dst,
                        prt,
                        log: rule.log.clone(),
                    });
                    count += 1;
                }
            }
        }
        count
    }

    /// Returns the number of entries created for one rule.
    fn expand_rule(&mut self, paths: &mut PathEngine, rule: &Rule) -> usize {
        let topo = self.topo;
        let by_node = |objects: &[Object]| {
            let mut grouped: BTreeMap<PathNode, Vec<Object>> = BTreeMap::new();
            for &obj in objects {
                if let Some(node) = PathEngine::node_of(topo, obj) {
                    grouped.entry(node).or_default().push(obj);
                }
            }
            grouped
        };
        let src_nodes = by_node(&rule.src);
        let dst_nodes = by_node(&rule.dst);
        let mut count = 0;
        for (&from, srcs) in &src_nodes {
            for (&to, dsts) in &dst_nodes {
                if from == to {
                    continue;
                }
                let walk = match paths.walk(topo, from, to) {
                    Ok(walk) => walk,
                    Err(e) => {
                        trace!(error = %e, "path lookup failed");
                        if self.no_path.insert((rule.service.clone(), from, to)) {
                            self.diag.error(format!(
                                "No valid path\n from {}\n to {}\n for rule of {}\n Check path restrictions and crypto interfaces.",
                                PathEngine::node_name(topo, from),
                                PathEngine::node_name(topo, to),
                                rule.service
                            ));
                        }
                        continue;
                    }
                };
                for hop in &walk.hops {
                    if !topo.router(hop.router).filters() {
                        continue;
                    }
                    // Traffic starting at the device itself is not filtered.
                    match (hop.in_intf, hop.out_intf) {
                        (Some(_), Some(out)) => {
                            count += self.emit(rule, hop.router, out, "out", srcs, dsts);
                        }
                        (Some(input), None) => {
                            count += self.emit(rule, hop.router, input, "in", srcs, dsts);
                        }
                        (None, _) => {}
                    }
                }
            }
        }
        count
    }
}

/// Drop duplicate and secondary entries; deny entries go first.
fn optimize_acl(entries: Vec<AclEntry>, set: &mut RuleSet) -> Vec<AclEntry> {
    let (deny, permit): (Vec<AclEntry>, Vec<AclEntry>) = entries.into_iter().partition(|e| e.deny);
    let mut seen = HashSet::new();
    let mut unique = Vec::new();
    for entry in deny.into_iter().chain(permit) {
        if seen.insert(entry.clone()) {
            unique.push(entry);
        } else {
            set.duplicates += 1;
        }
    }
    let kept: Vec<AclEntry> = unique
        .iter()
        .enumerate()
        .filter(|&(i, entry)| {
            !unique
                .iter()
                .enumerate()
                .any(|(j, other)| i != j && other.covers(entry))
        })
        .map(|(_, entry)| entry.clone())
        .collect();
    set.secondary += unique.len() - kept.len();
    kept
}

/// Walk every rule through the topology and collect the resulting ACLs.
pub fn assemble_acls(topo: &Topology, paths: &mut PathEngine, rules: &[Rule], diag: &Diagnostics) -> RuleSet {
    let mut assembler = Assembler {
        topo,
        diag,
        raw: BTreeMap::new(),
        nat_sets: HashMap::new(),
        unstable: HashSet::new(),
        hidden: HashSet::new(),
        no_path: HashSet::new(),
    };
    let mut per_service: BTreeMap<&str, usize> = BTreeMap::new();
    for rule in rules {
        let errors = diag.error_count();
        let count = assembler.expand_rule(paths, rule);
        let entry = per_service.entry(rule.service.as_str()).or_default();
        // Services with errors are not reported as unenforceable.
        if errors != diag.error_count() {
            *entry = usize::MAX;
        } else {
            *entry = entry.saturating_add(count);
        }
    }
    for (service, count) in per_service {
        if count == 0 {
            diag.warning(format!("{service} is fully unenforceable"));
        }
    }

    let mut set = RuleSet::default();
    for (device, acls) in std::mem::take(&mut assembler.raw) {
        let mut out = DeviceAcls {
            model: acls.model,
            acls: BTreeMap::new(),
        };
        for (name, entries) in acls.acls {
            let optimized = optimize_acl(entries, &mut set);
            out.acls.insert(name, optimized);
        }
        set.devices.insert(device, out);
    }
    debug!(
        devices = set.devices.len(),
        secondary = set.secondary,
        duplicates = set.duplicates,
        "access lists assembled"
    );
    set
}
