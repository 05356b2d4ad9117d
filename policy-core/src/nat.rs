//! NAT domains, NAT tag distribution and address resolution.
//!
//! ## Domains
//!
//! Zones joined by routers whose interfaces bind identical NAT tags form a
//! NAT domain. Every zone belongs to exactly one domain and every domain
//! has one immutable [`NatSet`] of active tags.
//!
//! ## Distribution
//!
//! A tag bound at an interface becomes active in the domain at the network
//! side of that interface and spreads from there through routers into
//! neighbour domains. It does not pass a router whose interface towards
//! the current domain binds the same tag, and it stops where another tag
//! of the same multi-NAT group takes over.
//!
//! ## Combination
//!
//! [`combine_nat_sets`] merges the views of several domains. Per network the
//! views form a commutative monoid: hidden is the neutral element, equal
//! addresses stay, different addresses fall back to the real address.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::net::IpAddr;

use ipnetwork::IpNetwork;
use thiserror::Error;
use tracing::debug;

use crate::addr::{host_prefix, map_into, range_to_prefixes};
use crate::diag::{CompileError, Diagnostics};
use crate::model::{
    HostAddr, IntfAddr, IntfId, NatDef, NatDomain, NatDomainId, NatKind, NatSet, NetworkId, Object,
    Topology, ZoneId,
};

/// Why an object has no usable address in some NAT domain.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum NatError {
    #[error("{object} is hidden by nat:{tag}")]
    Hidden { object: String, tag: String },
    #[error("{object} has no IP address")]
    NoAddress { object: String },
}

/// Flood-fill zones into NAT domains.
pub fn set_nat_domains(topo: &mut Topology, diag: &Diagnostics) -> Result<(), CompileError> {
    for start in 0..topo.zones.len() {
        if topo.zones[start].nat_domain.is_some() {
            continue;
        }
        let did = NatDomainId(topo.nat_domains.len());
        let mut domain = NatDomain::default();
        let mut stack = vec![ZoneId(start)];
        while let Some(z) = stack.pop() {
            if topo.zones[z.0].nat_domain.is_some() {
                continue;
            }
            topo.zones[z.0].nat_domain = Some(did);
            domain.zones.push(z);
            for &intf in &topo.zones[z.0].interfaces {
                let rid = topo.intf(intf).router;
                if !domain.routers.contains(&rid) {
                    domain.routers.push(rid);
                }
                for &other in &topo.router(rid).interfaces {
                    if other != intf && topo.intf(other).bind_nat == topo.intf(intf).bind_nat {
                        stack.extend(topo.intf(other).zone);
                    }
                }
            }
        }
        domain.zones.sort();
        domain.routers.sort();
        domain.name = domain
            .zones
            .iter()
            .map(|&z| topo.zone(z).name.as_str())
            .min()
            .map(|first| format!("nat_domain:{}", Topology::short_name(first)))
            .unwrap_or_default();
        topo.nat_domains.push(domain);
    }
    if let Some(zone) = topo.zones.iter().find(|z| z.nat_domain.is_none()) {
        return Err(diag.abort(format!("{} was not assigned to any NAT domain", zone.name)));
    }
    check_nat_consistency(topo, diag);
    debug!(domains = topo.nat_domains.len(), "NAT domains created");
    Ok(())
}

fn bind_nat_text(tags: &[String]) -> String {
    if tags.is_empty() {
        "(none)".to_string()
    } else {
        tags.join(",")
    }
}

/// Interfaces of one router inside one domain must bind the same tags.
fn check_nat_consistency(topo: &Topology, diag: &Diagnostics) {
    for router in &topo.routers {
        let mut seen: BTreeMap<NatDomainId, IntfId> = BTreeMap::new();
        for &intf in &router.interfaces {
            let Some(domain) = topo.intf_nat_domain(intf) else {
                continue;
            };
            match seen.get(&domain) {
                Some(&first) if topo.intf(first).bind_nat != topo.intf(intf).bind_nat => {
                    diag.error(format!(
                        "Inconsistent NAT in loop at {}:\n - {}: {}\n - {}: {}",
                        router.name,
                        topo.intf(first).name,
                        bind_nat_text(&topo.intf(first).bind_nat),
                        topo.intf(intf).name,
                        bind_nat_text(&topo.intf(intf).bind_nat)
                    ));
                    break;
                }
                Some(_) => {}
                None => {
                    seen.insert(domain, intf);
                }
            }
        }
    }
}

fn defined_tags(topo: &Topology) -> BTreeSet<String> {
    let networks = topo.networks.iter().flat_map(|n| n.nat.keys());
    let aggregates = topo.aggregates.iter().flat_map(|a| a.nat.keys());
    networks.chain(aggregates).cloned().collect()
}

/// Tags defined together at one network, transitively.
fn multi_nat_groups(topo: &Topology) -> HashMap<String, BTreeSet<String>> {
    let mut groups: HashMap<String, BTreeSet<String>> = HashMap::new();
    for network in &topo.networks {
        if network.nat.len() < 2 {
            continue;
        }
        let mut merged: BTreeSet<String> = network.nat.keys().cloned().collect();
        for tag in network.nat.keys() {
            if let Some(group) = groups.get(tag) {
                merged.extend(group.iter().cloned());
            }
        }
        for tag in &merged {
            groups.insert(tag.clone(), merged.clone());
        }
    }
    groups
}

/// Compute the active tag set of every NAT domain and check the result.
pub fn distribute_nat(topo: &mut Topology, diag: &Diagnostics) {
    let defined = defined_tags(topo);
    let multi = multi_nat_groups(topo);
    let mut active: Vec<BTreeSet<String>> = vec![BTreeSet::new(); topo.nat_domains.len()];
    let mut bound = BTreeSet::new();
    for (idx, intf) in topo.interfaces.iter().enumerate() {
        for tag in &intf.bind_nat {
            bound.insert(tag.clone());
            if !defined.contains(tag) {
                diag.warning(format!("Ignoring useless nat:{tag} bound at {}", intf.name));
                continue;
            }
            if let Some(start) = topo.intf_nat_domain(IntfId(idx)) {
                spread_tag(topo, tag, start, &multi, &mut active);
            }
        }
    }
    for tag in defined.difference(&bound) {
        diag.warning(format!("nat:{tag} is defined, but not bound to any interface"));
    }
    for (domain, tags) in topo.nat_domains.iter_mut().zip(&active) {
        domain.nat_set = tags.iter().cloned().collect();
    }
    check_multi_nat(topo, diag);
    check_nat_in_own_domain(topo, diag);
}

fn spread_tag(
    topo: &Topology,
    tag: &str,
    start: NatDomainId,
    multi: &HashMap<String, BTreeSet<String>>,
    active: &mut [BTreeSet<String>],
) {
    let rivals = multi.get(tag);
    let mut stack = vec![start];
    while let Some(d) = stack.pop() {
        if !active[d.0].insert(tag.to_string()) {
            continue;
        }
        for &rid in &topo.nat_domain(d).routers {
            let router = topo.router(rid);
            let blocked = router.interfaces.iter().any(|&i| {
                topo.intf_nat_domain(i) == Some(d) && topo.intf(i).bind_nat.iter().any(|t| t == tag)
            });
            if blocked {
                continue;
            }
            for &out in &router.interfaces {
                let Some(next) = topo.intf_nat_domain(out) else {
                    continue;
                };
                if next == d {
                    continue;
                }
                let replaced = rivals.is_some_and(|group| {
                    topo.intf(out)
                        .bind_nat
                        .iter()
                        .any(|t| t != tag && group.contains(t))
                });
                if !replaced {
                    stack.push(next);
                }
            }
        }
    }
}

fn check_multi_nat(topo: &Topology, diag: &Diagnostics) {
    let mut reported = HashSet::new();
    for network in &topo.networks {
        let tags: Vec<&String> = network
            .nat
            .iter()
            .filter(|(_, def)| def.kind != NatKind::Identity)
            .map(|(tag, _)| tag)
            .collect();
        if tags.len() < 2 {
            continue;
        }
        for (d, domain) in topo.nat_domains.iter().enumerate() {
            let on: Vec<&&String> = tags.iter().filter(|t| domain.nat_set.contains(t)).collect();
            if on.len() < 2 {
                continue;
            }
            if reported.insert((on[0].to_string(), on[1].to_string(), d)) {
                diag.error(format!(
                    "Grouped NAT tags '{}' and '{}' of {} must not both be active in {}",
                    on[0], on[1], network.name, domain.name
                ));
            }
        }
    }
}

fn check_nat_in_own_domain(topo: &Topology, diag: &Diagnostics) {
    for network in &topo.networks {
        let Some(domain) = network.zone.and_then(|z| topo.zone(z).nat_domain) else {
            continue;
        };
        let set = &topo.nat_domain(domain).nat_set;
        for (tag, def) in &network.nat {
            if def.kind == NatKind::Identity || !set.contains(tag) {
                continue;
            }
            let binders: Vec<&str> = topo
                .interfaces
                .iter()
                .filter(|i| i.bind_nat.contains(tag))
                .map(|i| i.name.as_str())
                .collect();
            diag.error(format!(
                "{} is translated by nat:{tag},\n but is located inside the translation domain of {tag}.\n Probably {tag} was bound to wrong interface at\n - {}",
                network.name,
                binders.join("\n - ")
            ));
        }
    }
}

/// NAT set seen at the network side of `intf`.
pub fn nat_set_at(topo: &Topology, intf: IntfId) -> NatSet {
    topo.intf_nat_domain(intf)
        .map(|d| topo.nat_domain(d).nat_set.clone())
        .unwrap_or_default()
}

/// Active NAT definition of a network for `set`.
fn active_nat<'a>(nat: &'a BTreeMap<String, NatDef>, set: &NatSet) -> Option<&'a NatDef> {
    nat.values().find(|def| set.contains(&def.tag))
}

fn translate_host(
    topo: &Topology,
    object: &str,
    network: NetworkId,
    real: &[IpNetwork],
    statics: &BTreeMap<String, IpAddr>,
    set: &NatSet,
) -> Result<Vec<IpNetwork>, NatError> {
    let net = topo.network(network);
    let Some(def) = active_nat(&net.nat, set) else {
        return Ok(real.to_vec());
    };
    match &def.kind {
        NatKind::Hidden => Err(NatError::Hidden {
            object: object.to_string(),
            tag: def.tag.clone(),
        }),
        NatKind::Identity => Ok(real.to_vec()),
        NatKind::Translated(pool) if def.dynamic => Ok(match statics.get(&def.tag) {
            Some(&ip) => vec![host_prefix(ip)],
            None => vec![*pool],
        }),
        NatKind::Translated(pool) => {
            let Some(from) = net.addr else {
                return Ok(real.to_vec());
            };
            Ok(real
                .iter()
                .filter_map(|p| IpNetwork::new(map_into(p.network(), from, *pool), p.prefix()).ok())
                .collect())
        }
    }
}

/// Addresses of `obj` as seen by a device with NAT set `set`.
///
/// Host ranges resolve to several prefixes; everything else to one.
pub fn object_addresses(topo: &Topology, obj: Object, set: &NatSet) -> Result<Vec<IpNetwork>, NatError> {
    let name = topo.object_name(obj).to_string();
    match obj {
        Object::Network(id) => {
            let net = topo.network(id);
            let Some(real) = net.addr else {
                return Err(NatError::NoAddress { object: name });
            };
            match active_nat(&net.nat, set).map(|def| (&def.kind, &def.tag)) {
                Some((NatKind::Hidden, tag)) => Err(NatError::Hidden {
                    object: name,
                    tag: tag.clone(),
                }),
                Some((NatKind::Translated(pool), _)) => Ok(vec![*pool]),
                Some((NatKind::Identity, _)) | None => Ok(vec![real]),
            }
        }
        Object::Host(id) => {
            let host = topo.host(id);
            let real = match host.addr {
                HostAddr::Single(ip) => vec![host_prefix(ip)],
                HostAddr::Range(lo, hi) => range_to_prefixes(lo, hi),
            };
            translate_host(topo, &name, host.network, &real, &host.nat, set)
        }
        Object::Interface(id) => {
            let intf = topo.intf(id);
            match intf.addr {
                IntfAddr::Ip(ip) => {
                    translate_host(topo, &name, intf.network, &[host_prefix(ip)], &intf.nat, set)
                }
                IntfAddr::Negotiated => object_addresses(topo, Object::Network(intf.network), set)
                    .map_err(|_| NatError::NoAddress { object: name }),
                IntfAddr::Unnumbered | IntfAddr::Tunnel => Err(NatError::NoAddress { object: name }),
            }
        }
        Object::Aggregate(id) => {
            let agg = topo.aggregate(id);
            match active_nat(&agg.nat, set).map(|def| (&def.kind, &def.tag)) {
                Some((NatKind::Hidden, tag)) => Err(NatError::Hidden {
                    object: name,
                    tag: tag.clone(),
                }),
                Some((NatKind::Translated(pool), _)) => Ok(vec![*pool]),
                Some((NatKind::Identity, _)) | None => Ok(vec![agg.addr]),
            }
        }
    }
}

/// Tag of a dynamic translation that leaves `obj` without a stable address.
///
/// Hosts and interfaces of a dynamically translated network need a static
/// entry for every active dynamic tag; otherwise they share the pool.
pub fn unstable_nat_tag<'a>(topo: &'a Topology, obj: Object, set: &NatSet) -> Option<&'a str> {
    let (network, statics) = match obj {
        Object::Host(id) => (topo.host(id).network, &topo.host(id).nat),
        Object::Interface(id) => (topo.intf(id).network, &topo.intf(id).nat),
        Object::Network(_) | Object::Aggregate(_) => return None,
    };
    let def = active_nat(&topo.network(network).nat, set)?;
    match def.kind {
        NatKind::Translated(_) if def.dynamic && !statics.contains_key(&def.tag) => Some(&def.tag),
        _ => None,
    }
}

/// Report hosts and interfaces without stable address at a filtering hop.
///
/// Returns false if an error was reported.
pub fn check_dynamic_nat(
    topo: &Topology,
    obj: Object,
    set: &NatSet,
    router: &str,
    reported: &mut HashSet<(Object, String, String)>,
    diag: &Diagnostics,
) -> bool {
    let Some(tag) = unstable_nat_tag(topo, obj, set) else {
        return true;
    };
    if reported.insert((obj, tag.to_string(), router.to_string())) {
        diag.error(format!(
            "Unstable NAT: {} needs static translation for nat:{tag} at {router}",
            topo.object_name(obj)
        ));
    }
    false
}

/// How one network appears under one or more NAT sets.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NatView {
    /// Hidden by the given tags.
    Hidden(BTreeSet<String>),
    /// Visible at `addr`; `tags` is empty for the real address.
    Visible {
        addr: Option<IpNetwork>,
        tags: BTreeSet<String>,
    },
    /// Different addresses were seen.
    Mixed,
}

impl NatView {
    /// View of `network` under `set`.
    pub fn of(topo: &Topology, network: NetworkId, set: &NatSet) -> Self {
        let net = topo.network(network);
        match active_nat(&net.nat, set) {
            Some(NatDef {
                kind: NatKind::Hidden,
                tag,
                ..
            }) => Self::Hidden(BTreeSet::from([tag.clone()])),
            Some(NatDef {
                kind: NatKind::Translated(pool),
                tag,
                ..
            }) => Self::Visible {
                addr: Some(*pool),
                tags: BTreeSet::from([tag.clone()]),
            },
            Some(NatDef {
                kind: NatKind::Identity,
                ..
            })
            | None => Self::Visible {
                addr: net.addr,
                tags: BTreeSet::new(),
            },
        }
    }

    /// Commutative and associative merge with `Hidden(∅)` as neutral element.
    pub fn combine(self, other: Self) -> Self {
        match (self, other) {
            (Self::Mixed, _) | (_, Self::Mixed) => Self::Mixed,
            (Self::Hidden(mut a), Self::Hidden(b)) => {
                a.extend(b);
                Self::Hidden(a)
            }
            (Self::Hidden(_), visible) | (visible, Self::Hidden(_)) => visible,
            (
                Self::Visible {
                    addr: a,
                    tags: mut ta,
                },
                Self::Visible { addr: b, tags: tb },
            ) => {
                if a == b {
                    ta.extend(tb);
                    Self::Visible { addr: a, tags: ta }
                } else {
                    Self::Mixed
                }
            }
        }
    }

    fn tags(&self) -> BTreeSet<String> {
        match self {
            Self::Hidden(tags) | Self::Visible { tags, .. } => tags.clone(),
            Self::Mixed => BTreeSet::new(),
        }
    }
}

/// Result of merging several NAT sets.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct CombinedNatSet {
    pub set: NatSet,
    /// Networks whose domains disagree; they fall back to their real address.
    pub conflicts: Vec<NetworkId>,
}

/// Merge NAT sets of several domains into one set.
///
/// Networks seen at two different addresses use their real address and are
/// listed in `conflicts`. A tag is only kept if every network defining it
/// agrees on using it.
pub fn combine_nat_sets(topo: &Topology, sets: &[&NatSet]) -> CombinedNatSet {
    let Some((first, rest)) = sets.split_first() else {
        return CombinedNatSet::default();
    };
    if rest.iter().all(|s| *s == *first) {
        return CombinedNatSet {
            set: (*first).clone(),
            conflicts: Vec::new(),
        };
    }
    let mut views: BTreeMap<NetworkId, NatView> = BTreeMap::new();
    for (idx, network) in topo.networks.iter().enumerate() {
        if network.nat.is_empty() {
            continue;
        }
        let id = NetworkId(idx);
        let view = sets
            .iter()
            .map(|set| NatView::of(topo, id, set))
            .fold(NatView::Hidden(BTreeSet::new()), NatView::combine);
        views.insert(id, view);
    }

    let mut wanted: BTreeSet<String> = views.values().flat_map(NatView::tags).collect();
    let mut rejected = BTreeSet::new();
    for (&id, view) in &views {
        let chosen = view.tags();
        for tag in topo.network(id).nat.keys() {
            if !chosen.contains(tag) {
                rejected.insert(tag.clone());
            }
        }
    }
    wanted.retain(|tag| !rejected.contains(tag));
    let set: NatSet = wanted.iter().cloned().collect();

    let conflicts = views
        .iter()
        .filter(|&(&id, view)| match view {
            NatView::Mixed => true,
            _ => NatView::of(topo, id, &set).tags() != view.tags(),
        })
        .map(|(&id, _)| id)
        .collect();
    CombinedNatSet { set, conflicts }
}
