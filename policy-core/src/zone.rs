//! Zones, zone clusters, areas and aggregates.
//!
//! A zone is a maximal set of networks connected by unmanaged routers.
//! Zones connected by semi-managed routers without NAT change form a
//! cluster; aggregates are attached to every zone of a cluster. Areas are
//! sets of zones delimited by border interfaces and may be nested.

use std::collections::{BTreeMap, BTreeSet, HashSet};

use tracing::debug;

use crate::addr::{any_prefix, covers, parse_prefix};
use crate::config::IpMode;
use crate::diag::Diagnostics;
use crate::input::ObjectTree;
use crate::model::{
    Aggregate, AggregateId, AreaId, IntfId, NatKind, NetworkId, RouterId, Topology, Zone, ZoneId,
};
use crate::setup::{check_owner, check_typed, parse_nat_def};

/// Partition all networks into zones.
pub fn set_zones(topo: &mut Topology) {
    for start in 0..topo.networks.len() {
        if topo.networks[start].zone.is_some() {
            continue;
        }
        let zid = ZoneId(topo.zones.len());
        let mut zone = Zone::default();
        let mut stack = vec![start];
        while let Some(net) = stack.pop() {
            if topo.networks[net].zone.is_some() {
                continue;
            }
            topo.networks[net].zone = Some(zid);
            zone.networks.push(NetworkId(net));
            for i in topo.networks[net].interfaces.clone() {
                topo.interfaces[i.0].zone = Some(zid);
                let router = topo.interfaces[i.0].router;
                if topo.router(router).is_path_node() {
                    zone.interfaces.push(i);
                    continue;
                }
                if zone.unmanaged_routers.contains(&router) {
                    continue;
                }
                zone.unmanaged_routers.push(router);
                for &other in &topo.router(router).interfaces {
                    stack.push(topo.intf(other).network.0);
                }
            }
        }
        zone.name = zone
            .networks
            .iter()
            .map(|&n| topo.network(n).name.as_str())
            .min()
            .map(|first| format!("any:[{first}]"))
            .unwrap_or_default();
        zone.tunnel = zone.networks.iter().all(|&n| topo.network(n).tunnel);
        zone.networks.sort();
        zone.interfaces.sort();
        topo.zones.push(zone);
    }
    debug!(zones = topo.zones.len(), "zones created");
}

/// Link every numbered network to the smallest network of its zone containing it.
pub fn set_subnet_chain(topo: &mut Topology, diag: &Diagnostics) {
    for z in 0..topo.zones.len() {
        let networks = topo.zones[z].networks.clone();
        for &net in &networks {
            let Some(addr) = topo.network(net).addr else {
                continue;
            };
            let up = networks
                .iter()
                .copied()
                .filter(|&other| other != net)
                .filter_map(|other| topo.network(other).addr.map(|a| (other, a)))
                .filter(|&(_, outer)| outer.prefix() < addr.prefix() && covers(outer, addr))
                .max_by_key(|&(_, outer)| outer.prefix())
                .map(|(other, _)| other);
            let Some(up) = up else {
                continue;
            };
            topo.networks[net.0].up = Some(up);
            let network = topo.network(net);
            if network.subnet_of.is_none() && !network.loopback {
                diag.warning(format!(
                    "{} is subnet of {}\n if desired, declare attribute 'subnet_of'",
                    network.name,
                    topo.network(up).name
                ));
            }
        }
    }
}

/// Group zones connected through semi-managed routers with equal NAT binding.
pub fn set_clusters(topo: &mut Topology) {
    let mut assigned = vec![false; topo.zones.len()];
    for start in 0..topo.zones.len() {
        if assigned[start] {
            continue;
        }
        let index = topo.clusters.len();
        let mut cluster = Vec::new();
        let mut stack = vec![ZoneId(start)];
        while let Some(z) = stack.pop() {
            if assigned[z.0] {
                continue;
            }
            assigned[z.0] = true;
            topo.zones[z.0].cluster = index;
            cluster.push(z);
            for &intf in &topo.zone(z).interfaces {
                let router = topo.router(topo.intf(intf).router);
                if router.managed.is_some() {
                    continue;
                }
                for &other in &router.interfaces {
                    if other == intf || topo.intf(other).bind_nat != topo.intf(intf).bind_nat {
                        continue;
                    }
                    if let Some(next) = topo.intf(other).zone {
                        stack.push(next);
                    }
                }
            }
        }
        cluster.sort();
        topo.clusters.push(cluster);
    }
}

/// Collect zones and managed routers of each area, then nest areas.
pub fn set_areas(topo: &mut Topology, diag: &Diagnostics) {
    for a in 0..topo.areas.len() {
        let area = topo.area(AreaId(a));
        let has_border = !area.border.is_empty() || !area.inclusive_border.is_empty();
        if area.anchor.is_some() && has_border {
            diag.error(format!(
                "Attribute 'anchor' must not be defined together with 'border' or 'inclusive_border' for {}",
                area.name
            ));
            continue;
        }
        if area.anchor.is_none() && !has_border {
            diag.error(format!(
                "At least one of attributes 'border', 'inclusive_border' or 'anchor' must be defined for {}",
                area.name
            ));
            continue;
        }
        if let Some((zones, routers)) = collect_area(topo, AreaId(a), diag) {
            topo.areas[a].zones = zones;
            topo.areas[a].managed_routers = routers;
        }
    }
    nest_areas(topo, diag);
}

fn collect_area(topo: &Topology, aid: AreaId, diag: &Diagnostics) -> Option<(Vec<ZoneId>, Vec<RouterId>)> {
    let area = topo.area(aid);
    let mut valid = true;
    for &intf in area.border.iter().chain(&area.inclusive_border) {
        if topo.router(topo.intf(intf).router).managed.is_none() {
            diag.error(format!(
                "Referencing unmanaged {} from {}",
                topo.intf(intf).name,
                area.name
            ));
            valid = false;
        }
    }
    if !valid {
        return None;
    }

    let mut zones = BTreeSet::new();
    let mut routers = BTreeSet::new();
    let mut reached: HashSet<IntfId> = HashSet::new();
    let mut zone_stack = Vec::new();
    let mut router_stack: Vec<(RouterId, IntfId)> = Vec::new();
    if let Some(anchor) = area.anchor {
        zone_stack.extend(topo.network(anchor).zone);
    } else if let Some(&border) = area.border.first() {
        reached.insert(border);
        zone_stack.extend(topo.intf(border).zone);
    } else if let Some(&border) = area.inclusive_border.first() {
        reached.insert(border);
        router_stack.push((topo.intf(border).router, border));
    }

    let mut inconsistent = false;
    loop {
        if let Some(z) = zone_stack.pop() {
            if !zones.insert(z) {
                continue;
            }
            for &intf in &topo.zone(z).interfaces {
                if area.border.contains(&intf) {
                    reached.insert(intf);
                } else if area.inclusive_border.contains(&intf) {
                    inconsistent = true;
                } else {
                    router_stack.push((topo.intf(intf).router, intf));
                }
            }
        } else if let Some((r, from)) = router_stack.pop() {
            if !routers.insert(r) {
                continue;
            }
            for &other in &topo.router(r).interfaces {
                if other == from {
                    continue;
                }
                if area.inclusive_border.contains(&other) {
                    reached.insert(other);
                } else if area.border.contains(&other) {
                    inconsistent = true;
                } else {
                    zone_stack.extend(topo.intf(other).zone);
                }
            }
        } else {
            break;
        }
    }
    if inconsistent {
        diag.error(format!("Inconsistent definition of {} in loop", area.name));
        return None;
    }
    let unreached: Vec<&str> = area
        .border
        .iter()
        .chain(&area.inclusive_border)
        .filter(|intf| !reached.contains(intf))
        .map(|&intf| topo.intf(intf).name.as_str())
        .collect();
    if !unreached.is_empty() {
        diag.error(format!(
            "Unreachable border of {}:\n - {}",
            area.name,
            unreached.join("\n - ")
        ));
        return None;
    }
    let managed = routers
        .into_iter()
        .filter(|&r| topo.router(r).managed.is_some())
        .collect();
    Some((zones.into_iter().collect(), managed))
}

fn nest_areas(topo: &mut Topology, diag: &Diagnostics) {
    let mut order: Vec<AreaId> = (0..topo.areas.len())
        .map(AreaId)
        .filter(|&a| !topo.area(a).zones.is_empty())
        .collect();
    order.sort_by_key(|&a| (topo.area(a).zones.len(), a));

    let sets: Vec<BTreeSet<ZoneId>> = order
        .iter()
        .map(|&a| topo.area(a).zones.iter().copied().collect())
        .collect();
    for (i, &small) in order.iter().enumerate() {
        for (j, &large) in order.iter().enumerate().skip(i + 1) {
            let (inner, outer) = (&sets[i], &sets[j]);
            if inner.is_disjoint(outer) {
                continue;
            }
            if inner == outer {
                diag.error(format!(
                    "Duplicate {} and {}",
                    topo.area(small).name,
                    topo.area(large).name
                ));
            } else if inner.is_subset(outer) {
                if topo.area(small).in_area.is_none() {
                    topo.areas[small.0].in_area = Some(large);
                }
            } else {
                diag.error(format!(
                    "Overlapping {} and {}",
                    topo.area(small).name,
                    topo.area(large).name
                ));
            }
        }
    }
    // Smallest area first, so the first hit is the innermost one.
    for &a in &order {
        for z in topo.area(a).zones.clone() {
            if topo.zones[z.0].in_area.is_none() {
                topo.zones[z.0].in_area = Some(a);
            }
        }
    }
}

/// Copy NAT definitions of areas into the networks of their zones.
///
/// Inner areas take precedence over outer ones; a network's own definition
/// takes precedence over all inherited ones.
pub fn inherit_area_nat(topo: &mut Topology, diag: &Diagnostics) {
    for n in 0..topo.networks.len() {
        let network = &topo.networks[n];
        if network.tunnel {
            continue;
        }
        let Some(zone) = network.zone else {
            continue;
        };
        let mut area = topo.zone(zone).in_area;
        let mut inherited: Vec<String> = Vec::new();
        while let Some(aid) = area {
            let defs: Vec<_> = topo.area(aid).nat.values().cloned().collect();
            for nat in defs {
                let network = &topo.networks[n];
                if let Some(own) = network.nat.get(&nat.tag) {
                    if *own == nat && !inherited.contains(&nat.tag) {
                        diag.warning(format!(
                            "Useless nat:{} at {}, it was already inherited from {}",
                            nat.tag,
                            network.name,
                            topo.area(aid).name
                        ));
                    }
                    continue;
                }
                if let (NatKind::Translated(pool), Some(real)) = (&nat.kind, network.addr) {
                    if pool.is_ipv4() != real.is_ipv4() {
                        continue;
                    }
                }
                inherited.push(nat.tag.clone());
                topo.networks[n].nat.insert(nat.tag.clone(), nat);
            }
            area = topo.area(aid).in_area;
        }
    }
}

/// Create one aggregate per zone of the cluster its link network belongs to.
pub fn link_aggregates(topo: &mut Topology, tree: &ObjectTree, mode: IpMode, diag: &Diagnostics) {
    for def in &tree.aggregates {
        if !check_typed(&def.name, "any", diag) {
            continue;
        }
        if topo.aggregate_names.contains_key(&def.name) {
            diag.error(format!("Duplicate definition of {}", def.name));
            continue;
        }
        let addr = match &def.ip {
            Some(raw) => match parse_prefix(raw) {
                Ok(addr) => addr,
                Err(e) => {
                    diag.error(format!("{e} in {}", def.name));
                    continue;
                }
            },
            None => any_prefix(!mode.allows_v4()),
        };
        let allowed = if addr.is_ipv6() { mode.allows_v6() } else { mode.allows_v4() };
        if !allowed {
            topo.disabled.insert(def.name.clone());
            continue;
        }
        let Some(&link) = topo.network_names.get(&def.link) else {
            if topo.disabled.contains(&def.link) {
                topo.disabled.insert(def.name.clone());
            } else {
                diag.error(format!("Can't resolve reference to {} in {}", def.link, def.name));
            }
            continue;
        };
        let Some(zone) = topo.network(link).zone else {
            continue;
        };
        let mut nat = BTreeMap::new();
        for (tag, ndef) in &def.nat {
            if let Some(ndef) = parse_nat_def(tag, ndef, Some(addr), &def.name, diag) {
                nat.insert(tag.clone(), ndef);
            }
        }
        let owner = check_owner(topo, &def.owner, &def.name, diag);
        let cluster = topo.clusters[topo.zone(zone).cluster].clone();
        let mut ids = Vec::new();
        for z in cluster {
            let id = AggregateId(topo.aggregates.len());
            topo.aggregates.push(Aggregate {
                name: def.name.clone(),
                addr,
                zone: z,
                nat: nat.clone(),
                owner: owner.clone(),
            });
            topo.zones[z.0].aggregates.push(id);
            ids.push(id);
        }
        topo.aggregate_names.insert(def.name.clone(), ids);
    }
}

#[cfg(test)]
mod tests {
    use super::{inherit_area_nat, link_aggregates, set_areas, set_clusters, set_subnet_chain, set_zones};
    use crate::config::{Config, IpMode};
    use crate::diag::{CaptureWriter, Diagnostics};
    use crate::input::parse_json;
    use crate::model::{NatKind, Topology};
    use crate::setup::build_topology;
    use crate::split::prepare_routers;

    fn zoned(json: &str) -> (Topology, String) {
        let tree = parse_json(json).expect("parse");
        let out = CaptureWriter::new();
        let config = Config::default();
        let diag = Diagnostics::with_writer(&config, out.clone());
        let mut topo = build_topology(&tree, &config, &diag);
        prepare_routers(&mut topo, &diag);
        set_zones(&mut topo);
        set_subnet_chain(&mut topo, &diag);
        set_clusters(&mut topo);
        set_areas(&mut topo, &diag);
        inherit_area_nat(&mut topo, &diag);
        link_aggregates(&mut topo, &tree, IpMode::Dual, &diag);
        diag.finish();
        (topo, out.contents())
    }

    const THREE_ZONES: &str = r#"{
      "networks": [{ "name": "network:a", "ip": "10.1.1.0/24" },
                   { "name": "network:b", "ip": "10.1.2.0/24" },
                   { "name": "network:b-sub", "ip": "10.1.2.128/25", "subnet_of": "network:b" },
                   { "name": "network:c", "ip": "10.1.3.0/24" },
                   { "name": "network:d", "ip": "10.1.4.0/24" }],
      "routers": [
        { "name": "router:fw1", "managed": true, "model": "ASA", "interfaces": [
          { "network": "network:a", "ip": "10.1.1.1", "hardware": "e0" },
          { "network": "network:b", "ip": "10.1.2.1", "hardware": "e1" }] },
        { "name": "router:plain", "interfaces": [
          { "network": "network:b", "ip": "10.1.2.2" },
          { "network": "network:b-sub", "ip": "10.1.2.129" }] },
        { "name": "router:fw2", "managed": true, "model": "ASA", "interfaces": [
          { "network": "network:b", "ip": "10.1.2.3", "hardware": "e0" },
          { "network": "network:c", "ip": "10.1.3.1", "hardware": "e1" }] },
        { "name": "router:semi", "interfaces": [
          { "network": "network:c", "ip": "10.1.3.2" },
          { "network": "network:d", "ip": "10.1.4.1", "bind_nat": ["x"] }] }],
      "areas": [{ "name": "area:inner", "border": ["interface:fw2.c"],
                  "nat": { "h": { "hidden": true } } },
                { "name": "area:outer", "inclusive_border": ["interface:fw1.a"],
                  "nat": { "h": { "identity": true }, "d": { "ip": "172.16.0.0/16", "dynamic": true } } }],
      "aggregates": [{ "name": "any:c", "link": "network:c" }]
    }"#;

    #[test]
    fn zones_span_unmanaged_routers() {
        let (topo, messages) = zoned(THREE_ZONES);
        assert_eq!(messages, "");
        let b = topo.network(topo.network_names["network:b"]).zone.expect("zone");
        let sub = topo.network(topo.network_names["network:b-sub"]).zone.expect("zone");
        assert_eq!(b, sub);
        assert_eq!(topo.zone(b).name, "any:[network:b]");
        assert_eq!(topo.zone(b).unmanaged_routers.len(), 1);
        let sub = topo.network_names["network:b-sub"];
        assert_eq!(topo.network(sub).up, Some(topo.network_names["network:b"]));
    }

    #[test]
    fn clusters_stop_at_nat_binding() {
        let (topo, _) = zoned(THREE_ZONES);
        let c = topo.network(topo.network_names["network:c"]).zone.expect("zone");
        let d = topo.network(topo.network_names["network:d"]).zone.expect("zone");
        assert_ne!(c, d);
        assert_ne!(topo.zone(c).cluster, topo.zone(d).cluster);
        assert_eq!(topo.aggregate_names["any:c"].len(), 1);
    }

    #[test]
    fn nested_areas_and_inherited_nat() {
        let (topo, _) = zoned(THREE_ZONES);
        let inner = topo.area_names["area:inner"];
        let outer = topo.area_names["area:outer"];
        assert_eq!(topo.area(inner).zones.len(), 2);
        assert_eq!(topo.area(outer).zones.len(), 3);
        assert_eq!(topo.area(inner).in_area, Some(outer));
        let fw1 = topo.router_names["router:fw1"];
        assert!(topo.area(outer).managed_routers.contains(&fw1));

        let c = topo.network(topo.network_names["network:c"]);
        assert_eq!(c.nat["h"].kind, NatKind::Hidden);
        assert!(c.nat["d"].dynamic);
        let b = topo.network(topo.network_names["network:b"]);
        assert_eq!(b.nat["h"].kind, NatKind::Identity);
        let a = topo.network(topo.network_names["network:a"]);
        assert!(a.nat.is_empty());
    }

    #[test]
    fn missing_subnet_of_is_reported() {
        let (_, messages) = zoned(
            r#"{ "networks": [{ "name": "network:big", "ip": "10.0.0.0/8" },
                              { "name": "network:small", "ip": "10.1.0.0/16" }],
                 "routers": [{ "name": "router:r", "interfaces": [
                   { "network": "network:big", "ip": "10.0.0.1" },
                   { "network": "network:small", "ip": "10.1.0.1" }] }] }"#,
        );
        assert!(messages.contains("Warning: network:small is subnet of network:big"));
    }

    #[test]
    fn border_reached_from_wrong_side_is_inconsistent() {
        let (_, messages) = zoned(
            r#"{
              "networks": [{ "name": "network:a", "ip": "10.1.1.0/24" },
                           { "name": "network:b", "ip": "10.1.2.0/24" }],
              "routers": [
                { "name": "router:r1", "managed": true, "model": "IOS", "interfaces": [
                  { "network": "network:a", "ip": "10.1.1.1", "hardware": "e0" },
                  { "network": "network:b", "ip": "10.1.2.1", "hardware": "e1" }] },
                { "name": "router:r2", "managed": true, "model": "IOS", "interfaces": [
                  { "network": "network:a", "ip": "10.1.1.2", "hardware": "e0" },
                  { "network": "network:b", "ip": "10.1.2.2", "hardware": "e1" }] }],
              "areas": [{ "name": "area:x", "border": ["interface:r1.a"] },
                        { "name": "area:y", "anchor": "network:a", "border": ["interface:r1.a"] }]
            }"#,
        );
        assert!(messages.contains("Error: Inconsistent definition of area:x in loop"));
        assert!(messages.contains("Attribute 'anchor' must not be defined together"));
    }

    #[test]
    fn equal_areas_are_duplicates() {
        let (_, messages) = zoned(
            r#"{
              "networks": [{ "name": "network:a", "ip": "10.1.1.0/24" },
                           { "name": "network:b", "ip": "10.1.2.0/24" }],
              "routers": [{ "name": "router:r1", "managed": true, "model": "IOS", "interfaces": [
                  { "network": "network:a", "ip": "10.1.1.1", "hardware": "e0" },
                  { "network": "network:b", "ip": "10.1.2.1", "hardware": "e1" }] }],
              "areas": [{ "name": "area:x", "border": ["interface:r1.a"] },
                        { "name": "area:y", "anchor": "network:a" }]
            }"#,
        );
        assert!(messages.contains("Error: Duplicate area:x and area:y"));
    }
}
