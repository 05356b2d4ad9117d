//! Router-level rewrites done before zones are formed.
//!
//! - crypto tunnels are materialized as tunnel networks and interfaces
//! - redundancy groups of virtual interfaces are linked and checked
//! - unmanaged routers with path restrictions, NAT bindings or crypto
//!   spokes become semi-managed
//! - crypto interfaces move into isolated router fragments
//! - semi-managed routers are split so that each restricted interface
//!   sits in its own fragment

use std::collections::BTreeMap;
use std::net::IpAddr;

use tracing::debug;

use crate::diag::Diagnostics;
use crate::model::{IntfAddr, IntfId, Interface, Network, NetworkId, Router, RouterId, Topology};

/// Run all rewrites in order.
pub fn prepare_routers(topo: &mut Topology, diag: &Diagnostics) {
    link_tunnels(topo, diag);
    link_virtual_interfaces(topo, diag);
    mark_semi_managed(topo);
    move_locked_interfaces(topo);
    let fragments = split_semi_managed_routers(topo);
    debug!(fragments, "semi-managed routers split");
}

/// Create one tunnel network per spoke, connecting hub and spoke router.
pub fn link_tunnels(topo: &mut Topology, diag: &Diagnostics) {
    for c in 0..topo.cryptos.len() {
        let Some(hub) = topo.cryptos[c].hub else {
            continue;
        };
        let crypto_nat = topo.cryptos[c].bind_nat.clone();
        let spokes = topo.cryptos[c].spokes.clone();
        let hub_router = topo.intf(hub).router;
        for spoke in spokes {
            let spoke_router = topo.intf(spoke).router;
            if spoke_router == hub_router {
                diag.error(format!(
                    "{} and its hub {} must not be located at the same router",
                    topo.intf(spoke).name,
                    topo.intf(hub).name
                ));
                continue;
            }
            let spoke_short = Topology::short_name(&topo.router(spoke_router).name).to_string();
            let hub_short = Topology::short_name(&topo.router(hub_router).name).to_string();
            let mut net = Network::new(format!("network:tunnel:{spoke_short}"), None);
            net.tunnel = true;
            let net_id = topo.add_network(net);
            topo.network_names.insert(topo.network(net_id).name.clone(), net_id);

            let mut hub_tunnel = Interface::new(
                format!("interface:{hub_short}.tunnel:{spoke_short}"),
                hub_router,
                net_id,
                IntfAddr::Tunnel,
            );
            hub_tunnel.real_intf = Some(hub);
            hub_tunnel.hardware = topo.intf(hub).hardware.clone();
            hub_tunnel.bind_nat = if crypto_nat.is_empty() {
                topo.intf(hub).bind_nat.clone()
            } else {
                crypto_nat.clone()
            };
            let mut spoke_tunnel = Interface::new(
                format!("interface:{spoke_short}.tunnel:{spoke_short}"),
                spoke_router,
                net_id,
                IntfAddr::Tunnel,
            );
            spoke_tunnel.real_intf = Some(spoke);
            spoke_tunnel.hardware = topo.intf(spoke).hardware.clone();
            spoke_tunnel.bind_nat = topo.intf(spoke).bind_nat.clone();

            for intf in [hub_tunnel, spoke_tunnel] {
                let name = intf.name.clone();
                let id = topo.add_interface(intf);
                topo.intf_names.insert(name, id);
            }
            topo.cryptos[c].tunnels.push(net_id);
        }
    }
}

/// Group virtual interfaces by network and IP and check their redundancy settings.
///
/// Groups with a managed member get an automatic path restriction, so that
/// paths never run through two members of one group.
pub fn link_virtual_interfaces(topo: &mut Topology, diag: &Diagnostics) {
    let mut groups: BTreeMap<(NetworkId, IpAddr), Vec<IntfId>> = BTreeMap::new();
    for (idx, intf) in topo.interfaces.iter().enumerate() {
        if let Some(red) = &intf.redundancy {
            groups.entry((intf.network, red.ip)).or_default().push(IntfId(idx));
        }
    }
    // Redundancy type and id per network, to detect unrelated groups sharing an id.
    let mut ids: BTreeMap<(NetworkId, Option<String>, String), IpAddr> = BTreeMap::new();
    for ((net, ip), members) in groups {
        let first = topo.intf(members[0]).redundancy.clone();
        let Some(first) = first else {
            continue;
        };
        let names = || {
            members
                .iter()
                .map(|&m| topo.intf(m).name.as_str())
                .collect::<Vec<_>>()
                .join(", ")
        };
        let mut consistent = true;
        for &m in &members[1..] {
            let Some(red) = &topo.intf(m).redundancy else {
                continue;
            };
            if red.kind != first.kind {
                diag.error(format!("Must use identical redundancy protocol at {}", names()));
                consistent = false;
                break;
            }
            if red.id != first.id {
                diag.error(format!("Must use identical ID at {}", names()));
                consistent = false;
                break;
            }
        }
        if !consistent {
            continue;
        }
        if let Some(id) = &first.id {
            let key = (net, first.kind.clone(), id.clone());
            match ids.get(&key) {
                Some(other) if *other != ip => {
                    diag.error(format!(
                        "Must use different ID at unrelated virtual IPs {other} and {ip} in {}",
                        topo.network(net).name
                    ));
                    continue;
                }
                _ => {
                    ids.insert(key, ip);
                }
            }
        }
        for &m in &members {
            topo.interfaces[m.0].redundancy_group = members.clone();
        }
        let managed = members
            .iter()
            .any(|&m| topo.router(topo.intf(m).router).managed.is_some());
        if managed && members.len() > 1 {
            topo.add_pathrestriction(format!("auto-virtual-{ip}"), members.clone());
        }
    }
}

/// Unmanaged routers that must take part in path computation.
pub fn mark_semi_managed(topo: &mut Topology) {
    for r in 0..topo.routers.len() {
        if topo.routers[r].managed.is_some() {
            continue;
        }
        let semi = topo.routers[r].interfaces.iter().any(|&i| {
            let intf = topo.intf(i);
            !intf.path_restrict.is_empty()
                || !intf.bind_nat.is_empty()
                || intf.spoke.is_some()
                || intf.is_tunnel()
        });
        topo.routers[r].semi_managed = semi;
    }
}

fn new_fragment(topo: &mut Topology, orig: RouterId, name: String) -> RouterId {
    let base = topo.router(orig);
    let fragment = Router {
        name,
        device: base.device.clone(),
        managed: base.managed,
        model: base.model.clone(),
        semi_managed: base.semi_managed,
        interfaces: Vec::new(),
        orig_router: Some(orig),
        owner: base.owner.clone(),
    };
    topo.add_router(fragment)
}

/// Move every real crypto interface into a fragment of its own.
///
/// The fragment has no link back to the router, so no cleartext traffic
/// can pass through a crypto interface.
pub fn move_locked_interfaces(topo: &mut Topology) {
    for r in 0..topo.routers.len() {
        let rid = RouterId(r);
        let locked: Vec<IntfId> = topo.routers[r]
            .interfaces
            .iter()
            .copied()
            .filter(|&i| {
                let intf = topo.intf(i);
                !intf.hub.is_empty() || intf.spoke.is_some()
            })
            .collect();
        for intf in locked {
            let name = format!("{}({})", topo.router(rid).name, topo.intf(intf).name);
            let fragment = new_fragment(topo, rid, name);
            topo.routers[r].interfaces.retain(|&i| i != intf);
            topo.routers[fragment.0].interfaces.push(intf);
            topo.interfaces[intf.0].router = fragment;
        }
    }
}

/// Split semi-managed routers having at least two unrestricted interfaces.
///
/// Each interface carrying a path restriction or NAT binding moves to a new
/// fragment with the router's name, linked to the remaining router by a
/// fresh unnumbered network. The remaining router is unmanaged again, so
/// its unrestricted networks end up in one zone. Returns the number of
/// fragments created.
pub fn split_semi_managed_routers(topo: &mut Topology) -> usize {
    let mut created = 0;
    let count = topo.routers.len();
    for r in 0..count {
        let router = topo.router(RouterId(r));
        if router.managed.is_some() || !router.semi_managed {
            continue;
        }
        let restricted = |topo: &Topology, i: IntfId| {
            let intf = topo.intf(i);
            !intf.path_restrict.is_empty() || !intf.bind_nat.is_empty()
        };
        let plain = router
            .interfaces
            .iter()
            .filter(|&&i| !restricted(topo, i))
            .count();
        if plain < 2 {
            continue;
        }
        let interfaces = router.interfaces.clone();
        for (pos, intf) in interfaces.into_iter().enumerate() {
            if !restricted(topo, intf) {
                continue;
            }
            let rid = RouterId(r);
            let fragment = new_fragment(topo, rid, topo.router(rid).name.clone());
            let intf_name = topo.intf(intf).name.clone();
            let link = topo.add_network(Network::new(format!("{intf_name}(split Network)"), None));

            let inner = Interface::new(format!("{intf_name}(split1)"), rid, link, IntfAddr::Unnumbered);
            let inner = topo.add_interface(inner);
            let mut outer =
                Interface::new(format!("{intf_name}(split2)"), fragment, link, IntfAddr::Unnumbered);
            outer.split_other = Some(inner);
            let outer = topo.add_interface(outer);
            topo.interfaces[inner.0].split_other = Some(outer);

            // add_interface appended the new interface; put it in place of the moved one.
            topo.routers[r].interfaces.pop();
            topo.routers[r].interfaces[pos] = inner;
            topo.interfaces[intf.0].router = fragment;
            topo.routers[fragment.0].interfaces.push(intf);
            created += 1;
        }
        // Only tunnel interfaces keep the remaining router a path node.
        let keeps_tunnel = topo.routers[r].interfaces.iter().any(|&i| {
            let intf = topo.intf(i);
            intf.is_tunnel() || intf.spoke.is_some()
        });
        topo.routers[r].semi_managed = keeps_tunnel;
    }
    created
}
