//! Build the topology arena from an [`ObjectTree`].
//!
//! Setup checks every definition on its own (names, addresses, NAT
//! definitions, references) and reports defects through the diagnostics
//! channel. Invalid objects are left out so later passes only ever see a
//! consistent arena.

use std::collections::{BTreeMap, HashSet};

use ipnetwork::IpNetwork;
use tracing::debug;

use crate::addr::{covers, host_prefix, is_reserved_v4, parse_ip, parse_prefix, parse_range};
use crate::config::{Config, IpMode};
use crate::diag::Diagnostics;
use crate::input::{self, ManagedDef, ObjectTree};
use crate::model::{
    Area, AreaId, Crypto, CryptoId, Host, HostAddr, HostId, IntfAddr, IntfId, Interface, Managed,
    NatDef, NatKind, Network, NetworkId, Redundancy, Router, Topology,
};

/// Create the arena for all enabled objects of `tree`.
pub fn build_topology(tree: &ObjectTree, config: &Config, diag: &Diagnostics) -> Topology {
    let mut topo = Topology::default();
    setup_owners(&mut topo, tree, diag);
    let subnet_of = setup_networks(&mut topo, tree, config.ip_mode, diag);
    setup_cryptos(&mut topo, tree, diag);
    setup_routers(&mut topo, tree, diag);
    link_subnets(&mut topo, &subnet_of, diag);
    setup_pathrestrictions(&mut topo, tree, diag);
    setup_areas(&mut topo, tree, diag);
    check_cryptos(&topo, diag);
    debug!(
        networks = topo.networks.len(),
        routers = topo.routers.len(),
        interfaces = topo.interfaces.len(),
        "topology arena created"
    );
    topo
}

/// Check `name` has the form `<kind>:<something>`.
pub(crate) fn check_typed(name: &str, kind: &str, diag: &Diagnostics) -> bool {
    match name.split_once(':') {
        Some((prefix, rest)) if prefix == kind && !rest.is_empty() => true,
        _ => {
            diag.error(format!("Expected name of form '{kind}:NAME', got '{name}'"));
            false
        }
    }
}

pub(crate) fn check_owner(topo: &Topology, owner: &Option<String>, context: &str, diag: &Diagnostics) -> Option<String> {
    let name = owner.as_ref()?;
    if topo.owners.contains_key(name) {
        Some(name.clone())
    } else {
        diag.error(format!("Can't resolve reference to {name} in {context}"));
        None
    }
}

fn setup_owners(topo: &mut Topology, tree: &ObjectTree, diag: &Diagnostics) {
    for def in &tree.owners {
        if !check_typed(&def.name, "owner", diag) {
            continue;
        }
        if topo.owners.contains_key(&def.name) {
            diag.error(format!("Duplicate definition of {}", def.name));
            continue;
        }
        topo.owners.insert(def.name.clone(), def.admins.clone());
    }
}

/// Parse one NAT definition of `owner_name`.
///
/// `net_addr` is the real address of the translated network, if known; it
/// enforces equal masks for static NAT.
pub(crate) fn parse_nat_def(
    tag: &str,
    def: &input::NatDef,
    net_addr: Option<IpNetwork>,
    owner_name: &str,
    diag: &Diagnostics,
) -> Option<NatDef> {
    let context = format!("nat:{tag} of {owner_name}");
    if def.hidden || def.identity {
        if def.ip.is_some() {
            diag.error(format!("{context} must not use attribute 'ip' together with 'hidden' or 'identity'"));
            return None;
        }
        if def.hidden && def.identity {
            diag.error(format!("{context} must not be both 'hidden' and 'identity'"));
            return None;
        }
        let kind = if def.hidden { NatKind::Hidden } else { NatKind::Identity };
        return Some(NatDef {
            tag: tag.to_string(),
            kind,
            dynamic: def.hidden,
        });
    }
    let Some(raw) = &def.ip else {
        diag.error(format!("Missing IP address for {context}"));
        return None;
    };
    let addr = match parse_prefix(raw) {
        Ok(addr) => addr,
        Err(e) => {
            diag.error(format!("{e} in {context}"));
            return None;
        }
    };
    if let Some(real) = net_addr {
        if real.is_ipv4() != addr.is_ipv4() {
            diag.error(format!("{context} must use the address family of {owner_name}"));
            return None;
        }
        if !def.dynamic && real.prefix() != addr.prefix() {
            diag.error(format!(
                "Mask for non dynamic {context} must be equal to mask of {owner_name}"
            ));
            return None;
        }
    }
    Some(NatDef {
        tag: tag.to_string(),
        kind: NatKind::Translated(addr),
        dynamic: def.dynamic,
    })
}

fn family_allowed(mode: IpMode, addr: IpNetwork) -> bool {
    if addr.is_ipv6() {
        mode.allows_v6()
    } else {
        mode.allows_v4()
    }
}

fn setup_networks(
    topo: &mut Topology,
    tree: &ObjectTree,
    mode: IpMode,
    diag: &Diagnostics,
) -> Vec<(NetworkId, String)> {
    let mut subnet_of = Vec::new();
    for def in &tree.networks {
        if !check_typed(&def.name, "network", diag) {
            continue;
        }
        if topo.network_names.contains_key(&def.name) || topo.disabled.contains(&def.name) {
            diag.error(format!("Duplicate definition of {}", def.name));
            continue;
        }
        if def.disabled {
            disable_network(topo, def);
            continue;
        }
        let addr = match (&def.ip, def.unnumbered) {
            (Some(raw), false) => match parse_prefix(raw) {
                Ok(addr) => Some(addr),
                Err(e) => {
                    diag.error(format!("{e} in {}", def.name));
                    continue;
                }
            },
            (None, true) => None,
            (Some(_), true) => {
                diag.error(format!("Unnumbered {} must not have attribute 'ip'", def.name));
                continue;
            }
            (None, false) => {
                diag.error(format!("Missing IP address for {}", def.name));
                continue;
            }
        };
        if let Some(addr) = addr {
            if !family_allowed(mode, addr) {
                diag.info(format!("Ignoring {} of excluded address family", def.name));
                disable_network(topo, def);
                continue;
            }
        }
        let mut network = Network::new(def.name.clone(), addr);
        for (tag, nat) in &def.nat {
            if let Some(nat) = parse_nat_def(tag, nat, addr, &def.name, diag) {
                network.nat.insert(tag.clone(), nat);
            }
        }
        network.owner = check_owner(topo, &def.owner, &def.name, diag);
        let id = topo.add_network(network);
        topo.network_names.insert(def.name.clone(), id);
        if let Some(parent) = &def.subnet_of {
            subnet_of.push((id, parent.clone()));
        }
        for host in &def.hosts {
            setup_host(topo, id, host, diag);
        }
    }
    subnet_of
}

fn disable_network(topo: &mut Topology, def: &input::NetworkDef) {
    topo.disabled.insert(def.name.clone());
    for host in &def.hosts {
        topo.disabled.insert(host.name.clone());
    }
}

fn setup_host(topo: &mut Topology, net: NetworkId, def: &input::HostDef, diag: &Diagnostics) {
    if !check_typed(&def.name, "host", diag) {
        return;
    }
    if topo.host_names.contains_key(&def.name) {
        diag.error(format!("Duplicate definition of {}", def.name));
        return;
    }
    let net_name = topo.network(net).name.clone();
    let Some(net_addr) = topo.network(net).addr else {
        diag.error(format!("Unnumbered {net_name} must not have {}", def.name));
        return;
    };
    let addr = match (&def.ip, &def.range) {
        (Some(raw), None) => parse_ip(raw).map(HostAddr::Single),
        (None, Some(raw)) => parse_range(raw).map(|(lo, hi)| HostAddr::Range(lo, hi)),
        _ => Err(format!("{} needs exactly one of attributes 'ip' and 'range'", def.name)),
    };
    let addr = match addr {
        Ok(addr) => addr,
        Err(e) => {
            diag.error(e);
            return;
        }
    };
    let inside = match addr {
        HostAddr::Single(ip) => net_addr.contains(ip),
        HostAddr::Range(lo, hi) => net_addr.contains(lo) && net_addr.contains(hi),
    };
    if !inside {
        diag.error(format!("IP of {} doesn't match IP/mask of {net_name}", def.name));
        return;
    }
    let mut nat = BTreeMap::new();
    for (tag, raw) in &def.nat {
        match parse_ip(raw) {
            Ok(ip) => {
                nat.insert(tag.clone(), ip);
            }
            Err(e) => diag.error(format!("{e} in nat:{tag} of {}", def.name)),
        }
    }
    let owner = check_owner(topo, &def.owner, &def.name, diag);
    let id = HostId(topo.hosts.len());
    topo.hosts.push(Host {
        name: def.name.clone(),
        addr,
        network: net,
        nat,
        owner,
    });
    topo.networks[net.0].hosts.push(id);
    topo.host_names.insert(def.name.clone(), id);
}

fn setup_cryptos(topo: &mut Topology, tree: &ObjectTree, diag: &Diagnostics) {
    for def in &tree.crypto {
        if !check_typed(&def.name, "crypto", diag) {
            continue;
        }
        if topo.cryptos.iter().any(|c| c.name == def.name) {
            diag.error(format!("Duplicate definition of {}", def.name));
            continue;
        }
        let mut bind_nat = def.bind_nat.clone();
        bind_nat.sort();
        bind_nat.dedup();
        topo.cryptos.push(Crypto {
            name: def.name.clone(),
            bind_nat,
            ..Crypto::default()
        });
    }
}

fn find_crypto(topo: &Topology, name: &str) -> Option<CryptoId> {
    topo.cryptos
        .iter()
        .position(|c| c.name == name)
        .map(CryptoId)
}

fn parse_managed(def: &input::RouterDef, diag: &Diagnostics) -> Result<Option<Managed>, ()> {
    let managed = match &def.managed {
        None | Some(ManagedDef::Flag(false)) => None,
        Some(ManagedDef::Flag(true)) => Some(Managed::Standard),
        Some(ManagedDef::Kind(kind)) => Some(match kind.as_str() {
            "standard" => Managed::Standard,
            "full" => Managed::Full,
            "secondary" => Managed::Secondary,
            "primary" => Managed::Primary,
            "local" => Managed::Local,
            "routing_only" => Managed::RoutingOnly,
            other => {
                diag.error(format!("Invalid value '{other}' for attribute 'managed' of {}", def.name));
                return Err(());
            }
        }),
    };
    Ok(managed)
}

fn setup_routers(topo: &mut Topology, tree: &ObjectTree, diag: &Diagnostics) {
    for def in &tree.routers {
        if !check_typed(&def.name, "router", diag) {
            continue;
        }
        if topo.router_names.contains_key(&def.name) || topo.disabled.contains(&def.name) {
            diag.error(format!("Duplicate definition of {}", def.name));
            continue;
        }
        let short = Topology::short_name(&def.name).to_string();
        if def.disabled {
            topo.disabled.insert(def.name.clone());
            for intf in &def.interfaces {
                topo.disabled
                    .insert(format!("interface:{short}.{}", Topology::short_name(&intf.network)));
            }
            continue;
        }
        let Ok(managed) = parse_managed(def, diag) else {
            continue;
        };
        if managed.is_some() && def.model.is_none() {
            diag.error(format!("Missing 'model' for managed {}", def.name));
        }
        let owner = check_owner(topo, &def.owner, &def.name, diag);
        let rid = topo.add_router(Router {
            name: def.name.clone(),
            device: def.name.clone(),
            managed,
            model: def.model.clone(),
            semi_managed: false,
            interfaces: Vec::new(),
            orig_router: None,
            owner,
        });
        topo.router_names.insert(def.name.clone(), rid);

        let mut spokes = Vec::new();
        for idef in &def.interfaces {
            let name = format!("interface:{short}.{}", Topology::short_name(&idef.network));
            if topo.intf_names.contains_key(&name) || topo.disabled.contains(&name) {
                diag.error(format!("Duplicate definition of {name}"));
                continue;
            }
            if idef.disabled {
                topo.disabled.insert(name);
                continue;
            }
            let Some(net) = interface_network(topo, &short, idef, &name, diag) else {
                continue;
            };
            let Some(addr) = interface_addr(topo, net, idef, &name, diag) else {
                continue;
            };
            if managed.is_some() && idef.hardware.is_none() {
                diag.error(format!("Missing 'hardware' for {name}"));
            }
            let mut intf = Interface::new(name.clone(), rid, net, addr);
            intf.loopback = idef.loopback;
            intf.hardware = idef.hardware.clone();
            intf.bind_nat = idef.bind_nat.clone();
            intf.bind_nat.sort();
            intf.bind_nat.dedup();
            for (tag, raw) in &idef.nat {
                match parse_ip(raw) {
                    Ok(ip) => {
                        intf.nat.insert(tag.clone(), ip);
                    }
                    Err(e) => diag.error(format!("{e} in nat:{tag} of {name}")),
                }
            }
            for hub in &idef.hub {
                match find_crypto(topo, hub) {
                    Some(id) => intf.hub.push(id),
                    None => diag.error(format!("Can't resolve reference to {hub} in {name}")),
                }
            }
            if let Some(spoke) = &idef.spoke {
                match find_crypto(topo, spoke) {
                    Some(id) => intf.spoke = Some(id),
                    None => diag.error(format!("Can't resolve reference to {spoke} in {name}")),
                }
            }
            if let Some(vdef) = &idef.redundancy {
                intf.redundancy = redundancy(topo, net, vdef, &name, diag);
            }
            intf.owner = check_owner(topo, &idef.owner, &name, diag);
            let hubs = intf.hub.clone();
            let spoke = intf.spoke;
            let id = topo.add_interface(intf);
            topo.intf_names.insert(name.clone(), id);
            for crypto in hubs {
                let entry = &mut topo.cryptos[crypto.0];
                match entry.hub {
                    Some(other) => diag.error(format!(
                        "Must use {} only once as hub, found at {} and {name}",
                        entry.name, topo.interfaces[other.0].name
                    )),
                    None => entry.hub = Some(id),
                }
            }
            if let Some(crypto) = spoke {
                topo.cryptos[crypto.0].spokes.push(id);
                spokes.push(name);
            }
        }
        if spokes.len() > 1 {
            diag.error(format!(
                "Must not define crypto spoke at more than one interface of {}: {}",
                def.name,
                spokes.join(", ")
            ));
        }
    }
}

fn interface_network(
    topo: &mut Topology,
    router_short: &str,
    idef: &input::InterfaceDef,
    name: &str,
    diag: &Diagnostics,
) -> Option<NetworkId> {
    if idef.loopback {
        let Some(raw) = &idef.ip else {
            diag.error(format!("Loopback {name} needs attribute 'ip'"));
            return None;
        };
        let ip = match parse_ip(raw) {
            Ok(ip) => ip,
            Err(e) => {
                diag.error(format!("{e} in {name}"));
                return None;
            }
        };
        let net_name = format!("network:{router_short}.{}", Topology::short_name(&idef.network));
        let mut network = Network::new(net_name.clone(), Some(host_prefix(ip)));
        network.loopback = true;
        let id = topo.add_network(network);
        topo.network_names.insert(net_name, id);
        return Some(id);
    }
    match topo.network_names.get(&idef.network) {
        Some(&id) => Some(id),
        None => {
            // Interfaces of disabled networks vanish together with the network.
            if !topo.disabled.contains(&idef.network) {
                diag.error(format!("Referencing undefined {} from {name}", idef.network));
            }
            None
        }
    }
}

fn interface_addr(
    topo: &Topology,
    net: NetworkId,
    idef: &input::InterfaceDef,
    name: &str,
    diag: &Diagnostics,
) -> Option<IntfAddr> {
    let network = topo.network(net);
    if idef.loopback {
        let ip = idef.ip.as_deref().and_then(|raw| parse_ip(raw).ok())?;
        return Some(IntfAddr::Ip(ip));
    }
    match (network.addr, &idef.ip) {
        (None, Some(_)) => {
            diag.error(format!("{name} must not be linked to unnumbered {}", network.name));
            None
        }
        (None, None) => Some(IntfAddr::Unnumbered),
        (Some(_), None) if idef.negotiated => Some(IntfAddr::Negotiated),
        (Some(_), None) if idef.unnumbered => {
            diag.error(format!("Unnumbered {name} must not be linked to {}", network.name));
            None
        }
        (Some(_), None) => {
            diag.error(format!("Missing IP address for {name}"));
            None
        }
        (Some(net_addr), Some(raw)) => {
            let ip = match parse_ip(raw) {
                Ok(ip) => ip,
                Err(e) => {
                    diag.error(format!("{e} in {name}"));
                    return None;
                }
            };
            if !net_addr.contains(ip) {
                diag.error(format!("IP of {name} doesn't match IP/mask of {}", network.name));
                return None;
            }
            if is_reserved_v4(ip, net_addr) {
                diag.error(format!("{name} has network or broadcast address"));
                return None;
            }
            Some(IntfAddr::Ip(ip))
        }
    }
}

fn redundancy(
    topo: &Topology,
    net: NetworkId,
    vdef: &input::VirtualDef,
    name: &str,
    diag: &Diagnostics,
) -> Option<Redundancy> {
    let ip = match parse_ip(&vdef.ip) {
        Ok(ip) => ip,
        Err(e) => {
            diag.error(format!("{e} in virtual IP of {name}"));
            return None;
        }
    };
    let network = topo.network(net);
    if !network.addr.is_some_and(|addr| addr.contains(ip)) {
        diag.error(format!("Virtual IP of {name} doesn't match IP/mask of {}", network.name));
        return None;
    }
    Some(Redundancy {
        ip,
        kind: vdef.kind.clone(),
        id: vdef.id.clone(),
    })
}

fn link_subnets(topo: &mut Topology, subnet_of: &[(NetworkId, String)], diag: &Diagnostics) {
    for (id, parent_name) in subnet_of {
        let Some(&parent) = topo.network_names.get(parent_name) else {
            if !topo.disabled.contains(parent_name) {
                diag.error(format!(
                    "Can't resolve reference to {parent_name} in attribute 'subnet_of' of {}",
                    topo.network(*id).name
                ));
            }
            continue;
        };
        let child = topo.network(*id);
        let fits = match (topo.network(parent).addr, child.addr) {
            (Some(outer), Some(inner)) => outer.prefix() < inner.prefix() && covers(outer, inner),
            _ => false,
        };
        if !fits {
            diag.error(format!(
                "{} is subnet_of {parent_name} but its IP doesn't match that's IP/mask",
                child.name
            ));
            continue;
        }
        topo.networks[id.0].subnet_of = Some(parent);
    }
}

fn setup_pathrestrictions(topo: &mut Topology, tree: &ObjectTree, diag: &Diagnostics) {
    let mut seen = HashSet::new();
    for def in &tree.pathrestrictions {
        if !check_typed(&def.name, "pathrestriction", diag) {
            continue;
        }
        if !seen.insert(def.name.clone()) {
            diag.error(format!("Duplicate definition of {}", def.name));
            continue;
        }
        let mut elements = Vec::new();
        for elem in &def.elements {
            if !elem.starts_with("interface:") {
                diag.error(format!("{} must not reference {elem}", def.name));
                continue;
            }
            match topo.intf_names.get(elem) {
                Some(&id) => {
                    if !elements.contains(&id) {
                        elements.push(id);
                    }
                }
                None if topo.disabled.contains(elem) => {}
                None => diag.error(format!("Can't resolve reference to {elem} in {}", def.name)),
            }
        }
        if elements.len() < 2 {
            diag.warning(format!(
                "Ignoring {} with less than 2 interfaces",
                def.name
            ));
            continue;
        }
        topo.add_pathrestriction(def.name.clone(), elements);
    }
}

fn setup_areas(topo: &mut Topology, tree: &ObjectTree, diag: &Diagnostics) {
    for def in &tree.areas {
        if !check_typed(&def.name, "area", diag) {
            continue;
        }
        if topo.area_names.contains_key(&def.name) {
            diag.error(format!("Duplicate definition of {}", def.name));
            continue;
        }
        let mut area = Area {
            name: def.name.clone(),
            ..Area::default()
        };
        if let Some(anchor) = &def.anchor {
            match topo.network_names.get(anchor) {
                Some(&id) => area.anchor = Some(id),
                None => {
                    diag.error(format!("Can't resolve reference to {anchor} in {}", def.name));
                    continue;
                }
            }
        }
        area.border = resolve_borders(topo, &def.border, &def.name, diag);
        area.inclusive_border = resolve_borders(topo, &def.inclusive_border, &def.name, diag);
        for (tag, nat) in &def.nat {
            if let Some(nat) = parse_nat_def(tag, nat, None, &def.name, diag) {
                if matches!(nat.kind, NatKind::Translated(_)) && !nat.dynamic {
                    diag.error(format!(
                        "nat:{tag} of {} must be hidden, identity or dynamic to be inherited",
                        def.name
                    ));
                    continue;
                }
                area.nat.insert(tag.clone(), nat);
            }
        }
        area.owner = check_owner(topo, &def.owner, &def.name, diag);
        let id = AreaId(topo.areas.len());
        topo.area_names.insert(def.name.clone(), id);
        topo.areas.push(area);
    }
}

fn resolve_borders(
    topo: &Topology,
    names: &[String],
    area: &str,
    diag: &Diagnostics,
) -> Vec<IntfId> {
    let mut result = Vec::new();
    for name in names {
        match topo.intf_names.get(name) {
            Some(&id) => {
                if !result.contains(&id) {
                    result.push(id);
                }
            }
            None => diag.error(format!("Can't resolve reference to {name} in {area}")),
        }
    }
    result
}

fn check_cryptos(topo: &Topology, diag: &Diagnostics) {
    for crypto in &topo.cryptos {
        match (crypto.hub, crypto.spokes.is_empty()) {
            (None, true) => diag.warning(format!("No hub and no spokes defined for {}", crypto.name)),
            (None, false) => diag.error(format!("{} has spokes but no hub", crypto.name)),
            (Some(_), true) => diag.warning(format!("No spokes have been defined for {}", crypto.name)),
            (Some(hub), false) => {
                let router = topo.router(topo.intf(hub).router);
                if router.managed.is_none() {
                    diag.error(format!(
                        "Crypto hub {} must be located at managed router",
                        topo.intf(hub).name
                    ));
                }
            }
        }
    }
}
