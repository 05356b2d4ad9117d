//! Flat arena tables of the topology.
//!
//! Objects refer to each other through typed indices instead of pointers;
//! every relation of the policy graph (network to zone, interface to
//! router, zone to area and so on) is a field holding one of these ids.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::net::IpAddr;

use ipnetwork::IpNetwork;

macro_rules! arena_id {
    ($($name:ident),* $(,)?) => {$(
        #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
        pub struct $name(pub usize);

        impl $name {
            pub fn index(self) -> usize {
                self.0
            }
        }
    )*};
}

arena_id!(
    NetworkId,
    HostId,
    RouterId,
    IntfId,
    ZoneId,
    AreaId,
    AggregateId,
    NatDomainId,
    PathRestrictionId,
    CryptoId,
);

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NatKind {
    Translated(IpNetwork),
    Hidden,
    Identity,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NatDef {
    pub tag: String,
    pub kind: NatKind,
    /// Many-to-one translation; always set for hidden NAT.
    pub dynamic: bool,
}

#[derive(Debug, Clone)]
pub struct Network {
    pub name: String,
    /// `None` for unnumbered and tunnel networks.
    pub addr: Option<IpNetwork>,
    pub tunnel: bool,
    pub loopback: bool,
    pub nat: BTreeMap<String, NatDef>,
    pub subnet_of: Option<NetworkId>,
    /// Smallest network of the same zone containing this one.
    pub up: Option<NetworkId>,
    pub hosts: Vec<HostId>,
    pub interfaces: Vec<IntfId>,
    pub zone: Option<ZoneId>,
    pub owner: Option<String>,
}

impl Network {
    pub fn new(name: impl Into<String>, addr: Option<IpNetwork>) -> Self {
        Self {
            name: name.into(),
            addr,
            tunnel: false,
            loopback: false,
            nat: BTreeMap::new(),
            subnet_of: None,
            up: None,
            hosts: Vec::new(),
            interfaces: Vec::new(),
            zone: None,
            owner: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HostAddr {
    Single(IpAddr),
    Range(IpAddr, IpAddr),
}

#[derive(Debug, Clone)]
pub struct Host {
    pub name: String,
    pub addr: HostAddr,
    pub network: NetworkId,
    /// Static addresses inside dynamic NAT pools, by tag.
    pub nat: BTreeMap<String, IpAddr>,
    pub owner: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Managed {
    Standard,
    Full,
    Secondary,
    Primary,
    Local,
    RoutingOnly,
}

#[derive(Debug, Clone)]
pub struct Router {
    pub name: String,
    /// Name of the physical device; shared by all fragments of a router.
    pub device: String,
    pub managed: Option<Managed>,
    pub model: Option<String>,
    /// Unmanaged, but separates zones (path restriction, bind_nat, crypto spoke).
    pub semi_managed: bool,
    pub interfaces: Vec<IntfId>,
    pub orig_router: Option<RouterId>,
    pub owner: Option<String>,
}

impl Router {
    /// Routers that are nodes of the path graph.
    pub fn is_path_node(&self) -> bool {
        self.managed.is_some() || self.semi_managed
    }

    /// Routers receiving access lists.
    pub fn filters(&self) -> bool {
        matches!(self.managed, Some(m) if m != Managed::RoutingOnly)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IntfAddr {
    Ip(IpAddr),
    Unnumbered,
    Negotiated,
    Tunnel,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Redundancy {
    pub ip: IpAddr,
    pub kind: Option<String>,
    pub id: Option<String>,
}

#[derive(Debug, Clone)]
pub struct Interface {
    pub name: String,
    pub router: RouterId,
    pub network: NetworkId,
    pub addr: IntfAddr,
    pub hardware: Option<String>,
    /// Sorted and deduplicated.
    pub bind_nat: Vec<String>,
    pub nat: BTreeMap<String, IpAddr>,
    pub hub: Vec<CryptoId>,
    pub spoke: Option<CryptoId>,
    pub redundancy: Option<Redundancy>,
    pub redundancy_group: Vec<IntfId>,
    pub path_restrict: Vec<PathRestrictionId>,
    pub loopback: bool,
    /// Real interface carrying this tunnel interface.
    pub real_intf: Option<IntfId>,
    /// Interface at the other side of a split link.
    pub split_other: Option<IntfId>,
    /// Zone at the network side; for unmanaged routers the zone containing the router.
    pub zone: Option<ZoneId>,
    pub owner: Option<String>,
}

impl Interface {
    pub fn new(name: impl Into<String>, router: RouterId, network: NetworkId, addr: IntfAddr) -> Self {
        Self {
            name: name.into(),
            router,
            network,
            addr,
            hardware: None,
            bind_nat: Vec::new(),
            nat: BTreeMap::new(),
            hub: Vec::new(),
            spoke: None,
            redundancy: None,
            redundancy_group: Vec::new(),
            path_restrict: Vec::new(),
            loopback: false,
            real_intf: None,
            split_other: None,
            zone: None,
            owner: None,
        }
    }

    pub fn is_tunnel(&self) -> bool {
        self.addr == IntfAddr::Tunnel
    }
}

#[derive(Debug, Clone, Default)]
pub struct Zone {
    pub name: String,
    pub networks: Vec<NetworkId>,
    /// Interfaces of path-node routers bordering this zone.
    pub interfaces: Vec<IntfId>,
    pub unmanaged_routers: Vec<RouterId>,
    pub aggregates: Vec<AggregateId>,
    pub cluster: usize,
    pub in_area: Option<AreaId>,
    pub nat_domain: Option<NatDomainId>,
    pub tunnel: bool,
}

#[derive(Debug, Clone)]
pub struct Aggregate {
    pub name: String,
    pub addr: IpNetwork,
    pub zone: ZoneId,
    pub nat: BTreeMap<String, NatDef>,
    pub owner: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct Area {
    pub name: String,
    pub anchor: Option<NetworkId>,
    pub border: Vec<IntfId>,
    pub inclusive_border: Vec<IntfId>,
    pub nat: BTreeMap<String, NatDef>,
    pub owner: Option<String>,
    pub zones: Vec<ZoneId>,
    pub managed_routers: Vec<RouterId>,
    pub in_area: Option<AreaId>,
}

#[derive(Debug, Clone)]
pub struct PathRestriction {
    pub name: String,
    pub elements: Vec<IntfId>,
}

#[derive(Debug, Clone, Default)]
pub struct Crypto {
    pub name: String,
    pub bind_nat: Vec<String>,
    pub hub: Option<IntfId>,
    pub spokes: Vec<IntfId>,
    pub tunnels: Vec<NetworkId>,
}

/// Immutable set of active NAT tags.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NatSet(BTreeSet<String>);

impl NatSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn contains(&self, tag: &str) -> bool {
        self.0.contains(tag)
    }

    pub fn tags(&self) -> impl Iterator<Item = &str> {
        self.0.iter().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub(crate) fn insert(&mut self, tag: &str) -> bool {
        self.0.insert(tag.to_string())
    }
}

impl<S: Into<String>> FromIterator<S> for NatSet {
    fn from_iter<I: IntoIterator<Item = S>>(iter: I) -> Self {
        Self(iter.into_iter().map(Into::into).collect())
    }
}

#[derive(Debug, Clone, Default)]
pub struct NatDomain {
    pub name: String,
    pub zones: Vec<ZoneId>,
    pub routers: Vec<RouterId>,
    pub nat_set: NatSet,
}

/// Object usable as source or destination of a rule.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Object {
    Network(NetworkId),
    Host(HostId),
    Interface(IntfId),
    Aggregate(AggregateId),
}

#[derive(Debug, Clone, Default)]
pub struct Topology {
    pub networks: Vec<Network>,
    pub hosts: Vec<Host>,
    pub routers: Vec<Router>,
    pub interfaces: Vec<Interface>,
    pub zones: Vec<Zone>,
    pub clusters: Vec<Vec<ZoneId>>,
    pub areas: Vec<Area>,
    pub aggregates: Vec<Aggregate>,
    pub nat_domains: Vec<NatDomain>,
    pub pathrestrictions: Vec<PathRestriction>,
    pub cryptos: Vec<Crypto>,
    pub owners: BTreeMap<String, Vec<String>>,

    pub network_names: HashMap<String, NetworkId>,
    pub host_names: HashMap<String, HostId>,
    pub router_names: HashMap<String, RouterId>,
    pub intf_names: HashMap<String, IntfId>,
    pub area_names: HashMap<String, AreaId>,
    /// One aggregate per zone of the linked cluster.
    pub aggregate_names: BTreeMap<String, Vec<AggregateId>>,
    /// Names of disabled or filtered objects; rules silently skip them.
    pub disabled: HashSet<String>,
}

impl Topology {
    pub fn network(&self, id: NetworkId) -> &Network {
        &self.networks[id.0]
    }

    pub fn host(&self, id: HostId) -> &Host {
        &self.hosts[id.0]
    }

    pub fn router(&self, id: RouterId) -> &Router {
        &self.routers[id.0]
    }

    pub fn intf(&self, id: IntfId) -> &Interface {
        &self.interfaces[id.0]
    }

    pub fn zone(&self, id: ZoneId) -> &Zone {
        &self.zones[id.0]
    }

    pub fn area(&self, id: AreaId) -> &Area {
        &self.areas[id.0]
    }

    pub fn aggregate(&self, id: AggregateId) -> &Aggregate {
        &self.aggregates[id.0]
    }

    pub fn nat_domain(&self, id: NatDomainId) -> &NatDomain {
        &self.nat_domains[id.0]
    }

    pub fn add_network(&mut self, network: Network) -> NetworkId {
        let id = NetworkId(self.networks.len());
        self.networks.push(network);
        id
    }

    pub fn add_router(&mut self, router: Router) -> RouterId {
        let id = RouterId(self.routers.len());
        self.routers.push(router);
        id
    }

    /// Append an interface and link it to its router and network.
    pub fn add_interface(&mut self, intf: Interface) -> IntfId {
        let id = IntfId(self.interfaces.len());
        self.routers[intf.router.0].interfaces.push(id);
        self.networks[intf.network.0].interfaces.push(id);
        self.interfaces.push(intf);
        id
    }

    pub fn add_pathrestriction(&mut self, name: impl Into<String>, elements: Vec<IntfId>) -> PathRestrictionId {
        let id = PathRestrictionId(self.pathrestrictions.len());
        for &intf in &elements {
            self.interfaces[intf.0].path_restrict.push(id);
        }
        self.pathrestrictions.push(PathRestriction {
            name: name.into(),
            elements,
        });
        id
    }

    pub fn object_name(&self, obj: Object) -> &str {
        match obj {
            Object::Network(id) => &self.network(id).name,
            Object::Host(id) => &self.host(id).name,
            Object::Interface(id) => &self.intf(id).name,
            Object::Aggregate(id) => &self.aggregate(id).name,
        }
    }

    /// Object named `name`; aggregates resolve to their first zone.
    pub fn object_by_name(&self, name: &str) -> Option<Object> {
        match name.split_once(':')?.0 {
            "network" => self.network_names.get(name).map(|&id| Object::Network(id)),
            "host" => self.host_names.get(name).map(|&id| Object::Host(id)),
            "interface" => self.intf_names.get(name).map(|&id| Object::Interface(id)),
            "any" => self
                .aggregate_names
                .get(name)
                .and_then(|ids| ids.first())
                .map(|&id| Object::Aggregate(id)),
            _ => None,
        }
    }

    /// Network an object belongs to; aggregates have none.
    pub fn object_network(&self, obj: Object) -> Option<NetworkId> {
        match obj {
            Object::Network(id) => Some(id),
            Object::Host(id) => Some(self.host(id).network),
            Object::Interface(id) => Some(self.intf(id).network),
            Object::Aggregate(_) => None,
        }
    }

    pub fn object_is_v6(&self, obj: Object) -> bool {
        match obj {
            Object::Aggregate(id) => self.aggregate(id).addr.is_ipv6(),
            _ => self
                .object_network(obj)
                .and_then(|n| self.network(n).addr)
                .is_some_and(|addr| addr.is_ipv6()),
        }
    }

    /// NAT domain seen at the network side of `intf`.
    pub fn intf_nat_domain(&self, intf: IntfId) -> Option<NatDomainId> {
        self.intf(intf).zone.and_then(|z| self.zone(z).nat_domain)
    }

    /// Short name without type prefix, e.g. `r1` for `router:r1`.
    pub fn short_name(name: &str) -> &str {
        name.split_once(':').map_or(name, |(_, rest)| rest)
    }
}
