use std::collections::HashMap;
use std::path::PathBuf;

use policy_core::model::{Object, RouterId, Topology, ZoneId};
use policy_core::setup::build_topology;
use policy_core::split::prepare_routers;
use policy_core::zone::set_zones;
use policy_core::{parse_file, parse_json, prepare_topology, CaptureWriter, Config, Diagnostics};
use pretty_assertions::assert_eq;

fn fixture(name: &str) -> PathBuf {
    PathBuf::from(env!("CARGO_MANIFEST_DIR"))
        .join("..")
        .join("fixtures")
        .join(name)
}

fn prepared(name: &str) -> Topology {
    let tree = parse_file(&fixture(name)).expect("parse fixture");
    let config = Config::default();
    let diag = Diagnostics::with_writer(&config, CaptureWriter::new());
    let (topo, _) = prepare_topology(&tree, &config, &diag).expect("prepare");
    diag.finish();
    topo
}

#[test]
fn every_network_belongs_to_exactly_one_zone() {
    for name in ["two-zones.json", "nat.json", "redundant.json"] {
        let topo = prepared(name);
        let mut seen: HashMap<usize, usize> = HashMap::new();
        for zone in &topo.zones {
            for net in &zone.networks {
                *seen.entry(net.index()).or_default() += 1;
            }
        }
        for (idx, net) in topo.networks.iter().enumerate() {
            let zone = net.zone.expect("zone");
            assert_eq!(seen.get(&idx), Some(&1), "{} in {name}", net.name);
            assert!(topo.zone(zone).networks.iter().any(|n| n.index() == idx));
        }
    }
}

#[test]
fn managed_interfaces_separate_zones() {
    let topo = prepared("redundant.json");
    assert_eq!(topo.zones.len(), 3);
    for router in topo.routers.iter().filter(|r| r.managed.is_some()) {
        let zones: Vec<ZoneId> = router
            .interfaces
            .iter()
            .map(|&i| topo.intf(i).zone.expect("zone"))
            .collect();
        assert_ne!(zones[0], zones[1], "{}", router.name);
    }
}

#[test]
fn zone_named_after_first_network() {
    let topo = prepared("two-zones.json");
    let a = topo.network_names["network:a"];
    let zone = topo.network(a).zone.expect("zone");
    assert_eq!(topo.zone(zone).name, "any:[network:a]");
}

const SPLIT: &str = r#"{
  "networks": [{ "name": "network:a", "ip": "10.1.1.0/24" },
               { "name": "network:b", "ip": "10.1.2.0/24" },
               { "name": "network:c", "ip": "10.1.3.0/24" },
               { "name": "network:d", "ip": "10.1.4.0/24" }],
  "routers": [{ "name": "router:r", "interfaces": [INTERFACES] },
              { "name": "router:s", "interfaces": [
                { "network": "network:a", "ip": "10.1.1.2" },
                { "network": "network:c", "ip": "10.1.3.2" }] }],
  "pathrestrictions": [
    { "name": "pathrestriction:p1", "elements": ["interface:r.a", "interface:s.a"] },
    { "name": "pathrestriction:p2", "elements": ["interface:r.c", "interface:s.c"] }]
}"#;

fn split_devices(order: &[&str]) -> (usize, usize) {
    let interfaces: Vec<String> = order
        .iter()
        .map(|n| {
            let ip = match *n {
                "a" => "10.1.1.1",
                "b" => "10.1.2.1",
                "c" => "10.1.3.1",
                _ => "10.1.4.1",
            };
            format!(r#"{{ "network": "network:{n}", "ip": "{ip}" }}"#)
        })
        .collect();
    let json = SPLIT.replace("INTERFACES", &interfaces.join(","));
    let tree = parse_json(&json).expect("parse");
    let config = Config::default();
    let diag = Diagnostics::with_writer(&config, CaptureWriter::new());
    let mut topo = build_topology(&tree, &config, &diag);
    prepare_routers(&mut topo, &diag);
    set_zones(&mut topo);
    diag.finish();
    let fragments = topo.routers.iter().filter(|r| r.device == "router:r").count();
    let restricted = topo
        .routers
        .iter()
        .filter(|r| r.orig_router == Some(RouterId(0)))
        .count();
    (fragments, restricted)
}

#[test]
fn split_count_independent_of_interface_order() {
    let wanted = (3, 2);
    assert_eq!(split_devices(&["a", "b", "c", "d"]), wanted);
    assert_eq!(split_devices(&["d", "c", "b", "a"]), wanted);
    assert_eq!(split_devices(&["c", "a", "d", "b"]), wanted);
}

#[test]
fn objects_resolve_by_name() {
    let topo = prepared("two-zones.json");
    assert!(matches!(
        topo.object_by_name("interface:r.b"),
        Some(Object::Interface(_))
    ));
    assert!(topo.object_by_name("network:missing").is_none());
}

#[test]
fn split_router_joins_its_unrestricted_networks() {
    let tree = parse_json(
        r#"{
          "networks": [{ "name": "network:a", "ip": "10.1.1.0/24",
                         "nat": { "x": { "ip": "192.168.1.0/24" } } },
                       { "name": "network:b", "ip": "10.1.2.0/24" },
                       { "name": "network:d", "ip": "10.1.4.0/24" }],
          "routers": [{ "name": "router:r", "interfaces": [
            { "network": "network:a", "ip": "10.1.1.1" },
            { "network": "network:b", "ip": "10.1.2.1" },
            { "network": "network:d", "ip": "10.1.4.1", "bind_nat": ["x"] }] }]
        }"#,
    )
    .expect("parse");
    let config = Config::default();
    let out = CaptureWriter::new();
    let diag = Diagnostics::with_writer(&config, out.clone());
    let (topo, _) = prepare_topology(&tree, &config, &diag).expect("prepare");
    diag.finish();
    assert!(!out.contents().contains("Error"), "{}", out.contents());

    let zone_of = |name: &str| topo.network(topo.network_names[name]).zone.expect("zone");
    assert_eq!(zone_of("network:a"), zone_of("network:b"));
    assert_ne!(zone_of("network:a"), zone_of("network:d"));
    assert_eq!(topo.zones.len(), 2);

    let r = topo.router_names["router:r"];
    assert!(!topo.router(r).semi_managed);
    let d = topo.intf_names["interface:r.d"];
    assert!(topo.router(topo.intf(d).router).semi_managed);
}
