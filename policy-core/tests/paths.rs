use std::path::PathBuf;

use policy_core::model::{Object, RouterId, Topology, ZoneId};
use policy_core::path::{Hop, PathEngine, PathNode};
use policy_core::{parse_file, parse_json, prepare_topology, CaptureWriter, Config, Diagnostics};
use pretty_assertions::assert_eq;

fn fixture(name: &str) -> PathBuf {
    PathBuf::from(env!("CARGO_MANIFEST_DIR"))
        .join("..")
        .join("fixtures")
        .join(name)
}

fn prepared(name: &str) -> (Topology, PathEngine) {
    let tree = parse_file(&fixture(name)).expect("parse fixture");
    let config = Config::default();
    let diag = Diagnostics::with_writer(&config, CaptureWriter::new());
    let prepared = prepare_topology(&tree, &config, &diag).expect("prepare");
    diag.finish();
    prepared
}

fn nodes(topo: &Topology) -> Vec<PathNode> {
    let zones = (0..topo.zones.len()).map(|z| PathNode::Zone(ZoneId(z)));
    let routers = topo
        .routers
        .iter()
        .enumerate()
        .filter(|(_, r)| r.is_path_node())
        .map(|(r, _)| PathNode::Router(RouterId(r)));
    zones.chain(routers).collect()
}

fn zone(topo: &Topology, net: &str) -> PathNode {
    PathEngine::node_of(topo, Object::Network(topo.network_names[net])).expect("zone")
}

fn reversed(hops: &[Hop]) -> Vec<Hop> {
    hops.iter()
        .rev()
        .map(|h| Hop {
            in_intf: h.out_intf,
            router: h.router,
            out_intf: h.in_intf,
        })
        .collect()
}

#[test]
fn path_lookup_is_reversible() {
    for name in ["two-zones.json", "redundant.json"] {
        let (topo, _) = prepared(name);
        let all = nodes(&topo);
        for &a in &all {
            for &b in &all {
                // Fresh engines, so that each direction is computed first once.
                let (_, mut forward_first) = prepared(name);
                let (_, mut backward_first) = prepared(name);
                let ab = forward_first.walk(&topo, a, b);
                let ba = backward_first.walk(&topo, b, a);
                match (ab, ba) {
                    (Ok(ab), Ok(ba)) => {
                        assert_eq!(reversed(&ab.hops), ba.hops);
                        assert_eq!(ab.first, ba.last);
                        assert_eq!(ab.last, ba.first);
                    }
                    (Err(_), Err(_)) => {}
                    (ab, ba) => panic!("asymmetric result {ab:?} / {ba:?}"),
                }
            }
        }
    }
}

#[test]
fn one_loop_per_redundant_pair() {
    let (topo, engine) = prepared("redundant.json");
    assert_eq!(engine.loop_count(), 2);
    for node in nodes(&topo) {
        if let Some(id) = engine.loop_of(node) {
            let exit = engine.loop_info(id).exit;
            assert!(
                engine.distance(node) > engine.distance(exit),
                "{} not farther than exit {}",
                PathEngine::node_name(&topo, node),
                PathEngine::node_name(&topo, exit)
            );
        }
    }
}

#[test]
fn restricted_router_is_avoided() {
    let (topo, mut engine) = prepared("redundant.json");
    let walk = engine
        .walk(&topo, zone(&topo, "network:n0"), zone(&topo, "network:n2"))
        .expect("path");
    let mut routers: Vec<&str> = walk
        .hops
        .iter()
        .map(|h| topo.router(h.router).name.as_str())
        .collect();
    routers.sort();
    routers.dedup();
    assert_eq!(routers, vec!["router:r1b", "router:r2a", "router:r2b"]);
    assert_eq!(walk.first.len(), 1);
    assert_eq!(walk.last.len(), 2);
}

#[test]
fn next_hop_follows_tree_edge() {
    let (topo, mut engine) = prepared("two-zones.json");
    let a = zone(&topo, "network:a");
    let b = zone(&topo, "network:b");
    let first = engine.next_hops(&topo, a, b).expect("path");
    assert_eq!(first, vec![topo.intf_names["interface:r.a"]]);
    assert_eq!(engine.distance(a).abs_diff(engine.distance(b)), 2);
}

#[test]
fn long_router_chain_is_walked_end_to_end() {
    const ROUTERS: usize = 5000;
    let addr = |i: usize| format!("10.{}.{}", i / 256, i % 256);
    let networks: Vec<String> = (0..=ROUTERS)
        .map(|i| format!(r#"{{ "name": "network:n{i}", "ip": "{}.0/24" }}"#, addr(i)))
        .collect();
    let routers: Vec<String> = (0..ROUTERS)
        .map(|i| {
            format!(
                r#"{{ "name": "router:r{i}", "managed": true, "model": "IOS", "interfaces": [
                  {{ "network": "network:n{i}", "ip": "{}.2", "hardware": "e0" }},
                  {{ "network": "network:n{}", "ip": "{}.1", "hardware": "e1" }}] }}"#,
                addr(i),
                i + 1,
                addr(i + 1)
            )
        })
        .collect();
    let json = format!(
        r#"{{ "networks": [{}], "routers": [{}] }}"#,
        networks.join(","),
        routers.join(",")
    );
    let tree = parse_json(&json).expect("parse");
    let config = Config::default();
    let diag = Diagnostics::with_writer(&config, CaptureWriter::new());
    let (topo, mut engine) = prepare_topology(&tree, &config, &diag).expect("prepare");
    diag.finish();

    assert_eq!(engine.loop_count(), 0);
    let first = zone(&topo, "network:n0");
    let last = zone(&topo, &format!("network:n{ROUTERS}"));
    assert_eq!(engine.distance(last) - engine.distance(first), 2 * ROUTERS);
    let walk = engine.walk(&topo, first, last).expect("path");
    assert_eq!(walk.hops.len(), ROUTERS);
    assert_eq!(topo.router(walk.hops[ROUTERS - 1].router).name, format!("router:r{}", ROUTERS - 1));
}
