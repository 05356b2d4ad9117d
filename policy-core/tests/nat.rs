use std::collections::BTreeSet;
use std::path::PathBuf;

use ipnetwork::IpNetwork;
use policy_core::model::{NatDef, NatKind, NatSet, Network, NetworkId, Object, Topology};
use policy_core::nat::{combine_nat_sets, nat_set_at, object_addresses, NatView};
use policy_core::{
    nat_export, parse_file, parse_json, prepare_topology, CaptureWriter, Config, Diagnostics,
};
use pretty_assertions::assert_eq;
use proptest::prelude::*;

fn fixture(name: &str) -> PathBuf {
    PathBuf::from(env!("CARGO_MANIFEST_DIR"))
        .join("..")
        .join("fixtures")
        .join(name)
}

#[test]
fn bound_tag_is_active_behind_binding_interface() {
    let tree = parse_file(&fixture("nat.json")).expect("parse fixture");
    let config = Config::default();
    let out = CaptureWriter::new();
    let diag = Diagnostics::with_writer(&config, out.clone());
    let (topo, _) = prepare_topology(&tree, &config, &diag).expect("prepare");

    assert_eq!(topo.nat_domains.len(), 2);
    let dmz = nat_set_at(&topo, topo.intf_names["interface:fw.dmz"]);
    let inside = nat_set_at(&topo, topo.intf_names["interface:fw.intern"]);
    assert!(dmz.contains("x"));
    assert!(inside.is_empty());

    let h1 = Object::Host(topo.host_names["host:h1"]);
    let seen = object_addresses(&topo, h1, &dmz).expect("visible");
    assert_eq!(seen, vec!["192.168.1.10/32".parse().expect("net")]);

    let export = nat_export(&topo, &diag);
    diag.finish();
    assert_eq!(export.owners["owner:dmz"], vec!["x".to_string()]);
    assert!(export.owners["owner:intern"].is_empty());
    assert_eq!(export.objects["host:h1"].nat["x"], "192.168.1.10");
    assert!(!out.contents().contains("Error"), "{}", out.contents());
}

fn nat(tag: &str, kind: NatKind) -> NatDef {
    NatDef {
        tag: tag.to_string(),
        dynamic: kind == NatKind::Hidden,
        kind,
    }
}

/// Three networks, each with a static and a hidden tag.
fn nat_topology() -> Topology {
    let mut topo = Topology::default();
    for (idx, name) in ["network:a", "network:b", "network:c"].iter().enumerate() {
        let real: IpNetwork = format!("10.1.{idx}.0/24").parse().expect("net");
        let pool: IpNetwork = format!("192.168.{idx}.0/24").parse().expect("pool");
        let mut net = Network::new(*name, Some(real));
        net.nat.insert(format!("s{idx}"), nat(&format!("s{idx}"), NatKind::Translated(pool)));
        net.nat.insert(format!("h{idx}"), nat(&format!("h{idx}"), NatKind::Hidden));
        topo.add_network(net);
    }
    topo
}

const TAGS: [&str; 6] = ["s0", "h0", "s1", "h1", "s2", "h2"];

fn nat_set() -> impl Strategy<Value = NatSet> {
    proptest::sample::subsequence(TAGS.to_vec(), 0..=3).prop_map(|tags| tags.into_iter().collect())
}

fn view() -> impl Strategy<Value = NatView> {
    let tags = proptest::sample::subsequence(vec!["x", "y", "z"], 0..=2)
        .prop_map(|t| t.into_iter().map(str::to_string).collect::<BTreeSet<String>>());
    let addr = prop_oneof![
        Just(None),
        Just(Some("10.1.1.0/24".parse::<IpNetwork>().expect("net"))),
        Just(Some("192.168.1.0/24".parse::<IpNetwork>().expect("net"))),
    ];
    prop_oneof![
        tags.clone().prop_map(NatView::Hidden),
        (addr, tags).prop_map(|(addr, tags)| NatView::Visible { addr, tags }),
        Just(NatView::Mixed),
    ]
}

proptest! {
    #[test]
    fn view_combination_is_commutative_and_associative(a in view(), b in view(), c in view()) {
        prop_assert_eq!(a.clone().combine(b.clone()), b.clone().combine(a.clone()));
        prop_assert_eq!(
            a.clone().combine(b.clone()).combine(c.clone()),
            a.combine(b.combine(c))
        );
    }

    #[test]
    fn set_combination_ignores_order(sets in proptest::collection::vec(nat_set(), 1..5)) {
        let topo = nat_topology();
        let forward: Vec<&NatSet> = sets.iter().collect();
        let backward: Vec<&NatSet> = sets.iter().rev().collect();
        let mut rotated = forward.clone();
        rotated.rotate_left(1);
        let expected = combine_nat_sets(&topo, &forward);
        prop_assert_eq!(&combine_nat_sets(&topo, &backward), &expected);
        prop_assert_eq!(&combine_nat_sets(&topo, &rotated), &expected);
    }
}

#[test]
fn concrete_and_absent_tag_combine_to_real_address() {
    let topo = nat_topology();
    let d1: NatSet = ["s0"].into_iter().collect();
    let d2 = NatSet::new();
    let combined = combine_nat_sets(&topo, &[&d1, &d2]);
    let a = Object::Network(NetworkId(0));
    let addrs = object_addresses(&topo, a, &combined.set).expect("visible");
    assert_eq!(addrs, vec!["10.1.0.0/24".parse().expect("net")]);
}

#[test]
fn concrete_address_beats_hidden() {
    let topo = nat_topology();
    let d1: NatSet = ["s1"].into_iter().collect();
    let d2: NatSet = ["h1"].into_iter().collect();
    let combined = combine_nat_sets(&topo, &[&d1, &d2]);
    assert!(combined.set.contains("s1"));
    assert!(!combined.set.contains("h1"));
    assert!(combined.conflicts.is_empty());
}

/// Prepare `json`; returns the topology if no error stopped the run, and all messages.
fn prepare(json: &str) -> (Option<Topology>, String) {
    let tree = parse_json(json).expect("parse");
    let config = Config::default();
    let out = CaptureWriter::new();
    let diag = Diagnostics::with_writer(&config, out.clone());
    let topo = prepare_topology(&tree, &config, &diag).ok().map(|(topo, _)| topo);
    diag.finish();
    (topo, out.contents())
}

fn tags(topo: &Topology, intf: &str) -> Vec<String> {
    nat_set_at(topo, topo.intf_names[intf]).tags().map(str::to_string).collect()
}

/// n1 -r1- n2 -r2- n3 with managed routers; INTF1 and INTF2 are the
/// attributes of the interfaces towards n2 and n3.
const CHAIN: &str = r#"{
  "networks": [{ "name": "network:n1", "ip": "10.1.1.0/24", "nat": NAT },
               { "name": "network:n2", "ip": "10.1.2.0/24" },
               { "name": "network:n3", "ip": "10.1.3.0/24" }],
  "routers": [
    { "name": "router:r1", "managed": true, "model": "IOS", "interfaces": [
      { "network": "network:n1", "ip": "10.1.1.1", "hardware": "e0" },
      { "network": "network:n2", "ip": "10.1.2.1", "hardware": "e1", "bind_nat": INTF1 }] },
    { "name": "router:r2", "managed": true, "model": "IOS", "interfaces": [
      { "network": "network:n2", "ip": "10.1.2.2", "hardware": "e0" },
      { "network": "network:n3", "ip": "10.1.3.1", "hardware": "e1", "bind_nat": INTF2 }] }]
}"#;

fn chain(nat: &str, intf1: &str, intf2: &str) -> String {
    CHAIN
        .replace("NAT", nat)
        .replace("INTF1", intf1)
        .replace("INTF2", intf2)
}

#[test]
fn tag_spreads_away_from_binding_router_only() {
    let json = chain(r#"{ "x": { "ip": "192.168.1.0/24" } }"#, r#"["x"]"#, r#"["y"]"#)
        .replace(
            r#"{ "name": "network:n2", "ip": "10.1.2.0/24" }"#,
            r#"{ "name": "network:n2", "ip": "10.1.2.0/24", "nat": { "y": { "hidden": true } } }"#,
        );
    let (topo, messages) = prepare(&json);
    let topo = topo.expect("prepared");
    assert_eq!(messages, "");
    assert!(tags(&topo, "interface:r1.n1").is_empty());
    assert_eq!(tags(&topo, "interface:r1.n2"), vec!["x"]);
    assert_eq!(tags(&topo, "interface:r2.n3"), vec!["x", "y"]);
}

#[test]
fn grouped_tag_takes_over_from_its_rival() {
    let nat = r#"{ "x": { "ip": "192.168.1.0/24" }, "y": { "ip": "192.168.2.0/24" } }"#;
    let (topo, messages) = prepare(&chain(nat, r#"["x"]"#, r#"["y"]"#));
    let topo = topo.expect("prepared");
    assert_eq!(messages, "");
    assert_eq!(tags(&topo, "interface:r1.n2"), vec!["x"]);
    assert_eq!(tags(&topo, "interface:r2.n3"), vec!["y"]);
}

#[test]
fn grouped_tags_must_not_meet_in_one_domain() {
    let nat = r#"{ "x": { "ip": "192.168.1.0/24" }, "y": { "ip": "192.168.2.0/24" } }"#;
    let json = chain(nat, r#"["x"]"#, "[]").replace(
        r#"{ "network": "network:n2", "ip": "10.1.2.2", "hardware": "e0" }"#,
        r#"{ "network": "network:n2", "ip": "10.1.2.2", "hardware": "e0", "bind_nat": ["y"] }"#,
    );
    let (topo, messages) = prepare(&json);
    assert!(topo.is_none());
    assert!(
        messages.contains("Error: Grouped NAT tags 'x' and 'y' of network:n1 must not both be active in"),
        "{messages}"
    );
}

#[test]
fn network_must_not_be_translated_in_its_own_domain() {
    let json = chain(r#"{ "x": { "ip": "192.168.1.0/24" } }"#, "[]", "[]").replace(
        r#"{ "network": "network:n1", "ip": "10.1.1.1", "hardware": "e0" }"#,
        r#"{ "network": "network:n1", "ip": "10.1.1.1", "hardware": "e0", "bind_nat": ["x"] }"#,
    );
    let (topo, messages) = prepare(&json);
    assert!(topo.is_none());
    assert!(
        messages.contains(
            "Error: network:n1 is translated by nat:x,\n but is located inside the translation domain of x."
        ),
        "{messages}"
    );
    assert!(messages.contains(" - interface:r1.n1"), "{messages}");
}

#[test]
fn useless_and_unbound_tags_are_warned() {
    let (topo, messages) = prepare(&chain(r#"{ "x": { "ip": "192.168.1.0/24" } }"#, r#"["q"]"#, "[]"));
    assert!(topo.is_some());
    assert_eq!(
        messages,
        "Warning: Ignoring useless nat:q bound at interface:r1.n2\n\
         Warning: nat:x is defined, but not bound to any interface\n"
    );
}

#[test]
fn different_binding_inside_one_domain_is_inconsistent() {
    let (topo, messages) = prepare(
        r#"{
          "networks": [{ "name": "network:a", "ip": "10.1.1.0/24",
                         "nat": { "x": { "ip": "192.168.1.0/24" } } },
                       { "name": "network:b", "ip": "10.1.2.0/24" }],
          "routers": [
            { "name": "router:r1", "managed": true, "model": "IOS", "interfaces": [
              { "network": "network:a", "ip": "10.1.1.1", "hardware": "e0" },
              { "network": "network:b", "ip": "10.1.2.1", "hardware": "e1", "bind_nat": ["x"] }] },
            { "name": "router:r2", "managed": true, "model": "IOS", "interfaces": [
              { "network": "network:a", "ip": "10.1.1.2", "hardware": "e0" },
              { "network": "network:b", "ip": "10.1.2.2", "hardware": "e1" }] }]
        }"#,
    );
    assert!(topo.is_none());
    assert!(
        messages.contains(
            "Error: Inconsistent NAT in loop at router:r1:\n - interface:r1.a: (none)\n - interface:r1.b: x\n"
        ),
        "{messages}"
    );
}
