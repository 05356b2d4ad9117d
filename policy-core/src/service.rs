//! Normalize services into rules over topology objects.
//!
//! Each rule of a service is expanded to lists of source and destination
//! objects plus a list of protocols. Groups are resolved recursively,
//! `user` is replaced by the objects of the service's `user` attribute and
//! aggregates expand to one object per zone of their cluster. Rules mixing
//! IPv4 and IPv6 objects are split per address family.

use std::collections::{BTreeSet, HashMap, HashSet};

use tracing::debug;

use crate::diag::Diagnostics;
use crate::input::{Action, ObjectTree, ServiceDef};
use crate::model::{IntfAddr, Object, Topology};
use crate::protocol::{Protocol, ProtocolTable};
use crate::setup::check_typed;

/// A normalized rule; every object has a path node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rule {
    pub service: String,
    pub deny: bool,
    pub src: Vec<Object>,
    pub dst: Vec<Object>,
    pub prt: Vec<Protocol>,
    pub log: Option<String>,
}

struct Expander<'a> {
    topo: &'a Topology,
    groups: HashMap<&'a str, &'a [String]>,
    diag: &'a Diagnostics,
}

impl<'a> Expander<'a> {
    fn new(topo: &'a Topology, tree: &'a ObjectTree, diag: &'a Diagnostics) -> Self {
        let mut groups = HashMap::new();
        for def in &tree.groups {
            if !check_typed(&def.name, "group", diag) {
                continue;
            }
            if groups.insert(def.name.as_str(), def.elements.as_slice()).is_some() {
                diag.error(format!("Duplicate definition of {}", def.name));
            }
        }
        Self { topo, groups, diag }
    }

    /// Expand `names`; `user` is substituted by `user_objects` when given.
    fn expand(&self, names: &[String], context: &str, user_objects: Option<&[Object]>) -> Vec<Object> {
        let mut out = Vec::new();
        let mut visiting = Vec::new();
        for name in names {
            self.expand_one(name, context, user_objects, &mut visiting, &mut out);
        }
        self.dedup(out, context)
    }

    fn dedup(&self, objects: Vec<Object>, context: &str) -> Vec<Object> {
        let mut seen = HashSet::new();
        let mut unique = Vec::with_capacity(objects.len());
        let mut duplicates = BTreeSet::new();
        for obj in objects {
            if seen.insert(obj) {
                unique.push(obj);
            } else {
                duplicates.insert(self.topo.object_name(obj).to_string());
            }
        }
        if !duplicates.is_empty() {
            let names: Vec<String> = duplicates.into_iter().collect();
            self.diag.warning(format!(
                "Duplicate elements in {context}:\n - {}",
                names.join("\n - ")
            ));
        }
        unique
    }

    fn expand_one(
        &self,
        name: &str,
        context: &str,
        user_objects: Option<&[Object]>,
        visiting: &mut Vec<String>,
        out: &mut Vec<Object>,
    ) {
        let topo = self.topo;
        if name == "user" {
            match user_objects {
                Some(objects) => out.extend_from_slice(objects),
                None => self
                    .diag
                    .error(format!("Unexpected reference to 'user' in {context}")),
            }
            return;
        }
        if topo.disabled.contains(name) {
            return;
        }
        let (kind, _) = name.split_once(':').unwrap_or((name, ""));
        let found = match kind {
            "group" => {
                let Some(elements) = self.groups.get(name) else {
                    self.unresolved(name, context);
                    return;
                };
                if visiting.iter().any(|v| v == name) {
                    self.diag
                        .error(format!("Found recursion in definition of {name}"));
                    return;
                }
                visiting.push(name.to_string());
                for element in elements.iter() {
                    self.expand_one(element, name, user_objects, visiting, out);
                }
                visiting.pop();
                return;
            }
            "network" => topo.network_names.get(name).map(|&id| vec![Object::Network(id)]),
            "host" => topo.host_names.get(name).map(|&id| vec![Object::Host(id)]),
            "any" => topo
                .aggregate_names
                .get(name)
                .map(|ids| ids.iter().map(|&id| Object::Aggregate(id)).collect()),
            "interface" => match name.strip_suffix(".[all]") {
                Some(router) => self.all_interfaces(&format!("router:{}", &router["interface:".len()..])),
                None => topo.intf_names.get(name).map(|&id| vec![Object::Interface(id)]),
            },
            _ => None,
        };
        match found {
            Some(objects) => out.extend(objects),
            None => self.unresolved(name, context),
        }
    }

    /// Numbered and negotiated interfaces of all fragments of one device.
    fn all_interfaces(&self, router: &str) -> Option<Vec<Object>> {
        let topo = self.topo;
        if !topo.router_names.contains_key(router) {
            return None;
        }
        let objects = topo
            .routers
            .iter()
            .filter(|r| r.device == router)
            .flat_map(|r| r.interfaces.iter().copied())
            .filter(|&i| matches!(topo.intf(i).addr, IntfAddr::Ip(_) | IntfAddr::Negotiated))
            .filter(|&i| topo.intf(i).split_other.is_none())
            .map(Object::Interface)
            .collect();
        Some(objects)
    }

    fn unresolved(&self, name: &str, context: &str) {
        self.diag
            .error(format!("Can't resolve reference to {name} in {context}"));
    }
}

fn split_family(topo: &Topology, objects: &[Object]) -> (Vec<Object>, Vec<Object>) {
    objects.iter().partition(|&&obj| !topo.object_is_v6(obj))
}

fn normalize_service(
    expander: &Expander<'_>,
    prt_table: &ProtocolTable,
    def: &ServiceDef,
    rules: &mut Vec<Rule>,
) {
    let diag = expander.diag;
    let user = expander.expand(&def.user, &format!("user of {}", def.name), None);
    for (idx, rdef) in def.rules.iter().enumerate() {
        let context = format!("rule {} of {}", idx + 1, def.name);
        let src = expander.expand(&rdef.src, &format!("src of {context}"), Some(&user));
        let dst = expander.expand(&rdef.dst, &format!("dst of {context}"), Some(&user));
        let prt = prt_table.expand(&rdef.prt, &context, diag);
        if src.is_empty() || dst.is_empty() || prt.is_empty() {
            continue;
        }
        let (src4, src6) = split_family(expander.topo, &src);
        let (dst4, dst6) = split_family(expander.topo, &dst);
        if src4.is_empty() != dst4.is_empty() || src6.is_empty() != dst6.is_empty() {
            diag.error(format!(
                "Must not use objects of different IP versions in src and dst of {context}"
            ));
            continue;
        }
        for (src, dst) in [(src4, dst4), (src6, dst6)] {
            if src.is_empty() {
                continue;
            }
            rules.push(Rule {
                service: def.name.clone(),
                deny: rdef.action == Action::Deny,
                src,
                dst,
                prt: prt.clone(),
                log: rdef.log.clone(),
            });
        }
    }
}

/// Expand all enabled services into rules.
pub fn normalize_services(
    topo: &Topology,
    tree: &ObjectTree,
    prt_table: &ProtocolTable,
    diag: &Diagnostics,
) -> Vec<Rule> {
    let expander = Expander::new(topo, tree, diag);
    let mut names = HashSet::new();
    let mut rules = Vec::new();
    for def in &tree.services {
        if !check_typed(&def.name, "service", diag) {
            continue;
        }
        if !names.insert(def.name.as_str()) {
            diag.error(format!("Duplicate definition of {}", def.name));
            continue;
        }
        if def.disabled {
            continue;
        }
        normalize_service(&expander, prt_table, def, &mut rules);
    }
    check_redundant_rules(&rules, diag);
    debug!(services = names.len(), rules = rules.len(), "services normalized");
    rules
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
enum Redundancy {
    Duplicate(String, String),
    Redundant(String, String),
}

/// Warn about rules of different services having the same effect.
fn check_redundant_rules(rules: &[Rule], diag: &Diagnostics) {
    let mut seen: HashMap<(bool, Object, Object), Vec<(Protocol, usize)>> = HashMap::new();
    let mut found = BTreeSet::new();
    for (idx, rule) in rules.iter().enumerate() {
        for &src in &rule.src {
            for &dst in &rule.dst {
                let entries = seen.entry((rule.deny, src, dst)).or_default();
                for &prt in &rule.prt {
                    for &(other_prt, other_idx) in entries.iter() {
                        let other = &rules[other_idx];
                        if other.service == rule.service || other.log != rule.log {
                            continue;
                        }
                        if other_prt == prt {
                            found.insert(Redundancy::Duplicate(
                                other.service.clone(),
                                rule.service.clone(),
                            ));
                        } else if other_prt.covers(&prt) {
                            found.insert(Redundancy::Redundant(
                                rule.service.clone(),
                                other.service.clone(),
                            ));
                        } else if prt.covers(&other_prt) {
                            found.insert(Redundancy::Redundant(
                                other.service.clone(),
                                rule.service.clone(),
                            ));
                        }
                    }
                    entries.push((prt, idx));
                }
            }
        }
    }
    for item in found {
        match item {
            Redundancy::Duplicate(a, b) => diag.warning(format!("Duplicate rules in {b} and {a}")),
            Redundancy::Redundant(a, b) => {
                diag.warning(format!("Redundant rules in {a} compared to {b}"))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{normalize_services, Rule};
    use crate::config::Config;
    use crate::diag::{CaptureWriter, Diagnostics};
    use crate::input::parse_json;
    use crate::model::{Object, Topology};
    use crate::protocol::{parse_protocol, ProtocolTable};
    use crate::setup::build_topology;
    use crate::split::prepare_routers;
    use crate::zone::set_zones;

    fn normalize(json: &str) -> (Topology, Vec<Rule>, String) {
        let tree = parse_json(json).expect("parse");
        let out = CaptureWriter::new();
        let config = Config::default();
        let diag = Diagnostics::with_writer(&config, out.clone());
        let mut topo = build_topology(&tree, &config, &diag);
        prepare_routers(&mut topo, &diag);
        set_zones(&mut topo);
        let prt = ProtocolTable::new(&tree, &diag);
        let rules = normalize_services(&topo, &tree, &prt, &diag);
        diag.finish();
        (topo, rules, out.contents())
    }

    const NETS: &str = r#"
      "networks": [
        { "name": "network:a", "ip": "10.1.1.0/24",
          "hosts": [{ "name": "host:h1", "ip": "10.1.1.10" }] },
        { "name": "network:b", "ip": "10.1.2.0/24" },
        { "name": "network:v6", "ip": "2001:db8::/64" },
        { "name": "network:off", "ip": "10.1.9.0/24", "disabled": true }],
      "routers": [
        { "name": "router:r", "managed": true, "model": "IOS", "interfaces": [
          { "network": "network:a", "ip": "10.1.1.1", "hardware": "e0" },
          { "network": "network:b", "ip": "10.1.2.1", "hardware": "e1" },
          { "network": "network:v6", "ip": "2001:db8::1", "hardware": "e2" }] }]"#;

    #[test]
    fn expands_user_groups_and_all_interfaces() {
        let json = format!(
            r#"{{ {NETS},
              "groups": [{{ "name": "group:g", "elements": ["host:h1", "network:off"] }}],
              "services": [{{ "name": "service:s", "user": ["group:g"],
                "rules": [{{ "src": ["user"], "dst": ["interface:r.a", "network:b"],
                            "prt": ["tcp 22"] }}] }}]
            }}"#
        );
        let (topo, rules, out) = normalize(&json);
        assert_eq!(rules.len(), 1, "{out}");
        assert_eq!(rules[0].src, vec![Object::Host(topo.host_names["host:h1"])]);
        assert_eq!(rules[0].dst.len(), 2);
        assert_eq!(rules[0].prt, vec![parse_protocol("tcp 22").expect("prt")]);
        assert!(!out.contains("Error"), "{out}");
    }

    #[test]
    fn splits_rule_per_address_family() {
        let json = format!(
            r#"{{ {NETS},
              "services": [
                {{ "name": "service:dual", "rules": [
                  {{ "src": ["network:a", "network:v6"], "dst": ["interface:r.[all]"], "prt": ["icmp"] }}] }},
                {{ "name": "service:bad", "rules": [
                  {{ "src": ["network:v6"], "dst": ["network:b"], "prt": ["ip"] }}] }}]
            }}"#
        );
        let (_, rules, out) = normalize(&json);
        assert_eq!(rules.len(), 2);
        assert!(rules.iter().all(|r| r.service == "service:dual"));
        assert_eq!(rules[0].dst.len(), 2);
        assert_eq!(rules[1].dst.len(), 1);
        assert!(out.contains(
            "Error: Must not use objects of different IP versions in src and dst of rule 1 of service:bad"
        ));
    }

    #[test]
    fn reports_unknown_references_and_redundancy() {
        let json = format!(
            r#"{{ {NETS},
              "services": [
                {{ "name": "service:s1", "rules": [
                  {{ "src": ["network:a", "network:a"], "dst": ["network:b"], "prt": ["tcp"] }}] }},
                {{ "name": "service:s2", "rules": [
                  {{ "src": ["network:a"], "dst": ["network:b", "network:x"], "prt": ["tcp 80"] }}] }}]
            }}"#
        );
        let (_, _, out) = normalize(&json);
        assert!(out.contains("Warning: Duplicate elements in src of rule 1 of service:s1:\n - network:a"));
        assert!(out.contains("Error: Can't resolve reference to network:x in dst of rule 1 of service:s2"));
        assert!(out.contains("Warning: Redundant rules in service:s2 compared to service:s1"));
    }
}
