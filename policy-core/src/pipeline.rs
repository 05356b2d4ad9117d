//! The sequence of compiler passes.
//!
//! Passes run strictly one after another. After each group of passes the
//! diagnostics channel is drained and checked, so later passes only see a
//! topology without reported errors.

use tracing::debug;

use crate::acl::{assemble_acls, RuleSet};
use crate::config::Config;
use crate::diag::{CompileError, Diagnostics};
use crate::input::ObjectTree;
use crate::model::Topology;
use crate::nat::{distribute_nat, set_nat_domains};
use crate::path::PathEngine;
use crate::protocol::ProtocolTable;
use crate::service::{normalize_services, Rule};
use crate::setup::build_topology;
use crate::split::prepare_routers;
use crate::zone::{inherit_area_nat, link_aggregates, set_areas, set_clusters, set_subnet_chain, set_zones};

/// Everything computed by a successful run.
pub struct Compilation {
    pub topology: Topology,
    pub paths: PathEngine,
    pub rules: Vec<Rule>,
    pub acls: RuleSet,
}

/// Build topology, zones, NAT domains and the path engine.
pub fn prepare_topology(
    tree: &ObjectTree,
    config: &Config,
    diag: &Diagnostics,
) -> Result<(Topology, PathEngine), CompileError> {
    diag.progress("Preparing topology");
    let mut topo = build_topology(tree, config, diag);
    diag.stop_on_err()?;

    prepare_routers(&mut topo, diag);
    set_zones(&mut topo);
    set_subnet_chain(&mut topo, diag);
    set_clusters(&mut topo);
    set_areas(&mut topo, diag);
    inherit_area_nat(&mut topo, diag);
    link_aggregates(&mut topo, tree, config.ip_mode, diag);
    debug!(zones = topo.zones.len(), areas = topo.areas.len(), "zones ready");
    diag.stop_on_err()?;

    diag.progress("Distributing NAT");
    set_nat_domains(&mut topo, diag)?;
    distribute_nat(&mut topo, diag);
    diag.stop_on_err()?;

    diag.progress("Finding loops");
    let paths = PathEngine::new(&topo, diag);
    diag.stop_on_err()?;
    Ok((topo, paths))
}

/// Run all passes on `tree`.
pub fn compile(tree: &ObjectTree, config: &Config, diag: &Diagnostics) -> Result<Compilation, CompileError> {
    let (topology, mut paths) = prepare_topology(tree, config, diag)?;

    diag.progress("Normalizing services");
    let protocols = ProtocolTable::new(tree, diag);
    let rules = normalize_services(&topology, tree, &protocols, diag);
    diag.stop_on_err()?;

    diag.progress("Assembling access lists");
    let acls = assemble_acls(&topology, &mut paths, &rules, diag);
    diag.stop_on_err()?;
    diag.info(format!(
        "Generated access lists for {} devices, {} secondary entries removed",
        acls.devices.len(),
        acls.secondary
    ));
    Ok(Compilation {
        topology,
        paths,
        rules,
        acls,
    })
}

#[cfg(test)]
mod tests {
    use super::compile;
    use crate::config::Config;
    use crate::diag::{CaptureWriter, CompileError, Diagnostics};
    use crate::input::parse_json;

    #[test]
    fn stops_after_setup_errors() {
        let tree = parse_json(
            r#"{ "networks": [{ "name": "network:a", "ip": "10.1.1.0/33" }],
                 "services": [{ "name": "service:s", "rules": [
                   { "src": ["network:a"], "dst": ["network:a"], "prt": ["tcp"] }] }] }"#,
        )
        .expect("parse");
        let out = CaptureWriter::new();
        let diag = Diagnostics::with_writer(&Config::default(), out.clone());
        let result = compile(&tree, &Config::default(), &diag);
        assert!(matches!(result, Err(CompileError::Errors(1))));
        diag.finish();
        let text = out.contents();
        assert!(text.contains("Error: "), "{text}");
        assert!(text.contains("Aborted with 1 error(s)"), "{text}");
    }

    #[test]
    fn clean_run_reports_nothing() {
        let tree = parse_json(
            r#"{ "networks": [{ "name": "network:a", "ip": "10.1.1.0/24" },
                              { "name": "network:b", "ip": "10.1.2.0/24" }],
                 "routers": [{ "name": "router:r", "managed": true, "model": "IOS", "interfaces": [
                   { "network": "network:a", "ip": "10.1.1.1", "hardware": "e0" },
                   { "network": "network:b", "ip": "10.1.2.1", "hardware": "e1" }] }],
                 "services": [{ "name": "service:s", "rules": [
                   { "src": ["network:a"], "dst": ["network:b"], "prt": ["tcp 80"] }] }] }"#,
        )
        .expect("parse");
        let out = CaptureWriter::new();
        let diag = Diagnostics::with_writer(&Config::default(), out.clone());
        let compiled = compile(&tree, &Config::default(), &diag).expect("compile");
        let summary = diag.finish();
        assert_eq!(summary.errors, 0);
        assert_eq!(out.contents(), "");
        assert_eq!(compiled.acls.acl("router:r", "e1_out").len(), 1);
        assert!(compiled.acls.acl("router:r", "e0_out").is_empty());
    }
}
