use colored::Colorize;
use policy_core::model::IntfId;
use policy_core::{RuleSet, Summary, Topology, Walk};

/// Render the outcome of a run for terminal output.
pub fn render_summary(summary: &Summary, acls: Option<&RuleSet>) -> String {
    let mut out = Vec::new();
    if let Some(acls) = acls {
        let entries: usize = acls
            .devices
            .values()
            .flat_map(|d| d.acls.values())
            .map(Vec::len)
            .sum();
        for (device, code) in &acls.devices {
            let count: usize = code.acls.values().map(Vec::len).sum();
            out.push(format!("- {device}: acls={} entries={count}", code.acls.len()));
        }
        out.push(
            format!(
                "devices={} entries={entries} secondary={} duplicates={}",
                acls.devices.len(),
                acls.secondary,
                acls.duplicates
            )
            .cyan()
            .to_string(),
        );
    }
    let line = format!("errors={} warnings={}", summary.errors, summary.warnings);
    out.push(if summary.errors > 0 {
        line.red().to_string()
    } else if summary.warnings > 0 {
        line.yellow().to_string()
    } else {
        line.green().to_string()
    });
    out.join("\n")
}

/// Render the router hops of a path, one line per hop.
pub fn render_trace(topo: &Topology, walk: &Walk) -> String {
    if walk.hops.is_empty() {
        return "no router passed".yellow().to_string();
    }
    let name = |intf: Option<IntfId>| match intf {
        Some(id) => topo.intf(id).name.clone(),
        None => "(device)".to_string(),
    };
    let mut out = Vec::new();
    for hop in &walk.hops {
        let router = topo.router(hop.router);
        let marker = if router.filters() { "filter" } else { "pass" };
        out.push(format!(
            "{} {}: {} -> {}",
            marker.cyan(),
            router.name,
            name(hop.in_intf),
            name(hop.out_intf)
        ));
    }
    out.join("\n")
}

#[cfg(test)]
mod tests {
    use super::render_summary;
    use policy_core::Summary;

    #[test]
    fn summary_without_acls_shows_counts() {
        colored::control::set_override(false);
        let text = render_summary(
            &Summary {
                errors: 2,
                warnings: 1,
                aborted: true,
            },
            None,
        );
        assert_eq!(text, "errors=2 warnings=1");
    }
}
