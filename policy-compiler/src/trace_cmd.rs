use anyhow::{bail, Context, Result};
use policy_core::{parse_file, prepare_topology, Diagnostics, PathEngine, PathNode, Topology};

use crate::cli::TraceArgs;
use crate::report::render_trace;

fn resolve(topo: &Topology, name: &str) -> Result<PathNode> {
    let Some(obj) = topo.object_by_name(name) else {
        bail!("unknown object {name}");
    };
    match PathEngine::node_of(topo, obj) {
        Some(node) => Ok(node),
        None => bail!("{name} is not part of any zone"),
    }
}

pub fn run_trace(args: TraceArgs) -> Result<()> {
    let input = &args.common.input;
    let config = args.common.config()?;
    let tree = parse_file(input).with_context(|| format!("failed to parse {}", input.display()))?;

    let diag = Diagnostics::new(&config);
    let prepared = prepare_topology(&tree, &config, &diag);
    diag.finish();
    let (topo, mut paths) = match prepared {
        Ok(prepared) => prepared,
        Err(err) => bail!("failed to prepare {}: {err}", input.display()),
    };

    let from = resolve(&topo, &args.from)?;
    let to = resolve(&topo, &args.to)?;
    let walk = paths
        .walk(&topo, from, to)
        .with_context(|| format!("no path from {} to {}", args.from, args.to))?;
    println!("{}", render_trace(&topo, &walk));
    Ok(())
}
