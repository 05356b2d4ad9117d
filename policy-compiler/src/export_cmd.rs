use anyhow::{bail, Context, Result};
use policy_core::{nat_export, parse_file, prepare_topology, write_nat_export, Diagnostics, Topology};

use crate::cli::ExportArgs;
use crate::path_guard::ensure_outputs_not_input;
use crate::report::render_summary;

pub fn run_export(args: ExportArgs) -> Result<()> {
    let input = &args.common.input;
    let config = args.common.config()?;
    let tree = parse_file(input).with_context(|| format!("failed to parse {}", input.display()))?;
    ensure_outputs_not_input(&args.out, Vec::<&str>::new(), input)?;

    let diag = Diagnostics::new(&config);
    let export = prepare_topology(&tree, &config, &diag).map(|(topo, _)| nat_export(&topo, &diag));
    let summary = diag.finish();
    let export = match export {
        Ok(export) => export,
        Err(err) => {
            if !args.common.quiet {
                println!("{}", render_summary(&summary, None));
            }
            bail!("export of {} failed: {err}", input.display());
        }
    };

    let files: Vec<String> = export
        .owners
        .keys()
        .map(|owner| format!("owner/{}/nat_set", Topology::short_name(owner)))
        .chain(["objects".to_string()])
        .collect();
    ensure_outputs_not_input(&args.out, files.iter().map(String::as_str), input)?;
    write_nat_export(&export, &args.out)
        .with_context(|| format!("failed to write export to {}", args.out.display()))?;
    if !args.common.quiet {
        println!(
            "owners={} objects={}",
            export.owners.len(),
            export.objects.len()
        );
        println!("{}", render_summary(&summary, None));
    }
    Ok(())
}
