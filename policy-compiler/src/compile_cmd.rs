use anyhow::{bail, Context, Result};
use policy_core::{compile, parse_file, write_code, Diagnostics, Topology};
use tracing::info;

use crate::cli::CompileArgs;
use crate::path_guard::ensure_outputs_not_input;
use crate::report::render_summary;

pub fn run_compile(args: CompileArgs) -> Result<()> {
    let input = &args.common.input;
    let config = args.common.config()?;
    let tree = parse_file(input).with_context(|| format!("failed to parse {}", input.display()))?;
    if let Some(out) = &args.out {
        ensure_outputs_not_input(out, Vec::<&str>::new(), input)?;
    }

    let diag = Diagnostics::new(&config);
    let result = compile(&tree, &config, &diag);
    let summary = diag.finish();

    let compiled = match result {
        Ok(compiled) => compiled,
        Err(err) => {
            if !args.common.quiet {
                println!("{}", render_summary(&summary, None));
            }
            bail!("compilation of {} failed: {err}", input.display());
        }
    };

    if let Some(out) = &args.out {
        let files = compiled.acls.devices.keys().map(|d| Topology::short_name(d));
        ensure_outputs_not_input(out, files, input)?;
        let count = write_code(&compiled.acls, out)
            .with_context(|| format!("failed to write code to {}", out.display()))?;
        info!(count, out = %out.display(), "device code written");
    }
    if !args.common.quiet {
        println!("{}", render_summary(&summary, Some(&compiled.acls)));
    }
    Ok(())
}
