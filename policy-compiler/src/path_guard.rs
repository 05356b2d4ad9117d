use std::path::{Component, Path, PathBuf};

use anyhow::{bail, Context, Result};

/// Refuse to write `files` into `dir` if that would replace the policy file.
///
/// `files` are paths relative to `dir`, e.g. device names or `owner/x/nat_set`.
pub fn ensure_outputs_not_input<'a>(
    dir: &Path,
    files: impl IntoIterator<Item = &'a str>,
    input: &Path,
) -> Result<()> {
    let policy = input
        .canonicalize()
        .with_context(|| format!("failed to resolve policy path {}", input.display()))?;
    let out = resolve(dir).with_context(|| format!("failed to resolve output path {}", dir.display()))?;
    if out == policy {
        bail!(
            "refusing to overwrite policy file: output {} matches input {}",
            dir.display(),
            input.display()
        );
    }
    for file in files {
        if out.join(file) == policy {
            bail!(
                "refusing to overwrite policy file: {} in {} matches input {}",
                file,
                dir.display(),
                input.display()
            );
        }
    }
    Ok(())
}

/// Absolute form of a path that may not exist yet.
///
/// `.` and `..` are folded lexically, then the longest existing prefix is
/// canonicalized so symlinked directories compare equal.
fn resolve(path: &Path) -> Result<PathBuf> {
    let joined = if path.is_absolute() {
        path.to_path_buf()
    } else {
        std::env::current_dir().context("current_dir")?.join(path)
    };
    let mut lexical = PathBuf::new();
    for component in joined.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                lexical.pop();
            }
            other => lexical.push(other),
        }
    }

    let mut missing = Vec::new();
    let mut existing = lexical.as_path();
    while !existing.exists() {
        let (Some(parent), Some(name)) = (existing.parent(), existing.file_name()) else {
            break;
        };
        missing.push(name.to_os_string());
        existing = parent;
    }
    let mut resolved = existing
        .canonicalize()
        .with_context(|| format!("canonicalize {}", existing.display()))?;
    resolved.extend(missing.iter().rev());
    Ok(resolved)
}

#[cfg(test)]
mod tests {
    use super::ensure_outputs_not_input;

    #[test]
    fn rejects_policy_file_as_output_directory() {
        let dir = tempfile::tempdir().expect("tempdir");
        let input = dir.path().join("policy.json");
        std::fs::write(&input, "{}").expect("write");
        assert!(ensure_outputs_not_input(&input, Vec::<&str>::new(), &input).is_err());
        assert!(ensure_outputs_not_input(&dir.path().join("out"), ["r1"], &input).is_ok());
    }

    #[test]
    fn rejects_output_file_replacing_policy() {
        let dir = tempfile::tempdir().expect("tempdir");
        let input = dir.path().join("r1");
        std::fs::write(&input, "{}").expect("write");
        let err = ensure_outputs_not_input(dir.path(), ["r0", "r1"], &input).expect_err("must refuse");
        assert!(err.to_string().contains("r1 in"), "{err}");

        let detour = dir.path().join("new").join("..");
        assert!(ensure_outputs_not_input(&detour, ["r1"], &input).is_err());
        assert!(ensure_outputs_not_input(dir.path(), ["r2"], &input).is_ok());
    }
}
