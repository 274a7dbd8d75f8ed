#![cfg(unix)]

use crate::prelude::*;
use std::fs;

/// Drop an executable shell script into `dir` and hand back its path.
/// Stands in for the real compiler in tests.
pub fn stub_tool(dir: &Path, name: &str, body: &str) -> Result<PathBuf> {
    use std::os::unix::fs::PermissionsExt;
    let path = dir.join(name);
    fs::write(&path, format!("#!/bin/sh\n{body}\n"))?;
    let mut perms = fs::metadata(&path)?.permissions();
    perms.set_mode(0o755);
    fs::set_permissions(&path, perms)?;
    Ok(path)
}
