//! Finding and running the real tool. The one subtlety is recursion: when
//! the shim is installed as a `gcc` symlink early on PATH, resolving "gcc"
//! must skip the shim's own directory or we end up invoking ourselves.

use crate::prelude::*;
use std::ffi::OsString;
use std::fs;
use std::io;
use std::process::{Command, ExitStatus, Output, Stdio};

/// Resolve `name` to the real tool. A name containing a separator is used
/// as-is; a bare name is searched on PATH, skipping `exclude` (the shim's
/// directory). The result is fully resolved so that a `cc -> gcc` symlink
/// hashes the actual binary.
pub fn find_executable(name: &str, exclude: Option<&Path>) -> Result<PathBuf, WrapperError> {
    let as_path = Path::new(name);
    if as_path.components().count() > 1 {
        return fs::canonicalize(as_path).map_err(|e| WrapperError::io("resolve", as_path, e));
    }

    let path_var = std::env::var_os("PATH").unwrap_or_default();
    for dir in std::env::split_paths(&path_var) {
        if dir.as_os_str().is_empty() || !crate::fsutil::dir_exists(&dir) {
            continue;
        }
        if let Some(excluded) = exclude {
            if same_dir(&dir, excluded) {
                continue;
            }
        }
        let candidate = dir.join(name);
        if is_executable(&candidate) {
            return fs::canonicalize(&candidate)
                .map_err(|e| WrapperError::io("resolve", &candidate, e));
        }
        #[cfg(windows)]
        {
            let with_exe = dir.join(format!("{name}.exe"));
            if is_executable(&with_exe) {
                return fs::canonicalize(&with_exe)
                    .map_err(|e| WrapperError::io("resolve", &with_exe, e));
            }
        }
    }
    Err(WrapperError::io(
        "search",
        name,
        io::Error::new(io::ErrorKind::NotFound, "not found on PATH"),
    ))
}

fn same_dir(a: &Path, b: &Path) -> bool {
    match (fs::canonicalize(a), fs::canonicalize(b)) {
        (Ok(a), Ok(b)) => a == b,
        _ => a == b,
    }
}

#[cfg(unix)]
fn is_executable(path: &Path) -> bool {
    use std::os::unix::fs::PermissionsExt;
    fs::metadata(path)
        .map(|m| m.is_file() && m.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}

#[cfg(windows)]
fn is_executable(path: &Path) -> bool {
    fs::metadata(path).map(|m| m.is_file()).unwrap_or(false)
}

/// A tool killed by a signal has no exit code; 1 is the closest thing the
/// build system can act on.
pub fn exit_code_of(status: ExitStatus) -> i32 {
    status.code().unwrap_or(1)
}

/// Run the tool exactly as asked, with our stdio: the non-cacheable path,
/// byte-identical to not having a shim at all.
pub fn run_transparent(exe: &Path, args: &[OsString]) -> Result<i32, WrapperError> {
    let status = Command::new(exe)
        .args(args)
        .status()
        .map_err(|e| WrapperError::io("exec", exe, e))?;
    Ok(exit_code_of(status))
}

/// Run the tool with stdout/stderr captured so a successful compile can be
/// recorded before the streams are forwarded.
pub fn run_captured(exe: &Path, args: &[String]) -> Result<Output, WrapperError> {
    Command::new(exe)
        .args(args)
        .stdin(Stdio::inherit())
        .output()
        .map_err(|e| WrapperError::io("exec", exe, e))
}

#[cfg(test)]
mod test {
    use super::*;
    use indoc::indoc;

    #[cfg(unix)]
    #[test]
    fn test_find_skips_the_shim_directory() -> Result<()> {
        let tmp = tempfile::tempdir()?;
        let shim_dir = tmp.path().join("shims");
        let real_dir = tmp.path().join("real");
        fs::create_dir_all(&shim_dir)?;
        fs::create_dir_all(&real_dir)?;
        crate::test_util::stub_tool(&shim_dir, "gcc", "exit 42")?;
        let real = crate::test_util::stub_tool(&real_dir, "gcc", "exit 0")?;

        let path_var = std::env::join_paths([&shim_dir, &real_dir])?;
        let saved = std::env::var_os("PATH");
        std::env::set_var("PATH", &path_var);
        let found = find_executable("gcc", Some(&shim_dir));
        match saved {
            Some(saved) => std::env::set_var("PATH", saved),
            None => std::env::remove_var("PATH"),
        }

        assert_eq!(found?, real.canonicalize()?);
        Ok(())
    }

    #[cfg(unix)]
    #[test]
    fn test_absolute_name_resolves_symlinks() -> Result<()> {
        let tmp = tempfile::tempdir()?;
        let real = crate::test_util::stub_tool(tmp.path(), "gcc", "exit 0")?;
        let link = tmp.path().join("cc");
        std::os::unix::fs::symlink(&real, &link)?;

        let found = find_executable(link.to_str().unwrap(), None)?;
        assert_eq!(found, real.canonicalize()?);
        Ok(())
    }

    #[test]
    fn test_missing_tool() {
        let result = find_executable("definitely-not-a-real-compiler-9000", None);
        assert!(matches!(result, Err(WrapperError::Io { .. })));
    }

    #[cfg(unix)]
    #[test]
    fn test_captured_run() -> Result<()> {
        let tmp = tempfile::tempdir()?;
        let exe = crate::test_util::stub_tool(
            tmp.path(),
            "tool",
            indoc! {r#"
                echo "to stdout"
                echo "to stderr" >&2
                exit 3
            "#},
        )?;
        let output = run_captured(&exe, &[])?;
        assert_eq!(output.stdout, b"to stdout\n");
        assert_eq!(output.stderr, b"to stderr\n");
        assert_eq!(exit_code_of(output.status), 3);
        Ok(())
    }
}
