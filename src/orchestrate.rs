//! The pipeline that binds everything together: pick a wrapper, resolve
//! the command line, fold the fingerprint, try the store, and either
//! replay a hit or run the real tool and record the result.
//!
//! The propagation policy is one-directional: any internal error degrades
//! to transparent execution. The shim must never fail an invocation that
//! would have succeeded without it.

use crate::args::ArgList;
use crate::config::Config;
use crate::exec;
use crate::fingerprint::{self, Fingerprint, FingerprintHasher};
use crate::fsutil;
use crate::prelude::*;
use crate::store::{ArtifactSet, ArtifactStore, CachedEntry, LocalStore};
use crate::wrapper::{self, BuildFiles, Capability, ProgramWrapper};
use std::ffi::OsString;
use std::fs::{self, File};
use std::io::Write;

pub fn run(config: &Config, tool: &str, raw_args: &[OsString]) -> Result<i32> {
    let shim_dir = std::env::current_exe()
        .ok()
        .and_then(|p| p.parent().map(Path::to_path_buf));
    let exe = match exec::find_executable(tool, shim_dir.as_deref()) {
        Ok(exe) => exe,
        Err(err) => {
            debug!("cannot resolve {tool}: {err}");
            eprintln!("{}: {tool}: command not found", env!("CARGO_PKG_NAME"));
            return Ok(127);
        }
    };

    if config.disable {
        trace!("cache disabled, running {} transparently", exe.display());
        return Ok(exec::run_transparent(&exe, raw_args)?);
    }

    let cacheable = ArgList::from_raw(raw_args).ok().and_then(|args| {
        let env: HashMap<String, String> = std::env::vars_os()
            .filter_map(|(k, v)| Some((k.into_string().ok()?, v.into_string().ok()?)))
            .collect();
        let wrapper = wrapper::select(&exe, &args, &env, !config.direct_mode)?;
        Some((args, wrapper))
    });
    let (args, mut wrapper) = match cacheable {
        Some(claimed) => claimed,
        None => {
            trace!("no wrapper claims {}, running transparently", exe.display());
            return Ok(exec::run_transparent(&exe, raw_args)?);
        }
    };

    match run_cached(config, &exe, &args, wrapper.as_mut()) {
        Ok(code) => Ok(code),
        Err(err) => {
            debug!("falling back to transparent execution: {err:#}");
            Ok(exec::run_transparent(&exe, raw_args)?)
        }
    }
}

/// The cacheable path. May only fail BEFORE the real tool has run; once it
/// has, every outcome (including a failed insert) must turn into its exit
/// code, or the fallback above would run the tool twice.
fn run_cached(
    config: &Config,
    exe: &Path,
    args: &ArgList,
    wrapper: &mut dyn ProgramWrapper,
) -> Result<i32> {
    wrapper.resolve_args()?;
    let fp = compute_fingerprint(config, wrapper)?;
    let outputs = wrapper.build_files()?;
    let store = LocalStore::new(&config.cache_dir, config.max_size)?;

    if let Some(entry) = store.lookup(&fp)? {
        let link = config.hard_links
            && wrapper.capabilities().contains(&Capability::HardLinks);
        match materialize(&entry, &outputs, link) {
            Ok(()) => {
                trace!("cache hit for {fp}");
                replay_streams(&entry.stdout, &entry.stderr);
                let _ = store.record_hit();
                return Ok(entry.exit_code);
            }
            Err(err) => {
                // entry may have been evicted under us; treat as a miss
                debug!("found {fp} but could not materialize it: {err}");
            }
        }
    }

    let output = exec::run_captured(exe, args.as_slice())?;
    replay_streams(&output.stdout, &output.stderr);
    let code = exec::exit_code_of(output.status);
    let _ = store.record_miss();

    if output.status.success() {
        match collect_artifacts(&outputs) {
            Some(files) => {
                let set = ArtifactSet {
                    exit_code: code,
                    stdout: output.stdout,
                    stderr: output.stderr,
                    files,
                };
                match store.insert(&fp, &set) {
                    Ok(()) => trace!("cached {fp}"),
                    Err(err) => debug!("failed to cache {fp}: {err:#}"),
                }
            }
            None => debug!("not caching {fp}: declared outputs missing"),
        }
    }
    Ok(code)
}

/// Fold the invocation into its fingerprint, in the fixed order: program
/// id, compatible-mode tag, capability tags, relevant arguments, relevant
/// environment, explicit input hashes, implicit input hashes, and (in
/// preprocess mode) the preprocessed source hash.
fn compute_fingerprint(
    config: &Config,
    wrapper: &mut dyn ProgramWrapper,
) -> Result<Fingerprint, WrapperError> {
    let capabilities = wrapper.capabilities();
    let program_id = wrapper.program_id()?;
    let relevant_args = wrapper.relevant_arguments();
    let relevant_env = wrapper.relevant_env_vars();
    let inputs = wrapper.input_files();
    let preprocessed = if config.direct_mode {
        None
    } else {
        Some(wrapper.preprocess_source()?)
    };
    let implicit = wrapper.implicit_input_files();

    let mut hasher = FingerprintHasher::new();
    hasher.segment("program", &program_id);
    hasher.segment("compat", wrapper.compat_tag().as_bytes());
    for capability in &capabilities {
        hasher.segment("capability", capability.tag().as_bytes());
    }
    for arg in &relevant_args {
        hasher.segment("arg", arg.as_bytes());
    }
    for (key, value) in &relevant_env {
        hasher.segment("env", format!("{key}={value}").as_bytes());
    }
    for input in &inputs {
        hasher.segment("input", &fingerprint::file_digest(Path::new(input))?);
    }
    for input in &implicit {
        hasher.segment("implicit", &fingerprint::file_digest(Path::new(input))?);
    }
    if let Some(source) = &preprocessed {
        hasher.segment("preprocessed", &fingerprint::bytes_digest(source));
    }
    Ok(hasher.finish())
}

fn replay_streams(stdout: &[u8], stderr: &[u8]) {
    // the tool already ran (or the entry is committed); a broken pipe here
    // must not trigger a second execution
    let _ = std::io::stdout().write_all(stdout);
    let _ = std::io::stdout().flush();
    let _ = std::io::stderr().write_all(stderr);
}

/// Place each stored artifact at its build path: hard-link when allowed
/// (falling back to copy across filesystems), otherwise copy via a temp
/// file and rename so readers never see a half-written object.
fn materialize(
    entry: &CachedEntry,
    outputs: &BuildFiles,
    hard_links: bool,
) -> Result<(), WrapperError> {
    for (role, stored) in &entry.files {
        let dest = match outputs.get(role) {
            Some(dest) => dest,
            None => continue,
        };
        if hard_links {
            if fsutil::file_exists(dest) {
                fs::remove_file(dest).map_err(|e| WrapperError::io("unlink", dest, e))?;
            }
            if fs::hard_link(stored, dest).is_ok() {
                continue;
            }
        }
        copy_into_place(stored, dest)?;
    }
    Ok(())
}

fn copy_into_place(source: &Path, dest: &Path) -> Result<(), WrapperError> {
    let dir = match dest.parent() {
        Some(p) if !p.as_os_str().is_empty() => p,
        _ => Path::new("."),
    };
    let mut tmp =
        tempfile::NamedTempFile::new_in(dir).map_err(|e| WrapperError::io("mkstemp", dir, e))?;
    let mut src = File::open(source).map_err(|e| WrapperError::io("open", source, e))?;
    std::io::copy(&mut src, &mut tmp).map_err(|e| WrapperError::io("copy", dest, e))?;
    tmp.persist(dest)
        .map_err(|e| WrapperError::io("rename", dest, e.error))?;
    Ok(())
}

fn collect_artifacts(outputs: &BuildFiles) -> Option<Vec<(crate::wrapper::OutputRole, PathBuf)>> {
    let mut files = Vec::with_capacity(outputs.len());
    for (role, path) in outputs {
        if !fsutil::file_exists(path) {
            return None;
        }
        files.push((*role, path.clone()));
    }
    Some(files)
}
