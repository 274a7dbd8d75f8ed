//! The GCC/Clang-family adapter: teaches the core how to read a
//! gcc-compatible command line, which arguments matter, where outputs
//! land, and how to drive the preprocessor for hashing.

use crate::args::ArgList;
use crate::fingerprint;
use crate::fsutil::{self, TmpEntry};
use crate::paths;
use crate::prelude::*;
use crate::wrapper::{BuildFiles, Capability, OutputRole, ProgramWrapper};
use indexmap::IndexSet;
use ring::digest;
use std::fs;
use std::process::{Command, Stdio};
use std::sync::{Arc, Mutex};

/// How closely the tool tracks the two big dialects. Affects which flags
/// are considered value-carrying, which diagnostics are irrelevant, and
/// whether `-D` is absorbed by the preprocess phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompatMode {
    Unspecified,
    GccLike,
    ClangLike,
}

impl CompatMode {
    pub fn tag(self) -> &'static str {
        match self {
            CompatMode::Unspecified => "unspecified",
            CompatMode::GccLike => "gcc-like",
            CompatMode::ClangLike => "clang-like",
        }
    }
}

/// Flags whose value is the following token (after normalization, also the
/// canonical form for the fusable subset).
const TWO_TOKEN_FLAGS: &[&str] = &[
    "-o", "-x", "-D", "-U", "-I", "-L", "-isystem", "-iquote", "-idirafter", "-iprefix",
    "-include", "-imacros", "-MF", "-MT", "-MQ", "-Xpreprocessor", "-Xassembler",
    "-Xlinker", "-Xclang", "-arch", "-target", "--param", "-aux-info", "-T", "-u", "-z",
];

/// The subset that gcc also accepts fused (`-ofoo`, `-DFOO=1`). Resolution
/// splits these so later passes see a single shape.
const FUSABLE_FLAGS: &[&str] = &["-o", "-D", "-U", "-I", "-L", "-x", "-MF", "-MT", "-MQ"];

/// Extensions gcc treats as compilable sources.
const SOURCE_EXTENSIONS: &[&str] = &[
    ".c", ".i", ".ii", ".m", ".mi", ".mm", ".mii", ".M", ".C", ".cc", ".cp", ".cxx",
    ".cpp", ".CPP", ".c++", ".s", ".S", ".sx",
];

/// Environment variables the GCC driver reads that can change its output.
const RELEVANT_ENV_VARS: &[&str] = &[
    "LANG",
    "LC_ALL",
    "LC_CTYPE",
    "LC_MESSAGES",
    "SOURCE_DATE_EPOCH",
    "CPATH",
    "C_INCLUDE_PATH",
    "CPLUS_INCLUDE_PATH",
    "OBJC_INCLUDE_PATH",
    "DEPENDENCIES_OUTPUT",
    "SUNPRO_DEPENDENCIES",
    "GCC_EXEC_PREFIX",
    "COMPILER_PATH",
    "LIBRARY_PATH",
];

static CLAIM_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^(?:[A-Za-z0-9_.+]+-)*(?:cc|c\+\+|gcc|g\+\+|clang|clang\+\+)(?:-[0-9.]+)?$")
        .unwrap()
});

struct ProgramId {
    digest: [u8; 32],
    compat: CompatMode,
}

/// Hashing the tool binary and asking it for --version is not free, and a
/// build invokes the same few compilers thousands of times.
static PROGRAM_IDS: Lazy<Mutex<HashMap<PathBuf, Arc<ProgramId>>>> =
    Lazy::new(|| Mutex::new(HashMap::new()));

fn program_id_for(exe: &Path) -> Result<Arc<ProgramId>, WrapperError> {
    if let Some(id) = PROGRAM_IDS.lock().unwrap().get(exe) {
        return Ok(id.clone());
    }

    let exe_digest = fingerprint::file_digest(exe)?;
    let output = Command::new(exe)
        .arg("--version")
        .stdin(Stdio::null())
        .output()
        .map_err(|e| WrapperError::io("exec", exe, e))?;
    let stdout = String::from_utf8_lossy(&output.stdout);
    let banner = stdout.lines().next().unwrap_or("").to_string();

    let compat = classify_banner(&banner)
        .or_else(|| classify_base_name(&base_name_of(exe)))
        .unwrap_or(CompatMode::Unspecified);

    let mut ctx = digest::Context::new(&digest::SHA256);
    ctx.update(&exe_digest);
    ctx.update(banner.as_bytes());
    // unwrap rationale: SHA256 output is always 32 bytes
    let id = Arc::new(ProgramId {
        digest: ctx.finish().as_ref().try_into().unwrap(),
        compat,
    });
    PROGRAM_IDS
        .lock()
        .unwrap()
        .insert(exe.to_path_buf(), id.clone());
    Ok(id)
}

fn classify_banner(banner: &str) -> Option<CompatMode> {
    let lower = banner.to_ascii_lowercase();
    if lower.contains("clang") {
        Some(CompatMode::ClangLike)
    } else if lower.contains("gcc") || lower.contains("free software foundation") {
        Some(CompatMode::GccLike)
    } else {
        None
    }
}

fn classify_base_name(name: &str) -> Option<CompatMode> {
    if name.contains("clang") {
        Some(CompatMode::ClangLike)
    } else if name.contains("gcc") || name.contains("g++") {
        Some(CompatMode::GccLike)
    } else {
        None
    }
}

fn base_name_of(exe: &Path) -> String {
    let name = exe
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    match name.strip_suffix(".exe") {
        Some(stripped) => stripped.to_string(),
        None => name,
    }
}

fn is_source_file(token: &str) -> bool {
    !token.starts_with('-') && SOURCE_EXTENSIONS.contains(&paths::extension(token))
}

fn stderr_tail(stderr: &[u8]) -> String {
    let text = String::from_utf8_lossy(stderr);
    let mut start = text.len().saturating_sub(1000);
    while !text.is_char_boundary(start) {
        start += 1;
    }
    text[start..].to_string()
}

pub struct GccWrapper {
    exe: PathBuf,
    raw_args: ArgList,
    env: HashMap<String, String>,
    preprocess_mode: bool,
    resolved: Option<ArgList>,
    implicit_inputs: Vec<String>,
}

impl GccWrapper {
    pub fn new(
        exe: PathBuf,
        raw_args: ArgList,
        env: HashMap<String, String>,
        preprocess_mode: bool,
    ) -> GccWrapper {
        GccWrapper {
            exe,
            raw_args,
            env,
            preprocess_mode,
            resolved: None,
            implicit_inputs: Vec::new(),
        }
    }

    fn resolved(&self) -> Result<&ArgList, WrapperError> {
        self.resolved
            .as_ref()
            .ok_or_else(|| WrapperError::Unparseable("arguments not resolved".into()))
    }

    fn compat(&self) -> CompatMode {
        match program_id_for(&self.exe) {
            Ok(id) => id.compat,
            Err(_) => classify_base_name(&base_name_of(&self.exe))
                .unwrap_or(CompatMode::Unspecified),
        }
    }

    fn value_of(&self, flag: &str) -> Option<&str> {
        let args = self.resolved.as_ref()?.as_slice();
        let mut idx = 0;
        let mut found = None;
        while idx < args.len() {
            if args[idx] == flag {
                found = args.get(idx + 1).map(|s| s.as_str());
                idx += 2;
            } else if TWO_TOKEN_FLAGS.contains(&args[idx].as_str()) {
                idx += 2;
            } else {
                idx += 1;
            }
        }
        // last occurrence wins, like the real driver
        found
    }

    fn has_flag(&self, flag: &str) -> bool {
        self.resolved
            .as_ref()
            .map(|args| args.iter().any(|a| a == flag))
            .unwrap_or(false)
    }

    fn positional_tokens(&self) -> Vec<String> {
        let args = match &self.resolved {
            Some(a) => a.as_slice(),
            None => return Vec::new(),
        };
        let mut out = Vec::new();
        let mut idx = 0;
        while idx < args.len() {
            let token = &args[idx];
            if TWO_TOKEN_FLAGS.contains(&token.as_str()) {
                idx += 2;
            } else if token.starts_with('-') && token.len() > 1 {
                idx += 1;
            } else {
                out.push(token.clone());
                idx += 1;
            }
        }
        out
    }

    /// Reject shapes we choose not to cache. These are legal invocations;
    /// the orchestrator reacts by running the tool transparently.
    fn check_cacheable(&self) -> Result<(), WrapperError> {
        let args = self.resolved()?;
        for token in args.iter() {
            match token.as_str() {
                "--help" | "--version" | "-v" => {
                    return Err(WrapperError::NonCacheable(format!(
                        "driver information request ({token})"
                    )));
                }
                "-E" | "-M" | "-MM" => {
                    return Err(WrapperError::NonCacheable(
                        "preprocess-only invocation".into(),
                    ));
                }
                "-S" => {
                    return Err(WrapperError::NonCacheable(
                        "assembly output invocation".into(),
                    ));
                }
                "-" => {
                    return Err(WrapperError::NonCacheable(
                        "input from standard input".into(),
                    ));
                }
                _ => {}
            }
            if token.starts_with("-fprofile-use") || token.starts_with("-fprofile-generate") {
                return Err(WrapperError::NonCacheable(
                    "profile-guided compilation".into(),
                ));
            }
            // -Wp, can smuggle depfile controls past the relevant-argument
            // filter; refuse rather than parse them.
            if token.starts_with("-Wp,")
                && ["-MD", "-MMD", "-MF"].iter().any(|f| token.contains(f))
            {
                return Err(WrapperError::NonCacheable(
                    "depfile controls inside -Wp,".into(),
                ));
            }
        }

        if !self.has_flag("-c") {
            return Err(WrapperError::NonCacheable("not a compile step".into()));
        }
        let positionals = self.positional_tokens();
        let inputs = self.input_files();
        if positionals.len() != inputs.len() {
            return Err(WrapperError::NonCacheable(
                "unrecognized positional argument".into(),
            ));
        }
        match inputs.len() {
            1 => Ok(()),
            0 => Err(WrapperError::NonCacheable("no input source file".into())),
            n => Err(WrapperError::NonCacheable(format!(
                "{n} input source files"
            ))),
        }
    }

    fn single_input(&self) -> Result<String, WrapperError> {
        let mut inputs = self.input_files();
        match inputs.len() {
            1 => Ok(inputs.remove(0)),
            n => Err(WrapperError::Unparseable(format!(
                "expected exactly one input source file, found {n}"
            ))),
        }
    }

    /// The command line for the hashing preprocess run: the resolved args
    /// minus the compile action, the output target, and depfile controls;
    /// plus `-E`, `-H` (header report on stderr), and a temp output.
    fn preprocess_command(&self, out_path: &Path) -> Result<Vec<String>, WrapperError> {
        let args = self.resolved()?.as_slice();
        let mut cmd = Vec::with_capacity(args.len() + 4);
        let mut idx = 0;
        while idx < args.len() {
            match args[idx].as_str() {
                "-c" | "-MD" | "-MMD" | "-MP" => idx += 1,
                "-o" | "-MF" | "-MT" | "-MQ" => idx += 2,
                _ => {
                    cmd.push(args[idx].clone());
                    idx += 1;
                }
            }
        }
        cmd.push("-E".into());
        cmd.push("-H".into());
        cmd.push("-o".into());
        cmd.push(out_path.to_string_lossy().into_owned());
        Ok(cmd)
    }
}

impl ProgramWrapper for GccWrapper {
    fn can_handle_command(&self) -> bool {
        CLAIM_RE.is_match(&base_name_of(&self.exe))
    }

    fn resolve_args(&mut self) -> Result<(), WrapperError> {
        let expanded = self.raw_args.expand_response_files()?;
        let tokens = expanded.as_slice();
        let mut normalized = Vec::with_capacity(tokens.len());
        let mut idx = 0;
        while idx < tokens.len() {
            let token = &tokens[idx];
            if TWO_TOKEN_FLAGS.contains(&token.as_str()) {
                let value = tokens.get(idx + 1).ok_or_else(|| {
                    WrapperError::Unparseable(format!("{token} is missing its value"))
                })?;
                normalized.push(token.clone());
                normalized.push(value.clone());
                idx += 2;
                continue;
            }
            if let Some(flag) = FUSABLE_FLAGS
                .iter()
                .find(|f| token.len() > f.len() && token.starts_with(*f))
            {
                normalized.push((*flag).to_string());
                normalized.push(token[flag.len()..].to_string());
                idx += 1;
                continue;
            }
            normalized.push(token.clone());
            idx += 1;
        }
        self.resolved = Some(ArgList::new(normalized));
        self.check_cacheable()
    }

    fn capabilities(&self) -> BTreeSet<Capability> {
        let mut caps = BTreeSet::new();
        caps.insert(Capability::HardLinks);
        if self.has_flag("-MD") || self.has_flag("-MMD") {
            caps.insert(Capability::Depfile);
            caps.insert(Capability::DirectMode);
        }
        caps
    }

    fn compat_tag(&self) -> &'static str {
        self.compat().tag()
    }

    fn program_id(&self) -> Result<Vec<u8>, WrapperError> {
        Ok(program_id_for(&self.exe)?.digest.to_vec())
    }

    fn relevant_arguments(&self) -> Vec<String> {
        let args = match &self.resolved {
            Some(a) => a.as_slice(),
            None => return Vec::new(),
        };
        let elide_defines = self.preprocess_mode && self.uses_defines_in_preprocess();
        let mut out = Vec::new();
        let mut idx = 0;
        while idx < args.len() {
            let token = &args[idx];
            match token.as_str() {
                "-o" | "-MF" | "-MT" | "-MQ" => {
                    idx += 2;
                    continue;
                }
                "-MD" | "-MMD" | "-MP" => {
                    idx += 1;
                    continue;
                }
                "-D" if elide_defines => {
                    idx += 2;
                    continue;
                }
                _ => {}
            }
            if token.starts_with("-fdiagnostics-")
                || token.starts_with("-fno-diagnostics-")
                || token == "-fcolor-diagnostics"
                || token == "-fno-color-diagnostics"
                || token == "-fansi-escape-codes"
            {
                idx += 1;
                continue;
            }
            // warning selection doesn't change the object file, but -Wa,/
            // -Wl,/-Wp, forward real options to the sub-tools
            if token.starts_with("-W")
                && !token.starts_with("-Wa,")
                && !token.starts_with("-Wl,")
                && !token.starts_with("-Wp,")
            {
                idx += 1;
                continue;
            }
            if is_source_file(token) {
                idx += 1;
                continue;
            }
            out.push(token.clone());
            if TWO_TOKEN_FLAGS.contains(&token.as_str()) {
                if let Some(value) = args.get(idx + 1) {
                    out.push(value.clone());
                }
                idx += 2;
            } else {
                idx += 1;
            }
        }
        out
    }

    fn relevant_env_vars(&self) -> BTreeMap<String, String> {
        RELEVANT_ENV_VARS
            .iter()
            .filter_map(|name| {
                self.env
                    .get(*name)
                    .map(|value| (name.to_string(), value.clone()))
            })
            .collect()
    }

    fn input_files(&self) -> Vec<String> {
        self.positional_tokens()
            .into_iter()
            .filter(|t| is_source_file(t))
            .collect()
    }

    fn uses_defines_in_preprocess(&self) -> bool {
        // Both dialects expand -D/-U macros fully into -E output, so the
        // preprocessed source already reflects them. An unrecognized
        // dialect keeps its defines in the relevant arguments.
        matches!(self.compat(), CompatMode::GccLike | CompatMode::ClangLike)
    }

    fn preprocess_source(&mut self) -> Result<Vec<u8>, WrapperError> {
        let tmp = TmpEntry::new(&fsutil::temp_dir(), ".i");
        let cmd = self.preprocess_command(tmp.path())?;

        let output = Command::new(&self.exe)
            .args(&cmd)
            .stdin(Stdio::null())
            .output()
            .map_err(|e| WrapperError::io("exec", &self.exe, e))?;
        if !output.status.success() {
            return Err(WrapperError::ToolFailed {
                exit_code: output.status.code().unwrap_or(1),
                stderr_tail: stderr_tail(&output.stderr),
            });
        }

        let stderr = String::from_utf8_lossy(&output.stderr);
        self.implicit_inputs = parse_header_report(&stderr);

        fs::read(tmp.path()).map_err(|e| WrapperError::io("read", tmp.path(), e))
    }

    fn implicit_input_files(&self) -> Vec<String> {
        if self.preprocess_mode {
            return self.implicit_inputs.clone();
        }
        // Direct mode: reuse the depfile a previous compile of this target
        // left behind. Missing or stale files only widen the miss rate.
        let dep_path = match self.build_files() {
            Ok(files) => match files.get(&OutputRole::Dep) {
                Some(path) => path.clone(),
                None => return Vec::new(),
            },
            Err(_) => return Vec::new(),
        };
        if !fsutil::file_exists(&dep_path) {
            return Vec::new();
        }
        match fs::read_to_string(&dep_path) {
            Ok(text) => parse_depfile(&text),
            Err(_) => Vec::new(),
        }
    }

    fn build_files(&self) -> Result<BuildFiles, WrapperError> {
        self.resolved()?;
        let input = self.single_input()?;

        let object = match self.value_of("-o") {
            Some(path) => path.to_string(),
            None => format!("{}.o", paths::stem(&input)),
        };

        let mut files = BuildFiles::new();
        files.insert(OutputRole::Object, PathBuf::from(&object));

        if self.has_flag("-MD") || self.has_flag("-MMD") {
            let dep = match self.value_of("-MF") {
                Some(path) => path.to_string(),
                // the driver derives the depfile name from -o when given
                None => match self.value_of("-o") {
                    Some(out) => paths::with_extension(out, ".d"),
                    None => format!("{}.d", paths::stem(&input)),
                },
            };
            files.insert(OutputRole::Dep, PathBuf::from(dep));
        }

        if self.has_flag("--coverage") || self.has_flag("-ftest-coverage") {
            files.insert(
                OutputRole::CoverageNotes,
                PathBuf::from(paths::with_extension(&object, ".gcno")),
            );
        }

        Ok(files)
    }
}

/// Extract included headers from `-H` output: every line of one or more
/// dots, a space, and a path names one header at that include depth. The
/// "Multiple include guards" footer doesn't match and falls away.
fn parse_header_report(stderr: &str) -> Vec<String> {
    let mut seen = IndexSet::new();
    for line in stderr.lines() {
        let line = line.trim_end_matches('\r');
        let dots = line.bytes().take_while(|&b| b == b'.').count();
        if dots == 0 {
            continue;
        }
        match line[dots..].strip_prefix(' ') {
            Some(path) if !path.is_empty() => {
                seen.insert(paths::canonicalize(path));
            }
            _ => {}
        }
    }
    seen.into_iter().collect()
}

/// Parse a Make-style depfile: `target: dep dep \` continuations, spaces
/// escaped as `\ `, plus the phony `header:` rules -MP appends.
fn parse_depfile(text: &str) -> Vec<String> {
    let joined = text.replace("\\\r\n", " ").replace("\\\n", " ");
    let mut deps = IndexSet::new();
    for line in joined.lines() {
        let rest = match line.find(':') {
            Some(idx) => &line[idx + 1..],
            None => line,
        };
        let mut current = String::new();
        let mut chars = rest.chars().peekable();
        loop {
            let c = match chars.next() {
                Some(c) => c,
                None => break,
            };
            if c == '\\' && chars.peek() == Some(&' ') {
                current.push(' ');
                chars.next();
            } else if c.is_whitespace() {
                flush_dep(&mut current, &mut deps);
            } else {
                current.push(c);
            }
        }
        flush_dep(&mut current, &mut deps);
    }
    deps.into_iter().collect()
}

fn flush_dep(current: &mut String, deps: &mut IndexSet<String>) {
    // tokens ending in ':' are rule targets, not dependencies
    if !current.is_empty() && !current.ends_with(':') {
        deps.insert(paths::canonicalize(current));
    }
    current.clear();
}
