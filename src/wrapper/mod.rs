//! The polymorphic contract every compiler-family adapter implements, and
//! wrapper selection. The orchestrator talks to adapters exclusively
//! through `ProgramWrapper`, in a fixed call order: claim, resolve,
//! capabilities, program id, then the fingerprint queries.

use crate::args::ArgList;
use crate::prelude::*;
use indexmap::IndexMap;

pub mod gcc;

/// Optimizations the orchestrator may legally apply to this invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Capability {
    Depfile,
    DirectMode,
    HardLinks,
}

impl Capability {
    pub fn tag(&self) -> &'static str {
        match self {
            Capability::Depfile => "depfile",
            Capability::DirectMode => "direct_mode",
            Capability::HardLinks => "hard_links",
        }
    }
}

/// Logical names for the artifacts a single compile produces.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum OutputRole {
    Object,
    Dep,
    CoverageNotes,
}

impl OutputRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            OutputRole::Object => "object",
            OutputRole::Dep => "dep",
            OutputRole::CoverageNotes => "coverage-notes",
        }
    }
}

impl Display for OutputRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Role -> path the real tool will write it to. Order preserved so the
/// fingerprint and manifest see a stable sequence.
pub type BuildFiles = IndexMap<OutputRole, PathBuf>;

pub trait ProgramWrapper {
    /// Does this wrapper own the invocation? Pure; inspects the executable
    /// path (and possibly argv) only.
    fn can_handle_command(&self) -> bool;

    /// Expand response files and normalize fused/split flags. Afterwards
    /// the resolved sequence is the canonical argument list used by every
    /// other query. Also the point where clearly non-cacheable shapes
    /// (link steps, `--help`, stdin input) are rejected.
    fn resolve_args(&mut self) -> Result<(), WrapperError>;

    fn capabilities(&self) -> BTreeSet<Capability>;

    /// Tag for the compatible-mode the adapter inferred; folded into the
    /// fingerprint so e.g. gcc-like and clang-like never share entries.
    fn compat_tag(&self) -> &'static str;

    /// Stable identifier for the tool binary (content + version digest),
    /// memoized per path within the process.
    fn program_id(&self) -> Result<Vec<u8>, WrapperError>;

    /// The filtered argument sequence: only tokens that semantically affect
    /// a cacheable run's output, in original order.
    fn relevant_arguments(&self) -> Vec<String>;

    /// The declared environment variables the tool reads, as found in this
    /// invocation's snapshot.
    fn relevant_env_vars(&self) -> BTreeMap<String, String>;

    /// Explicit input source files from the argument list.
    fn input_files(&self) -> Vec<String>;

    /// Whether `-D` macros are fully absorbed by this tool's preprocessed
    /// output (and so may be elided from relevant arguments in preprocess
    /// mode).
    fn uses_defines_in_preprocess(&self) -> bool;

    /// Run the tool's preprocessor to get a deterministic textual form of
    /// the translation unit; records implicit inputs as a side effect.
    fn preprocess_source(&mut self) -> Result<Vec<u8>, WrapperError>;

    /// Headers (and similar) pulled in transitively. Never fails; empty
    /// when unknown.
    fn implicit_input_files(&self) -> Vec<String>;

    /// Where the real invocation will write each artifact.
    fn build_files(&self) -> Result<BuildFiles, WrapperError>;
}

/// Hand the invocation to the first wrapper that claims it.
pub fn select(
    exe: &Path,
    args: &ArgList,
    env: &HashMap<String, String>,
    preprocess_mode: bool,
) -> Option<Box<dyn ProgramWrapper>> {
    let candidates: Vec<Box<dyn ProgramWrapper>> = vec![Box::new(gcc::GccWrapper::new(
        exe.to_path_buf(),
        args.clone(),
        env.clone(),
        preprocess_mode,
    ))];
    candidates.into_iter().find(|w| w.can_handle_command())
}
