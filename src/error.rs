use std::path::PathBuf;
use thiserror::Error;

/// Everything that can go wrong between "a wrapper claimed this command"
/// and "we have a cache verdict". None of these ever surface to the build
/// system: the orchestrator reacts to all of them by running the real tool
/// transparently.
#[derive(Error, Debug)]
pub enum WrapperError {
    #[error("cannot make sense of the command line: {0}")]
    Unparseable(String),

    #[error("{op} failed for {}", path.display())]
    Io {
        op: &'static str,
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("tool exited with status {exit_code} during preprocessing")]
    ToolFailed { exit_code: i32, stderr_tail: String },

    #[error("not cacheable: {0}")]
    NonCacheable(String),
}

impl WrapperError {
    pub fn io(op: &'static str, path: impl Into<PathBuf>, source: std::io::Error) -> WrapperError {
        WrapperError::Io {
            op,
            path: path.into(),
            source,
        }
    }
}
