//! Runtime configuration, read once from the environment at startup. The
//! shim has no flags of its own beyond the maintenance surface -- anything
//! on the command line belongs to the wrapped tool.

use crate::prelude::*;

const DEFAULT_MAX_SIZE: u64 = 5 * 1024 * 1024 * 1024;

#[derive(Debug, Clone)]
pub struct Config {
    /// CACHE_DIR, default: the per-user cache directory.
    pub cache_dir: PathBuf,
    /// CACHE_MAX_SIZE, byte budget for eviction; k/m/g suffixes accepted.
    pub max_size: u64,
    /// CACHE_DISABLE: always run transparently.
    pub disable: bool,
    /// CACHE_DIRECT_MODE: fingerprint from declared inputs only, no
    /// preprocessing.
    pub direct_mode: bool,
    /// CACHE_HARD_LINKS: allow hard-linking hits into place.
    pub hard_links: bool,
    /// CACHE_LOG_FILE: where diagnostics go.
    pub log_file: Option<PathBuf>,
    /// CACHE_DEBUG: tracing filter directive for stderr diagnostics.
    pub debug_filter: Option<String>,
}

impl Config {
    pub fn from_env() -> Config {
        Config {
            cache_dir: get("CACHE_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|| PROJECT_DIRS.cache_dir().to_path_buf()),
            max_size: get("CACHE_MAX_SIZE")
                .and_then(|v| parse_size(&v))
                .unwrap_or(DEFAULT_MAX_SIZE),
            disable: get("CACHE_DISABLE").is_some(),
            direct_mode: get("CACHE_DIRECT_MODE").is_some(),
            hard_links: get("CACHE_HARD_LINKS").is_some(),
            log_file: get("CACHE_LOG_FILE").map(PathBuf::from),
            debug_filter: get("CACHE_DEBUG"),
        }
    }
}

// empty means unset, matching the usual "VAR= make" idiom for clearing
fn get(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.is_empty())
}

fn parse_size(text: &str) -> Option<u64> {
    let text = text.trim();
    let (number, multiplier) = match text.char_indices().last()? {
        (idx, 'k' | 'K') => (&text[..idx], 1024u64),
        (idx, 'm' | 'M') => (&text[..idx], 1024 * 1024),
        (idx, 'g' | 'G') => (&text[..idx], 1024 * 1024 * 1024),
        _ => (text, 1),
    };
    let value: u64 = number.trim().parse().ok()?;
    value.checked_mul(multiplier)
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_parse_size() {
        assert_eq!(parse_size("1024"), Some(1024));
        assert_eq!(parse_size("16k"), Some(16 * 1024));
        assert_eq!(parse_size("100M"), Some(100 * 1024 * 1024));
        assert_eq!(parse_size("2g"), Some(2 * 1024 * 1024 * 1024));
        assert_eq!(parse_size(" 5 G "), Some(5 * 1024 * 1024 * 1024));
        assert_eq!(parse_size(""), None);
        assert_eq!(parse_size("lots"), None);
        assert_eq!(parse_size("12q"), None);
        // overflow is a parse failure, not a wrap-around
        assert_eq!(parse_size("99999999999999999999g"), None);
    }
}
