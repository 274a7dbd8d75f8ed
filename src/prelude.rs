pub use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
pub use std::convert::{TryFrom, TryInto};
pub use std::fmt::Display;
pub use std::path::{Path, PathBuf};
pub use std::str::FromStr;

pub use eyre::{bail, eyre, Result, WrapErr};
pub use once_cell::sync::Lazy;
pub use regex::Regex;
pub use serde::{Deserialize, Serialize};
pub use serde_with::{DeserializeFromStr, SerializeDisplay};
pub use tracing::{debug, trace, warn};

pub use crate::error::WrapperError;
pub use crate::try_from_str_boilerplate;

use directories::ProjectDirs;
pub static PROJECT_DIRS: Lazy<ProjectDirs> = Lazy::new(|| {
    // ...Can this actually return None?
    ProjectDirs::from("", "", env!("CARGO_PKG_NAME")).unwrap()
});
