//! Plugin metadata extraction.
//!
//! Plugins declare metadata as module-level assignments near the top of their
//! source, e.g.:
//!
//! ```python
//! plugin_api = "2.3"
//! plugin_name = "Weather"
//! plugin_requires = ["requests>=2.0"]
//! plugin_executables = ["curl"]
//! ```
//!
//! Only single-line string and string-list assignments are recognized; the
//! source is never executed to read its metadata.

use crate::{MAJOR_API_VERSION, MINOR_API_VERSION};
use once_cell::sync::Lazy;
use regex::Regex;
use thiserror::Error;

const ATTR_API: &str = "plugin_api";
const ATTR_NAME: &str = "plugin_name";
const ATTR_VERSION: &str = "plugin_version";
const ATTR_DESCRIPTION: &str = "plugin_description";
const ATTR_LICENSE: &str = "plugin_license";
const ATTR_URL: &str = "plugin_url";
const ATTR_ENTRY: &str = "plugin_entry";
const ATTR_AUTHORS: &str = "plugin_authors";
const ATTR_REQUIRES: &str = "plugin_requires";
const ATTR_EXECUTABLES: &str = "plugin_executables";
const ATTR_PLATFORMS: &str = "plugin_platforms";

static STRING_ASSIGN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"^\s*([A-Za-z_][A-Za-z0-9_]*)\s*=\s*"([^"]*)"\s*(?:#.*)?$"#).unwrap()
});
static LIST_ASSIGN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"^\s*([A-Za-z_][A-Za-z0-9_]*)\s*=\s*\[([^\]]*)\]\s*(?:#.*)?$"#).unwrap()
});
static LIST_ITEM: Lazy<Regex> = Lazy::new(|| Regex::new(r#""([^"]*)""#).unwrap());
static API_VERSION: Lazy<Regex> = Lazy::new(|| Regex::new(r"^(\d+)\.(\d+)$").unwrap());

#[derive(Error, Debug)]
pub enum MetadataError {
    /// The path is not a plugin at all. Skipped quietly during discovery.
    #[error("{0}")]
    NotAPlugin(String),

    /// The path looks like a plugin but its metadata is unusable.
    #[error("{0}")]
    Invalid(String),
}

/// Metadata declared by a plugin module.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PluginMetadata {
    /// Declared plugin API version, `<major>.<minor>`.
    pub api: String,
    pub name: Option<String>,
    pub version: Option<String>,
    pub description: Option<String>,
    pub license: Option<String>,
    pub url: Option<String>,
    /// Entry-point class name. Defaults to "Plugin".
    pub entry: Option<String>,
    pub authors: Vec<String>,
    /// Required packages, as requirement specs ("requests", "requests>=2.0").
    pub requires: Vec<String>,
    /// Executables that must be reachable via `$PATH`.
    pub executables: Vec<String>,
    /// Supported platforms ("linux", "macos", "windows"); empty means all.
    pub platforms: Vec<String>,
}

impl PluginMetadata {
    /// Parse metadata from plugin source. Fails with [`MetadataError::NotAPlugin`]
    /// when no API declaration is present, and with [`MetadataError::Invalid`]
    /// when the declared API version is malformed or incompatible.
    pub fn parse(source: &str) -> Result<Self, MetadataError> {
        let mut metadata = Self::default();
        let mut has_api = false;

        for line in source.lines() {
            if let Some(caps) = STRING_ASSIGN.captures(line) {
                let value = caps[2].to_string();
                match &caps[1] {
                    ATTR_API => {
                        metadata.api = value;
                        has_api = true;
                    }
                    ATTR_NAME => metadata.name = Some(value),
                    ATTR_VERSION => metadata.version = Some(value),
                    ATTR_DESCRIPTION => metadata.description = Some(value),
                    ATTR_LICENSE => metadata.license = Some(value),
                    ATTR_URL => metadata.url = Some(value),
                    ATTR_ENTRY => metadata.entry = Some(value),
                    // Scalar form of the list attributes
                    ATTR_AUTHORS => metadata.authors = vec![value],
                    ATTR_REQUIRES => metadata.requires = vec![value],
                    ATTR_EXECUTABLES => metadata.executables = vec![value],
                    ATTR_PLATFORMS => metadata.platforms = vec![value],
                    _ => {}
                }
            } else if let Some(caps) = LIST_ASSIGN.captures(line) {
                let items: Vec<String> = LIST_ITEM
                    .captures_iter(&caps[2])
                    .map(|c| c[1].to_string())
                    .collect();
                match &caps[1] {
                    ATTR_AUTHORS => metadata.authors = items,
                    ATTR_REQUIRES => metadata.requires = items,
                    ATTR_EXECUTABLES => metadata.executables = items,
                    ATTR_PLATFORMS => metadata.platforms = items,
                    _ => {}
                }
            }
        }

        if !has_api {
            return Err(MetadataError::NotAPlugin(
                "no plugin API declaration found".to_string(),
            ));
        }

        metadata.check_api()?;
        Ok(metadata)
    }

    /// Entry-point class name the loader instantiates.
    pub fn entry_point(&self) -> &str {
        self.entry.as_deref().unwrap_or("Plugin")
    }

    fn check_api(&self) -> Result<(), MetadataError> {
        let Some(caps) = API_VERSION.captures(&self.api) else {
            return Err(MetadataError::Invalid(format!(
                "Invalid API version format: '{}'. Expected <major>.<minor>.",
                self.api
            )));
        };
        let major: u32 = caps[1].parse().unwrap_or(0);
        let minor: u32 = caps[2].parse().unwrap_or(0);

        if major != MAJOR_API_VERSION {
            return Err(MetadataError::Invalid(format!(
                "Incompatible major API version. Expected {}, got {}.",
                MAJOR_API_VERSION, major
            )));
        }
        if minor > MINOR_API_VERSION {
            return Err(MetadataError::Invalid(format!(
                "Incompatible minor API version. Up to {} supported, got {}.",
                MINOR_API_VERSION, minor
            )));
        }
        Ok(())
    }

    /// Whether the current platform is in the declared platform list.
    pub fn platform_supported(&self) -> bool {
        self.platforms.is_empty()
            || self
                .platforms
                .iter()
                .any(|p| p.eq_ignore_ascii_case(std::env::consts::OS))
    }
}
