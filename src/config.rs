//! Transform configuration (`.brz/transform.toml`).
//!
//! The engine itself never reads configuration: callers load a
//! [`TransformConfig`] and pass the resolved values into
//! [`TreeTransform::with_options`](crate::transform::TreeTransform::with_options).

use std::fmt;
use std::path::Path;

use serde::Deserialize;

use crate::transform::orphan::OrphanPolicy;

// ---------------------------------------------------------------------------
// Top-level config
// ---------------------------------------------------------------------------

/// Top-level configuration file.
///
/// Missing fields use defaults. Missing file → all defaults (no error).
#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TransformConfig {
    #[serde(default)]
    pub transform: TransformSection,
}

/// The `[transform]` table.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TransformSection {
    /// Orphan handling policy name (`"conflict"` or `"move"`).
    #[serde(default = "default_orphan_policy")]
    pub orphan_policy: String,

    /// Override the target's case-sensitivity detection.
    #[serde(default)]
    pub case_sensitive: Option<bool>,

    /// Cap on conflict-resolution passes.
    #[serde(default = "default_max_resolution_passes")]
    pub max_resolution_passes: usize,
}

impl Default for TransformSection {
    fn default() -> Self {
        Self {
            orphan_policy: default_orphan_policy(),
            case_sensitive: None,
            max_resolution_passes: default_max_resolution_passes(),
        }
    }
}

fn default_orphan_policy() -> String {
    "conflict".to_owned()
}

const fn default_max_resolution_passes() -> usize {
    10
}

impl TransformConfig {
    /// Resolve the configured orphan policy.
    ///
    /// Unknown names are logged and fall back to [`OrphanPolicy::Conflict`].
    #[must_use]
    pub fn orphan_policy(&self) -> OrphanPolicy {
        self.transform
            .orphan_policy
            .parse()
            .unwrap_or_else(|_| {
                tracing::warn!(
                    value = %self.transform.orphan_policy,
                    "unknown orphan policy, falling back to \"conflict\""
                );
                OrphanPolicy::Conflict
            })
    }
}

// ---------------------------------------------------------------------------
// Loading
// ---------------------------------------------------------------------------

/// Error loading a configuration file.
#[derive(Debug)]
pub struct ConfigError {
    /// The path that was being loaded (if available).
    pub path: Option<std::path::PathBuf>,
    /// Human-readable message with line-level detail when possible.
    pub message: String,
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(p) = &self.path {
            write!(f, "{}: {}", p.display(), self.message)
        } else {
            write!(f, "config error: {}", self.message)
        }
    }
}

impl std::error::Error for ConfigError {}

impl TransformConfig {
    /// Load configuration from a TOML file.
    ///
    /// # Errors
    /// Returns `ConfigError` on I/O errors (other than not-found) or parse errors.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let contents = match std::fs::read_to_string(path) {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Ok(Self::default());
            }
            Err(e) => {
                return Err(ConfigError {
                    path: Some(path.to_owned()),
                    message: format!("could not read file: {e}"),
                });
            }
        };
        Self::parse(&contents).map_err(|mut e| {
            e.path = Some(path.to_owned());
            e
        })
    }

    /// Parse configuration from a TOML string.
    ///
    /// # Errors
    /// Returns `ConfigError` on invalid TOML, unknown fields, or a zero
    /// `max_resolution_passes`.
    pub fn parse(toml_str: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(toml_str).map_err(|e| {
            let mut message = e.message().to_owned();
            if let Some(span) = e.span() {
                let line = toml_str[..span.start]
                    .chars()
                    .filter(|&c| c == '\n')
                    .count()
                    + 1;
                message = format!("line {line}: {message}");
            }
            ConfigError {
                path: None,
                message,
            }
        })?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.transform.max_resolution_passes == 0 {
            return Err(ConfigError {
                path: None,
                message: "max_resolution_passes must be at least 1".to_owned(),
            });
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let cfg = TransformConfig::default();
        assert_eq!(cfg.orphan_policy(), OrphanPolicy::Conflict);
        assert_eq!(cfg.transform.case_sensitive, None);
        assert_eq!(cfg.transform.max_resolution_passes, 10);
    }

    #[test]
    fn parse_empty_string() {
        assert_eq!(TransformConfig::parse("").unwrap(), TransformConfig::default());
    }

    #[test]
    fn parse_full_config() {
        let cfg = TransformConfig::parse(
            r#"
[transform]
orphan_policy = "move"
case_sensitive = false
max_resolution_passes = 4
"#,
        )
        .unwrap();
        assert_eq!(cfg.orphan_policy(), OrphanPolicy::Move);
        assert_eq!(cfg.transform.case_sensitive, Some(false));
        assert_eq!(cfg.transform.max_resolution_passes, 4);
    }

    #[test]
    fn unknown_policy_falls_back_to_conflict() {
        let cfg = TransformConfig::parse("[transform]\norphan_policy = \"shred\"\n").unwrap();
        assert_eq!(cfg.orphan_policy(), OrphanPolicy::Conflict);
    }

    #[test]
    fn parse_rejects_unknown_field() {
        let err = TransformConfig::parse("[transform]\ncolour = \"blue\"\n").unwrap_err();
        assert!(err.message.contains("colour"), "{}", err.message);
    }

    #[test]
    fn parse_includes_line_number_on_error() {
        let err = TransformConfig::parse("\n[transform]\nmax_resolution_passes = \"x\"\n")
            .unwrap_err();
        assert!(err.message.contains("line 3"), "{}", err.message);
    }

    #[test]
    fn parse_rejects_zero_resolution_passes() {
        let err = TransformConfig::parse("[transform]\nmax_resolution_passes = 0\n").unwrap_err();
        assert!(err.message.contains("max_resolution_passes"), "{}", err.message);
    }

    #[test]
    fn load_missing_file_returns_defaults() {
        let cfg = TransformConfig::load(Path::new("/nonexistent/transform.toml")).unwrap();
        assert_eq!(cfg, TransformConfig::default());
    }

    #[test]
    fn load_invalid_file_shows_path() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("transform.toml");
        std::fs::write(&path, "not valid [[[toml").unwrap();
        let err = TransformConfig::load(&path).unwrap_err();
        assert_eq!(err.path.as_deref(), Some(path.as_path()));
        assert!(err.to_string().contains("transform.toml"));
    }
}
