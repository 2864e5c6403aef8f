//! Configuration files
//!
//! The server and every user directory carry a flat `key = value` config
//! file. Lines starting with `#` are comments; blank lines are ignored.
//! Unknown keys are preserved but unused.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use crate::error::{Error, Result};

/// Well-known configuration keys.
pub mod keys {
    pub const ROOT: &str = "root";
    pub const SERVER: &str = "server";
    pub const SERVER_CERT: &str = "server.cert";
    pub const SERVER_KEY: &str = "server.key";
    pub const CA_CERT: &str = "ca.cert";
    pub const QUEUE_SIZE: &str = "queue.size";
    pub const REQUEST_LIMIT: &str = "request.limit";
    pub const TRUST: &str = "trust";
    pub const CONFIRMATION: &str = "confirmation";
    pub const VERBOSE: &str = "verbose";
    pub const LOG: &str = "log";
    pub const PID_FILE: &str = "pid.file";
}

/// Default bound on in-flight request handlers.
pub const DEFAULT_QUEUE_SIZE: usize = 10;

/// Default bound on an incoming frame, in bytes.
pub const DEFAULT_REQUEST_LIMIT: usize = 1_048_576;

/// A `key = value` configuration file.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Config {
    path: PathBuf,
    values: BTreeMap<String, String>,
}

impl Config {
    /// Create an empty config bound to `path`. Nothing is written until
    /// [`Config::save`].
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            values: BTreeMap::new(),
        }
    }

    /// Load a config file, ignoring comments and blank lines.
    pub fn load(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let content = fs::read_to_string(&path)?;
        let mut values = BTreeMap::new();

        for (number, line) in content.lines().enumerate() {
            let trimmed = line.trim();
            if trimmed.is_empty() || trimmed.starts_with('#') {
                continue;
            }
            let Some((key, value)) = trimmed.split_once('=') else {
                return Err(Error::InvalidConfig(format!(
                    "{}:{}: expected `key = value`, got {:?}",
                    path.display(),
                    number + 1,
                    line
                )));
            };
            values.insert(key.trim().to_string(), value.trim().to_string());
        }

        Ok(Self { path, values })
    }

    /// Write the config back to its path atomically (temp file + rename).
    pub fn save(&self) -> Result<()> {
        let mut content = String::new();
        for (key, value) in &self.values {
            content.push_str(key);
            content.push_str(" = ");
            content.push_str(value);
            content.push('\n');
        }

        let temp = self.path.with_extension("tmp");
        fs::write(&temp, content.as_bytes())?;
        set_file_mode(&temp, 0o600)?;
        fs::rename(&temp, &self.path)?;
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.values.get(key).map(String::as_str)
    }

    pub fn get_or(&self, key: &str, default: &'static str) -> &str {
        self.get(key).unwrap_or(default)
    }

    pub fn get_usize(&self, key: &str) -> Result<Option<usize>> {
        match self.get(key) {
            None => Ok(None),
            Some(raw) => raw.parse().map(Some).map_err(|_| {
                Error::InvalidConfig(format!("{key}: expected a number, got {raw:?}"))
            }),
        }
    }

    pub fn get_bool(&self, key: &str) -> Result<Option<bool>> {
        match self.get(key) {
            None => Ok(None),
            Some("true") | Some("1") | Some("yes") => Ok(Some(true)),
            Some("false") | Some("0") | Some("no") => Ok(Some(false)),
            Some(raw) => Err(Error::InvalidConfig(format!(
                "{key}: expected a boolean, got {raw:?}"
            ))),
        }
    }

    pub fn set(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.values.insert(key.into(), value.into());
    }

    /// Iterate all `(key, value)` pairs in sorted order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.values
            .iter()
            .map(|(k, v)| (k.as_str(), v.as_str()))
    }
}

#[cfg(unix)]
fn set_file_mode(path: &Path, mode: u32) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(path, fs::Permissions::from_mode(mode))?;
    Ok(())
}

#[cfg(not(unix))]
fn set_file_mode(_path: &Path, _mode: u32) -> Result<()> {
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn round_trip_preserves_values() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("config");

        let mut config = Config::new(&path);
        config.set("root", "/srv/taskd");
        config.set("queue.size", "10");
        config.set("trust", "strict");
        config.save().unwrap();

        let loaded = Config::load(&path).unwrap();
        assert_eq!(loaded.get("root"), Some("/srv/taskd"));
        assert_eq!(loaded.get_usize("queue.size").unwrap(), Some(10));
        assert_eq!(loaded.get("trust"), Some("strict"));
    }

    #[test]
    fn comments_and_blank_lines_are_ignored() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("config");
        fs::write(
            &path,
            "# server configuration\n\nserver = localhost:53589\n  # indented comment\nverbose = true\n",
        )
        .unwrap();

        let config = Config::load(&path).unwrap();
        assert_eq!(config.get("server"), Some("localhost:53589"));
        assert_eq!(config.get_bool("verbose").unwrap(), Some(true));
        assert_eq!(config.iter().count(), 2);
    }

    #[test]
    fn malformed_line_is_rejected() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("config");
        fs::write(&path, "server localhost:53589\n").unwrap();

        let err = Config::load(&path).unwrap_err();
        assert!(err.to_string().contains("key = value"));
    }

    #[test]
    fn typed_getters_reject_garbage() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("config");
        fs::write(&path, "queue.size = many\nverbose = sometimes\n").unwrap();

        let config = Config::load(&path).unwrap();
        assert!(config.get_usize("queue.size").is_err());
        assert!(config.get_bool("verbose").is_err());
        assert_eq!(config.get_usize("request.limit").unwrap(), None);
    }
}
