//! Process configuration.
//!
//! Settings are read from a single file and merged over built-in defaults. The file is parsed as
//! YAML, which is a superset of JSON, so the historical `/etc/make-vps.json` works unchanged.

use serde::Deserialize;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Where the configuration file lives unless the caller says otherwise.
pub const DEFAULT_CONFIG_PATH: &str = "/etc/make-vps.json";

/// File name of the generated `authorized_keys` artifact within [Config::outdir].
pub const AUTHORIZED_KEYS_FILE: &str = "authorized_keys";

/// File name of the generated attributes artifact within [Config::outdir].
pub const ATTRIBUTES_FILE: &str = "attributes.py";

/// Errors that can occur while loading a [Config].
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {}", .path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("failed to parse config file {}", .path.display())]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },

    #[error("ganeti_auth must have the form user:password")]
    Credential,
}

/// Settings for one reconciliation run.
///
/// Every field has a default, so a config file only needs to name the settings it changes.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Directory holding one key file per instance, named after the instance.
    pub keydir: PathBuf,

    /// Directory that receives the generated artifacts.
    pub outdir: PathBuf,

    /// Host (and optional port) of the cluster manager's HTTP API.
    pub ganeti_instance: String,

    /// HTTP Basic credential in `user:password` form.
    pub ganeti_auth: String,

    /// The program every generated `authorized_keys` entry is forced to run.
    pub helper: String,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            keydir: PathBuf::from("/root/make-vps/keys/"),
            outdir: PathBuf::from("/root/vps/"),
            ganeti_instance: "ganeti:5080".to_owned(),
            ganeti_auth: "user:password".to_owned(),
            helper: "/home/vps/bin/ganeti_cli.py".to_owned(),
        }
    }
}

impl Config {
    /// Reads the config file at `path` and merges it over the defaults.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_owned(),
            source,
        })?;
        Self::parse(&text).map_err(|source| ConfigError::Parse {
            path: path.to_owned(),
            source,
        })
    }

    /// Parses config text. An empty document yields the defaults.
    pub fn parse(text: &str) -> Result<Self, serde_yaml::Error> {
        if text.trim().is_empty() {
            return Ok(Config::default());
        }
        serde_yaml::from_str(text)
    }

    /// Splits [Self::ganeti_auth] into user name and password.
    ///
    /// The password may itself contain colons; only the first one separates the two.
    pub fn credentials(&self) -> Result<(&str, &str), ConfigError> {
        self.ganeti_auth
            .split_once(':')
            .ok_or(ConfigError::Credential)
    }

    /// Path of the generated `authorized_keys` file.
    pub fn authorized_keys_path(&self) -> PathBuf {
        self.outdir.join(AUTHORIZED_KEYS_FILE)
    }

    /// Path of the generated attributes file.
    pub fn attributes_path(&self) -> PathBuf {
        self.outdir.join(ATTRIBUTES_FILE)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn file_values_override_defaults() {
        let config = Config::parse(
            r#"{"keydir": "/srv/keys/", "ganeti_auth": "admin:s3:cret", "extra": 1}"#,
        )
        .unwrap();

        let expected = Config {
            keydir: PathBuf::from("/srv/keys/"),
            ganeti_auth: "admin:s3:cret".to_owned(),
            ..Config::default()
        };
        assert_eq!(expected, config);
        assert_eq!(("admin", "s3:cret"), config.credentials().unwrap());
    }

    #[test]
    fn empty_file_yields_defaults() {
        assert_eq!(Config::default(), Config::parse("").unwrap());
    }

    #[test]
    fn yaml_is_accepted() {
        let config = Config::parse("outdir: /tmp/out\nganeti_instance: cluster:5080\n").unwrap();
        assert_eq!(PathBuf::from("/tmp/out"), config.outdir);
        assert_eq!("cluster:5080", config.ganeti_instance);
        assert_eq!(
            PathBuf::from("/tmp/out/authorized_keys"),
            config.authorized_keys_path()
        );
        assert_eq!(PathBuf::from("/tmp/out/attributes.py"), config.attributes_path());
    }

    #[test]
    fn credential_without_colon_is_rejected() {
        let config = Config {
            ganeti_auth: "nobody".to_owned(),
            ..Config::default()
        };
        assert!(matches!(config.credentials(), Err(ConfigError::Credential)));
    }

    #[test]
    fn load_reads_file() {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(br#"{"helper": "/usr/local/bin/vps"}"#).unwrap();

        let config = Config::load(file.path()).unwrap();
        assert_eq!("/usr/local/bin/vps", config.helper);
    }

    #[test]
    fn load_reports_missing_file() {
        let error = Config::load("/nonexistent/make-vps.json").unwrap_err();
        assert!(matches!(error, ConfigError::Read { .. }));
        assert!(error.to_string().contains("/nonexistent/make-vps.json"));
    }
}
