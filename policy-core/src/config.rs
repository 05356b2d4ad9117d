use std::path::Path;

use serde::Deserialize;
use thiserror::Error;

/// Address families taken into account by a compilation run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum IpMode {
    Ipv4,
    Ipv6,
    #[default]
    Dual,
}

impl IpMode {
    pub fn allows_v4(self) -> bool {
        matches!(self, IpMode::Ipv4 | IpMode::Dual)
    }

    pub fn allows_v6(self) -> bool {
        matches!(self, IpMode::Ipv6 | IpMode::Dual)
    }
}

/// Run-time switches of the compiler.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    /// Queue info and progress messages.
    pub verbose: bool,
    /// Prefix progress messages with elapsed seconds.
    pub time_stamps: bool,
    /// Abort after this many errors; 0 disables the limit.
    pub max_errors: usize,
    pub ip_mode: IpMode,
    /// Buffer messages and emit them ordered at each checkpoint.
    pub sort_messages: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            verbose: false,
            time_stamps: false,
            max_errors: 10,
            ip_mode: IpMode::Dual,
            sort_messages: false,
        }
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse config {path}: {source}")]
    Parse {
        path: String,
        #[source]
        source: toml::de::Error,
    },
}

const EMBEDDED_DEFAULT: &str = include_str!(concat!(env!("CARGO_MANIFEST_DIR"), "/config/default.toml"));

/// Load the configuration from `path`, or the embedded default if none is given.
///
/// Keys missing from the file keep their default value.
pub fn load_config(path: Option<&Path>) -> Result<Config, ConfigError> {
    match path {
        Some(path) => {
            let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
                path: path.display().to_string(),
                source,
            })?;
            parse_config(&raw, &path.display().to_string())
        }
        None => parse_config(EMBEDDED_DEFAULT, "embedded"),
    }
}

fn parse_config(raw: &str, origin: &str) -> Result<Config, ConfigError> {
    toml::from_str::<Config>(raw).map_err(|source| ConfigError::Parse {
        path: origin.to_string(),
        source,
    })
}
