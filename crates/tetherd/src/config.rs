//! Daemon configuration.
//!
//! Loaded from a TOML file (default: `~/.config/tether/config.toml`) with
//! `TETHER_*` environment variables layered on top.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use ::config::{Config, Environment, File, FileFormat};
use serde::{Deserialize, Serialize};

use crate::agent::SupervisorConfig;

pub const APP_NAME: &str = "tether";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct TetherConfig {
    pub server: ServerSection,
    pub agent: AgentSection,
    pub pairing: PairingSection,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerSection {
    /// Address the HTTP bridge binds to.
    pub bind: String,
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            bind: "127.0.0.1:4521".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentSection {
    /// Agent binary. Tilde-expanded.
    pub binary: String,
    /// Arguments passed to the agent.
    pub args: Vec<String>,
    /// Working directory for the agent. Tilde-expanded.
    pub workdir: Option<String>,
    /// Default per-call timeout.
    pub call_timeout_secs: u64,
    /// Cap on the restart backoff delay.
    pub backoff_cap_secs: u64,
    /// Grace period between SIGTERM and SIGKILL at shutdown.
    pub kill_grace_secs: u64,
}

impl Default for AgentSection {
    fn default() -> Self {
        Self {
            binary: "pi".to_string(),
            args: vec!["--mode".to_string(), "rpc".to_string()],
            workdir: None,
            call_timeout_secs: 60,
            backoff_cap_secs: 30,
            kill_grace_secs: 3,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PairingSection {
    /// Whether clients must pair before using sensitive routes.
    pub required: bool,
    /// Token store location. Defaults to the data directory.
    pub store_path: Option<String>,
}

impl Default for PairingSection {
    fn default() -> Self {
        Self {
            required: true,
            store_path: None,
        }
    }
}

impl TetherConfig {
    /// Load configuration from `path` (or the default location) plus
    /// `TETHER_*` environment overrides. A missing file yields defaults.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let path = path
            .map(Path::to_path_buf)
            .unwrap_or_else(default_config_path);

        let mut builder = Config::builder();
        if path.exists() {
            builder = builder.add_source(File::from(path.as_path()).format(FileFormat::Toml));
        }

        let settings = builder
            .add_source(Environment::with_prefix("TETHER").separator("__"))
            .build()
            .context("loading configuration")?;
        settings
            .try_deserialize()
            .context("parsing configuration")
    }

    /// The supervisor configuration this config describes.
    pub fn supervisor_config(&self) -> SupervisorConfig {
        SupervisorConfig {
            binary: PathBuf::from(shellexpand::tilde(&self.agent.binary).into_owned()),
            args: self.agent.args.clone(),
            workdir: self
                .agent
                .workdir
                .as_deref()
                .map(|dir| PathBuf::from(shellexpand::tilde(dir).into_owned())),
            call_timeout: Duration::from_secs(self.agent.call_timeout_secs),
            backoff_cap: Duration::from_secs(self.agent.backoff_cap_secs),
            kill_grace: Duration::from_secs(self.agent.kill_grace_secs),
        }
    }

    /// Where bearer token hashes are persisted.
    pub fn token_store_path(&self) -> PathBuf {
        match self.pairing.store_path.as_deref() {
            Some(path) => PathBuf::from(shellexpand::tilde(path).into_owned()),
            None => data_dir().join("tokens.json"),
        }
    }

    /// Default config file contents for `tetherd init`.
    pub fn default_toml() -> String {
        toml::to_string_pretty(&TetherConfig::default())
            .expect("default config serializes")
    }
}

pub fn config_dir() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(APP_NAME)
}

pub fn default_config_path() -> PathBuf {
    config_dir().join("config.toml")
}

pub fn data_dir() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(APP_NAME)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = TetherConfig::default();
        assert_eq!(config.server.bind, "127.0.0.1:4521");
        assert_eq!(config.agent.binary, "pi");
        assert_eq!(config.agent.call_timeout_secs, 60);
        assert_eq!(config.agent.backoff_cap_secs, 30);
        assert!(config.pairing.required);
    }

    #[test]
    fn test_supervisor_config_from_defaults() {
        let supervisor = TetherConfig::default().supervisor_config();
        assert_eq!(supervisor.args, vec!["--mode", "rpc"]);
        assert_eq!(supervisor.call_timeout, Duration::from_secs(60));
        assert_eq!(supervisor.backoff_cap, Duration::from_secs(30));
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(
            &path,
            r#"
[server]
bind = "0.0.0.0:9000"

[agent]
binary = "/opt/agent/bin/agent"
call_timeout_secs = 10

[pairing]
required = false
"#,
        )
        .unwrap();

        let config = TetherConfig::load(Some(&path)).unwrap();
        assert_eq!(config.server.bind, "0.0.0.0:9000");
        assert_eq!(config.agent.binary, "/opt/agent/bin/agent");
        assert_eq!(config.agent.call_timeout_secs, 10);
        // Unset fields keep their defaults.
        assert_eq!(config.agent.backoff_cap_secs, 30);
        assert!(!config.pairing.required);
    }

    #[test]
    fn test_missing_file_yields_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = TetherConfig::load(Some(&dir.path().join("absent.toml"))).unwrap();
        assert_eq!(config.server.bind, "127.0.0.1:4521");
    }

    #[test]
    fn test_default_toml_round_trips() {
        let text = TetherConfig::default_toml();
        let parsed: TetherConfig = toml::from_str(&text).unwrap();
        assert_eq!(parsed.server.bind, TetherConfig::default().server.bind);
    }

    #[test]
    fn test_token_store_path_override() {
        let mut config = TetherConfig::default();
        config.pairing.store_path = Some("/tmp/tether-test/tokens.json".to_string());
        assert_eq!(
            config.token_store_path(),
            PathBuf::from("/tmp/tether-test/tokens.json")
        );
    }
}
