//! Configuration surface.
//!
//! Layering order: built-in defaults, then an optional YAML file, then
//! environment variable overrides (`SANDKASTEN_<SCREAMING_SNAKE_PATH>`).

use std::collections::HashMap;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{Result, SandkastenError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NetworkMode {
    None,
    Bridge,
    Host,
}

impl Default for NetworkMode {
    fn default() -> Self {
        NetworkMode::None
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SeccompProfile {
    Off,
    Mvp,
    Strict,
}

impl Default for SeccompProfile {
    fn default() -> Self {
        SeccompProfile::Mvp
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Defaults {
    #[serde(default = "default_cpu_limit")]
    pub cpu_limit: f64,
    #[serde(default = "default_mem_limit_mb")]
    pub mem_limit_mb: u64,
    #[serde(default = "default_pids_limit")]
    pub pids_limit: u64,
    #[serde(default = "default_max_exec_timeout_ms")]
    pub max_exec_timeout_ms: u64,
    #[serde(default)]
    pub network_mode: NetworkMode,
    #[serde(default)]
    pub readonly_rootfs: bool,
}

fn default_cpu_limit() -> f64 {
    1.0
}
fn default_mem_limit_mb() -> u64 {
    512
}
fn default_pids_limit() -> u64 {
    128
}
fn default_max_exec_timeout_ms() -> u64 {
    120_000
}

impl Default for Defaults {
    fn default() -> Self {
        Defaults {
            cpu_limit: default_cpu_limit(),
            mem_limit_mb: default_mem_limit_mb(),
            pids_limit: default_pids_limit(),
            max_exec_timeout_ms: default_max_exec_timeout_ms(),
            network_mode: NetworkMode::default(),
            readonly_rootfs: false,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PoolConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub images: HashMap<String, usize>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WorkspaceConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub persist_by_default: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SecurityConfig {
    #[serde(default)]
    pub seccomp: SeccompProfile,
}

impl Default for SecurityConfig {
    fn default() -> Self {
        SecurityConfig {
            seccomp: SeccompProfile::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default = "default_listen")]
    pub listen: String,
    #[serde(default)]
    pub api_key: String,
    #[serde(default = "default_data_dir")]
    pub data_dir: String,
    #[serde(default = "default_image")]
    pub default_image: String,
    #[serde(default)]
    pub allowed_images: Vec<String>,
    #[serde(default = "default_db_path")]
    pub db_path: String,
    #[serde(default = "default_session_ttl_seconds")]
    pub session_ttl_seconds: u64,
    #[serde(default)]
    pub defaults: Defaults,
    #[serde(default)]
    pub pool: PoolConfig,
    #[serde(default)]
    pub workspace: WorkspaceConfig,
    #[serde(default)]
    pub security: SecurityConfig,
}

fn default_listen() -> String {
    "0.0.0.0:8080".to_string()
}
fn default_data_dir() -> String {
    "/var/lib/sandkasten".to_string()
}
fn default_image() -> String {
    "base".to_string()
}
fn default_db_path() -> String {
    "/var/lib/sandkasten/sandkasten.db".to_string()
}
fn default_session_ttl_seconds() -> u64 {
    1800
}

impl Default for Config {
    fn default() -> Self {
        Config {
            listen: default_listen(),
            api_key: String::new(),
            data_dir: default_data_dir(),
            default_image: default_image(),
            allowed_images: Vec::new(),
            db_path: default_db_path(),
            session_ttl_seconds: default_session_ttl_seconds(),
            defaults: Defaults::default(),
            pool: PoolConfig::default(),
            workspace: WorkspaceConfig::default(),
            security: SecurityConfig::default(),
        }
    }
}

impl Config {
    /// Loads defaults, overlays a YAML file if present, then applies
    /// `SANDKASTEN_*` environment overrides for the handful of scalar fields
    /// operators are most likely to override at deploy time.
    pub fn load(path: Option<&Path>) -> Result<Config> {
        let mut config = match path {
            Some(p) => {
                let raw = std::fs::read_to_string(p).map_err(|e| {
                    SandkastenError::Internal(format!("reading config {}: {e}", p.display()))
                })?;
                serde_yaml::from_str(&raw).map_err(|e| {
                    SandkastenError::Internal(format!("parsing config {}: {e}", p.display()))
                })?
            }
            None => Config::default(),
        };

        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    fn apply_env_overrides(&mut self) {
        if let Ok(v) = std::env::var("SANDKASTEN_LISTEN") {
            self.listen = v;
        }
        if let Ok(v) = std::env::var("SANDKASTEN_API_KEY") {
            self.api_key = v;
        }
        if let Ok(v) = std::env::var("SANDKASTEN_DATA_DIR") {
            self.data_dir = v;
        }
        if let Ok(v) = std::env::var("SANDKASTEN_DB_PATH") {
            self.db_path = v;
        }
        if let Ok(v) = std::env::var("SANDKASTEN_SESSION_TTL_SECONDS") {
            if let Ok(parsed) = v.parse() {
                self.session_ttl_seconds = parsed;
            }
        }
        if let Ok(v) = std::env::var("SANDKASTEN_DEFAULT_IMAGE") {
            self.default_image = v;
        }
    }

    fn validate(&self) -> Result<()> {
        if self.session_ttl_seconds == 0 {
            return Err(SandkastenError::Internal(
                "session_ttl_seconds must be > 0".into(),
            ));
        }
        for image in &self.allowed_images {
            if !crate::manager::is_valid_image_name(image) {
                return Err(SandkastenError::Internal(format!(
                    "allowed_images entry '{image}' fails the image name pattern"
                )));
            }
        }
        Ok(())
    }

    pub fn images_dir(&self) -> std::path::PathBuf {
        std::path::Path::new(&self.data_dir).join("images")
    }

    pub fn layers_dir(&self) -> std::path::PathBuf {
        std::path::Path::new(&self.data_dir).join("layers")
    }

    pub fn workspaces_dir(&self) -> std::path::PathBuf {
        std::path::Path::new(&self.data_dir).join("workspaces")
    }

    pub fn sessions_dir(&self) -> std::path::PathBuf {
        std::path::Path::new(&self.data_dir).join("sessions")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let config = Config::default();
        assert_eq!(config.session_ttl_seconds, 1800);
        assert_eq!(config.defaults.max_exec_timeout_ms, 120_000);
    }

    #[test]
    fn yaml_round_trips_through_defaults() {
        let yaml = "listen: \"127.0.0.1:9000\"\napi_key: sk-it\n";
        let config: Config = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.listen, "127.0.0.1:9000");
        assert_eq!(config.api_key, "sk-it");
        assert_eq!(config.default_image, "base");
    }

    #[test]
    fn rejects_zero_ttl() {
        let mut config = Config::default();
        config.session_ttl_seconds = 0;
        assert!(config.validate().is_err());
    }
}
