use crate::types::McpServersFile;
use anyhow::{Context, Result};
use std::path::PathBuf;

/// Process-wide gateway configuration, loaded once at startup from CLI
/// flags and never mutated afterwards (see design note on global mutable
/// state).
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    pub bearer_token: String,
    pub config_dir: PathBuf,
    pub base_port: u16,
    pub default_retry_max: u32,
    pub session_gc_interval_secs: u64,
    pub session_idle_timeout_secs: u64,
    pub bind_addr: String,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            bearer_token: "123456".to_string(),
            config_dir: PathBuf::from("./"),
            base_port: 10000,
            default_retry_max: 3,
            session_gc_interval_secs: 300,
            session_idle_timeout_secs: 1800,
            bind_addr: "127.0.0.1:8080".to_string(),
        }
    }
}

impl GatewayConfig {
    /// Parse `--bind`, `--config-dir`, `--bearer-token`, `--base-port` from
    /// argv. Unknown flags are a startup error, following the teacher's
    /// `parse_args` contract of failing loudly rather than ignoring typos.
    pub fn parse_args<I: IntoIterator<Item = String>>(args: I) -> Result<Self, String> {
        let mut cfg = Self::default();
        let mut iter = args.into_iter();

        while let Some(arg) = iter.next() {
            match arg.as_str() {
                "--bind" => {
                    cfg.bind_addr = iter.next().ok_or("--bind requires a value")?;
                }
                "--config-dir" => {
                    cfg.config_dir = PathBuf::from(iter.next().ok_or("--config-dir requires a value")?);
                }
                "--bearer-token" => {
                    cfg.bearer_token = iter.next().ok_or("--bearer-token requires a value")?;
                }
                "--base-port" => {
                    let raw = iter.next().ok_or("--base-port requires a value")?;
                    cfg.base_port = raw
                        .parse()
                        .map_err(|_| format!("--base-port: invalid port '{}'", raw))?;
                }
                other => {
                    return Err(format!("unknown flag: {}", other));
                }
            }
        }

        Ok(cfg)
    }

    pub fn config_path(&self) -> PathBuf {
        self.config_dir.join("mcp_servers.json")
    }
}

/// Loads and saves the `mcp_servers.json` service map.
pub struct ConfigManager {
    config_path: PathBuf,
}

impl ConfigManager {
    pub fn new(config_path: PathBuf) -> Self {
        Self { config_path }
    }

    /// Load the service map from disk, returning an empty map if the file
    /// doesn't exist yet.
    pub fn load(&self) -> Result<McpServersFile> {
        if !self.config_path.exists() {
            tracing::info!("config file not found at {:?}, starting empty", self.config_path);
            return Ok(McpServersFile::default());
        }

        let data = std::fs::read_to_string(&self.config_path)
            .context("failed to read config file")?;

        let file: McpServersFile =
            serde_json::from_str(&data).context("failed to parse config file")?;

        tracing::info!(
            "loaded {} service(s) from {:?}",
            file.mcp_servers.len(),
            self.config_path
        );

        Ok(file)
    }

    pub fn save(&self, file: &McpServersFile) -> Result<()> {
        if let Some(parent) = self.config_path.parent() {
            std::fs::create_dir_all(parent).context("failed to create config directory")?;
        }

        let data = serde_json::to_string_pretty(file).context("failed to serialize config")?;
        std::fs::write(&self.config_path, data).context("failed to write config file")?;

        tracing::info!("saved config to {:?}", self.config_path);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn parse_args_defaults() {
        let cfg = GatewayConfig::parse_args(Vec::<String>::new()).unwrap();
        assert_eq!(cfg.bind_addr, "127.0.0.1:8080");
        assert_eq!(cfg.base_port, 10000);
        assert_eq!(cfg.bearer_token, "123456");
    }

    #[test]
    fn parse_args_overrides() {
        let args = vec![
            "--bind".to_string(),
            "0.0.0.0:9000".to_string(),
            "--base-port".to_string(),
            "20000".to_string(),
        ];
        let cfg = GatewayConfig::parse_args(args).unwrap();
        assert_eq!(cfg.bind_addr, "0.0.0.0:9000");
        assert_eq!(cfg.base_port, 20000);
    }

    #[test]
    fn parse_args_rejects_unknown_flag() {
        let args = vec!["--nope".to_string()];
        assert!(GatewayConfig::parse_args(args).is_err());
    }

    #[test]
    fn config_manager_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("mcp_servers.json");
        let mgr = ConfigManager::new(path);

        let loaded = mgr.load().unwrap();
        assert!(loaded.mcp_servers.is_empty());

        let mut servers = HashMap::new();
        servers.insert(
            "demo".to_string(),
            crate::types::ServiceSpec {
                name: "demo".to_string(),
                workspace: None,
                url: Some("http://localhost:1234/sse".to_string()),
                command: None,
                args: Vec::new(),
                env: HashMap::new(),
                path: None,
                level: None,
                retry_max: None,
            },
        );
        let file = McpServersFile { mcp_servers: servers };
        mgr.save(&file).unwrap();

        let reloaded = mgr.load().unwrap();
        assert_eq!(reloaded.mcp_servers.len(), 1);
        assert!(reloaded.mcp_servers.contains_key("demo"));
    }
}
