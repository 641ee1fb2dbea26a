//! Application configuration management.
//!
//! Configuration is loaded from a YAML file with environment variable
//! overrides. The configuration file path defaults to `config.yaml` but can
//! be specified via `-f` flag or `VERTEXLB_CONFIG` environment variable.
//!
//! ## Loading Priority
//!
//! Sources are merged in order (later sources override earlier ones):
//!
//! 1. **YAML config file** - Base configuration (default: `config.yaml`)
//! 2. **Environment variables** - Variables prefixed with `VERTEXLB_`
//! 3. **DATABASE_URL** - Special case: overrides `database.url` if set
//!
//! For nested values, use double underscores: `VERTEXLB_DATABASE__URL=...`.
//!
//! ## Example
//!
//! ```yaml
//! host: 0.0.0.0
//! port: 7070
//! master_key: sk-master-secret
//! database:
//!   url: "sqlite:vertexlb.db?mode=rwc"
//! targets:
//!   - name: primary
//!     project_id: my-project
//!     location: us-central1
//!     service_account_key_json: '{"client_email": "...", "private_key": "..."}'
//!     daily_rate_limit: 1500
//! ```
//!
//! Targets listed here are upserted on startup through the same
//! add-or-reactivate path the admin surface uses; removing one from the file
//! does not delete it from the pool.

use clap::Parser;
use figment::{
    Figment,
    providers::{Env, Format, Yaml},
};
use serde::{Deserialize, Serialize};
use url::Url;

use crate::db::models::targets::TargetUpsert;

/// Simple CLI args - just for specifying the config file
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Args {
    /// Path to configuration file
    #[arg(short = 'f', long, env = "VERTEXLB_CONFIG", default_value = "config.yaml")]
    pub config: String,

    /// Validate configuration and exit without starting the server.
    #[arg(long)]
    pub validate: bool,
}

/// Main application configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    /// HTTP server host to bind to (e.g., "0.0.0.0" for all interfaces)
    pub host: String,
    /// HTTP server port to bind to
    pub port: u16,
    /// Database configuration
    pub database: DatabaseConfig,
    /// Shared master credential; when set, requests must carry
    /// `Authorization: Bearer <master_key>`. Absent means open access.
    pub master_key: Option<String>,
    /// Override for the Vertex AI base URL. Normally unset, in which case the
    /// per-target regional endpoint is used. Points at a mock in tests.
    pub vertex_base_url: Option<Url>,
    /// Upstream request timeout in seconds
    pub request_timeout_secs: u64,
    /// Targets upserted into the pool on startup
    pub targets: Vec<TargetUpsert>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 7070,
            database: DatabaseConfig::default(),
            master_key: None,
            vertex_base_url: None,
            request_timeout_secs: 600,
            targets: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct DatabaseConfig {
    /// SQLite connection URL
    pub url: String,
    /// Maximum number of connections in the pool
    pub max_connections: u32,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: "sqlite:vertexlb.db?mode=rwc".to_string(),
            max_connections: 5,
        }
    }
}

impl Config {
    /// Load configuration from the YAML file named by `args`, then apply
    /// `VERTEXLB_`-prefixed environment overrides and the `DATABASE_URL`
    /// special case.
    pub fn load(args: &Args) -> anyhow::Result<Self> {
        let mut config: Config = Figment::new()
            .merge(Yaml::file(&args.config))
            .merge(Env::prefixed("VERTEXLB_").split("__"))
            .extract()?;

        if let Ok(database_url) = std::env::var("DATABASE_URL") {
            config.database.url = database_url;
        }

        Ok(config)
    }

    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use figment::Jail;

    #[test]
    fn defaults_stand_alone() {
        let config = Config::default();
        assert_eq!(config.bind_address(), "0.0.0.0:7070");
        assert!(config.master_key.is_none());
        assert!(config.targets.is_empty());
    }

    #[test]
    fn yaml_file_and_env_overrides_merge() {
        Jail::expect_with(|jail| {
            jail.create_file(
                "config.yaml",
                r#"
port: 9000
master_key: sk-test
targets:
  - project_id: proj-a
    location: us-central1
    service_account_key_json: "{}"
    daily_rate_limit: 100
"#,
            )?;
            jail.set_env("VERTEXLB_PORT", "9001");
            jail.set_env("VERTEXLB_DATABASE__MAX_CONNECTIONS", "2");

            let args = Args {
                config: "config.yaml".to_string(),
                validate: false,
            };
            let config = Config::load(&args).expect("config should load");

            assert_eq!(config.port, 9001);
            assert_eq!(config.master_key.as_deref(), Some("sk-test"));
            assert_eq!(config.database.max_connections, 2);
            assert_eq!(config.targets.len(), 1);
            assert_eq!(config.targets[0].project_id, "proj-a");
            assert_eq!(config.targets[0].daily_rate_limit, Some(100));
            Ok(())
        });
    }

    #[test]
    fn database_url_env_wins() {
        Jail::expect_with(|jail| {
            jail.create_file("config.yaml", "port: 9000\n")?;
            jail.set_env("DATABASE_URL", "sqlite::memory:");

            let args = Args {
                config: "config.yaml".to_string(),
                validate: false,
            };
            let config = Config::load(&args).expect("config should load");
            assert_eq!(config.database.url, "sqlite::memory:");
            Ok(())
        });
    }
}
