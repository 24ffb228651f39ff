use anyhow::{Context, Result, anyhow};
use clap::{Parser, ValueEnum};
use std::env::{self, VarError};

use crate::state::MAX_LIST_LIMIT;

/// Which object store backs the gateway.
#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
pub enum Backend {
    /// SQLite metadata plus payload files on local disk.
    Disk,
    /// Process memory; contents are lost on exit.
    Memory,
}

/// Centralized application configuration.
/// Combines environment variables and CLI arguments.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppConfig {
    pub host: String,
    pub port: u16,
    pub backend: Backend,
    pub storage_dir: String,
    pub database_url: String,
    pub public_origin: Option<String>,
    pub list_limit: usize,
}

/// Command-line + environment configuration.
#[derive(Parser, Debug)]
#[command(author, version, about = "HTTP gateway for uploading, listing and serving objects")]
pub struct Args {
    /// Host to bind to (overrides GATEWAY_HOST)
    #[arg(long)]
    pub host: Option<String>,

    /// Port to bind to (overrides GATEWAY_PORT)
    #[arg(long)]
    pub port: Option<u16>,

    /// Object store backend (overrides GATEWAY_BACKEND)
    #[arg(long, value_enum)]
    pub backend: Option<Backend>,

    /// Directory where payloads are stored (overrides GATEWAY_STORAGE_DIR)
    #[arg(long)]
    pub storage_dir: Option<String>,

    /// Metadata database URL (overrides GATEWAY_DATABASE_URL)
    #[arg(long)]
    pub database_url: Option<String>,

    /// Origin used in returned file URLs, e.g. https://files.example.com
    /// (overrides GATEWAY_PUBLIC_ORIGIN)
    #[arg(long)]
    pub public_origin: Option<String>,

    /// Maximum entries returned by GET /files (overrides GATEWAY_LIST_LIMIT)
    #[arg(long)]
    pub list_limit: Option<usize>,

    /// Apply the metadata schema and exit
    #[arg(long)]
    pub migrate: bool,
}

impl AppConfig {
    /// Parse environment variables + CLI args into AppConfig and migrate flag.
    pub fn from_env_and_args() -> Result<(Self, bool)> {
        Self::resolve(Args::parse(), |name| env::var(name))
    }

    /// Merge `args` over values read through `lookup`. CLI wins, then the
    /// environment, then defaults.
    pub fn resolve(
        args: Args,
        lookup: impl Fn(&str) -> Result<String, VarError>,
    ) -> Result<(Self, bool)> {
        let var = |name: &str| -> Result<Option<String>> {
            match lookup(name) {
                Ok(value) => Ok(Some(value)),
                Err(VarError::NotPresent) => Ok(None),
                Err(err) => Err(err).with_context(|| format!("reading {name}")),
            }
        };

        // --- Environment fallback ---
        let env_host = var("GATEWAY_HOST")?.unwrap_or_else(|| "0.0.0.0".into());
        let env_port = match var("GATEWAY_PORT")? {
            Some(value) => value
                .parse::<u16>()
                .with_context(|| format!("parsing GATEWAY_PORT value `{}`", value))?,
            None => 8787,
        };
        let env_backend = match var("GATEWAY_BACKEND")? {
            Some(value) => Backend::from_str(&value, true)
                .map_err(|err| anyhow!("parsing GATEWAY_BACKEND value `{}`: {}", value, err))?,
            None => Backend::Disk,
        };
        let env_storage = var("GATEWAY_STORAGE_DIR")?.unwrap_or_else(|| "./data/objects".into());
        let env_db = var("GATEWAY_DATABASE_URL")?
            .unwrap_or_else(|| "sqlite://./data/meta/gateway.db".into());
        let env_origin = var("GATEWAY_PUBLIC_ORIGIN")?;
        let env_limit = match var("GATEWAY_LIST_LIMIT")? {
            Some(value) => value
                .parse::<usize>()
                .with_context(|| format!("parsing GATEWAY_LIST_LIMIT value `{}`", value))?,
            None => MAX_LIST_LIMIT,
        };

        // --- Merge ---
        let cfg = Self {
            host: args.host.unwrap_or(env_host),
            port: args.port.unwrap_or(env_port),
            backend: args.backend.unwrap_or(env_backend),
            storage_dir: args.storage_dir.unwrap_or(env_storage),
            database_url: args.database_url.unwrap_or(env_db),
            public_origin: args.public_origin.or(env_origin).filter(|o| !o.is_empty()),
            list_limit: args.list_limit.unwrap_or(env_limit).clamp(1, MAX_LIST_LIMIT),
        };

        Ok((cfg, args.migrate))
    }

    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn env_of(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Result<String, VarError> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |name: &str| map.get(name).cloned().ok_or(VarError::NotPresent)
    }

    fn args(cli: &[&str]) -> Args {
        Args::try_parse_from(std::iter::once("object-gateway").chain(cli.iter().copied())).unwrap()
    }

    #[test]
    fn defaults_apply_without_env_or_flags() {
        let (cfg, migrate) = AppConfig::resolve(args(&[]), env_of(&[])).unwrap();
        assert!(!migrate);
        assert_eq!(cfg.addr(), "0.0.0.0:8787");
        assert_eq!(cfg.backend, Backend::Disk);
        assert_eq!(cfg.list_limit, 1000);
        assert_eq!(cfg.public_origin, None);
    }

    #[test]
    fn cli_overrides_environment() {
        let env = env_of(&[
            ("GATEWAY_PORT", "9000"),
            ("GATEWAY_BACKEND", "memory"),
            ("GATEWAY_PUBLIC_ORIGIN", "https://env.example.com"),
        ]);
        let (cfg, migrate) = AppConfig::resolve(
            args(&["--port", "9100", "--public-origin", "https://cli.example.com", "--migrate"]),
            env,
        )
        .unwrap();

        assert!(migrate);
        assert_eq!(cfg.port, 9100);
        assert_eq!(cfg.backend, Backend::Memory);
        assert_eq!(cfg.public_origin.as_deref(), Some("https://cli.example.com"));
    }

    #[test]
    fn list_limit_is_clamped_to_one_page() {
        let env = env_of(&[("GATEWAY_LIST_LIMIT", "5000")]);
        let (cfg, _) = AppConfig::resolve(args(&[]), env).unwrap();
        assert_eq!(cfg.list_limit, 1000);

        let (cfg, _) = AppConfig::resolve(args(&["--list-limit", "0"]), env_of(&[])).unwrap();
        assert_eq!(cfg.list_limit, 1);
    }

    #[test]
    fn malformed_environment_is_an_error() {
        assert!(AppConfig::resolve(args(&[]), env_of(&[("GATEWAY_PORT", "http")])).is_err());
        assert!(AppConfig::resolve(args(&[]), env_of(&[("GATEWAY_BACKEND", "s3")])).is_err());
    }
}
