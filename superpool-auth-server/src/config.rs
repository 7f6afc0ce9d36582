//! Server configuration.
//!
//! Loaded from a TOML file whose string values may reference environment
//! variables as `$VAR` or `${VAR}`.
//!
//! # Example Configuration
//!
//! ```toml
//! host = "0.0.0.0"
//! port = 8080
//! nonce_ttl_secs = 600
//! token_ttl_secs = 3600
//! purge_interval_secs = 60
//! safe_versions = ["1.3.0", "1.4.1"]
//!
//! [chains.137]
//! rpc_url = "$POLYGON_RPC_URL"
//! ```
//!
//! # Environment Variables
//!
//! - `CONFIG` - Path to configuration file (default: `config.toml`)
//! - `HOST` - Override server bind address
//! - `PORT` - Override server port
//! - RPC URLs referenced by `$VAR` in the config file

use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr};
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use superpool_auth_evm::RpcSafeSource;
use superpool_auth_evm::safe::SUPPORTED_SAFE_VERSIONS;
use url::Url;

/// Failure loading the configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// The file exists but could not be read.
    #[error("failed to read config file {path}: {source}")]
    Read {
        /// Path that was read.
        path: String,
        /// The underlying I/O error.
        #[source]
        source: std::io::Error,
    },
    /// The file is not valid TOML for [`ServerConfig`].
    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),
    /// A chain key is not a decimal chain id.
    #[error("invalid chain id {0:?}")]
    InvalidChain(String),
    /// An RPC URL does not parse.
    #[error("invalid RPC URL for chain {chain}: {source}")]
    InvalidRpcUrl {
        /// Chain the URL was configured for.
        chain: u64,
        /// The underlying parse error.
        #[source]
        source: url::ParseError,
    },
}

/// Top-level server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Bind address (default: `0.0.0.0`).
    #[serde(default = "default_host")]
    pub host: IpAddr,

    /// Port (default: `8080`).
    #[serde(default = "default_port")]
    pub port: u16,

    /// Lifetime of an issued challenge in seconds (default: 600).
    #[serde(default = "default_nonce_ttl_secs")]
    pub nonce_ttl_secs: u64,

    /// Lifetime of an unredeemed session token in seconds (default: 3600).
    #[serde(default = "default_token_ttl_secs")]
    pub token_ttl_secs: u64,

    /// How often expired challenges and tokens are dropped, in seconds
    /// (default: 60).
    #[serde(default = "default_purge_interval_secs")]
    pub purge_interval_secs: u64,

    /// Safe singleton versions accepted for EIP-1271 verification.
    #[serde(default = "default_safe_versions")]
    pub safe_versions: Vec<String>,

    /// RPC endpoints keyed by decimal chain id.
    #[serde(default)]
    pub chains: HashMap<String, ChainConfig>,
}

/// Per-chain settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChainConfig {
    /// HTTP JSON-RPC endpoint used for Safe contract reads.
    pub rpc_url: String,
}

const fn default_host() -> IpAddr {
    IpAddr::V4(Ipv4Addr::UNSPECIFIED)
}

const fn default_port() -> u16 {
    8080
}

const fn default_nonce_ttl_secs() -> u64 {
    600
}

const fn default_token_ttl_secs() -> u64 {
    3_600
}

const fn default_purge_interval_secs() -> u64 {
    60
}

fn default_safe_versions() -> Vec<String> {
    SUPPORTED_SAFE_VERSIONS.iter().map(|v| (*v).to_owned()).collect()
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            nonce_ttl_secs: default_nonce_ttl_secs(),
            token_ttl_secs: default_token_ttl_secs(),
            purge_interval_secs: default_purge_interval_secs(),
            safe_versions: default_safe_versions(),
            chains: HashMap::new(),
        }
    }
}

impl ServerConfig {
    /// Loads from the path in `CONFIG`, falling back to `config.toml`.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if the file cannot be read or parsed.
    pub fn load() -> Result<Self, ConfigError> {
        let path = std::env::var("CONFIG").unwrap_or_else(|_| "config.toml".to_owned());
        Self::load_from(&path)
    }

    /// Loads from `path`. A missing file yields the defaults.
    ///
    /// Environment references are expanded before parsing; `HOST` and `PORT`
    /// override the file.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if the file cannot be read or parsed.
    pub fn load_from(path: &str) -> Result<Self, ConfigError> {
        let content = if Path::new(path).exists() {
            std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
                path: path.to_owned(),
                source,
            })?
        } else {
            tracing::info!(path, "Config file not found, using defaults");
            String::new()
        };

        let mut config = Self::parse(&content)?;

        if let Some(host) = std::env::var("HOST").ok().and_then(|h| h.parse().ok()) {
            config.host = host;
        }
        if let Some(port) = std::env::var("PORT").ok().and_then(|p| p.parse().ok()) {
            config.port = port;
        }
        Ok(config)
    }

    /// Parses TOML after expanding environment references.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Parse`] for invalid TOML.
    pub fn parse(content: &str) -> Result<Self, ConfigError> {
        let expanded = expand_env_vars(content, |name| std::env::var(name).ok());
        Ok(toml::from_str(&expanded)?)
    }

    /// Challenge lifetime.
    #[must_use]
    pub const fn nonce_ttl(&self) -> Duration {
        Duration::from_secs(self.nonce_ttl_secs)
    }

    /// Session token lifetime.
    #[must_use]
    pub const fn token_ttl(&self) -> Duration {
        Duration::from_secs(self.token_ttl_secs)
    }

    /// Interval between expiry sweeps.
    #[must_use]
    pub const fn purge_interval(&self) -> Duration {
        Duration::from_secs(self.purge_interval_secs)
    }

    /// Builds the per-chain providers used for Safe verification.
    ///
    /// Chains whose URL still contains an unresolved `$` reference are
    /// skipped with a warning.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] for a malformed chain id or URL.
    pub fn safe_source(&self) -> Result<RpcSafeSource, ConfigError> {
        let mut source = RpcSafeSource::new();
        for (key, chain) in &self.chains {
            let chain_id: u64 = key
                .parse()
                .map_err(|_| ConfigError::InvalidChain(key.clone()))?;
            let rpc_url = chain.rpc_url.trim();
            if rpc_url.is_empty() || rpc_url.contains('$') {
                tracing::warn!(
                    chain_id,
                    "Skipping chain: rpc_url not resolved (missing env var?)"
                );
                continue;
            }
            let url = Url::parse(rpc_url).map_err(|source| ConfigError::InvalidRpcUrl {
                chain: chain_id,
                source,
            })?;
            source.insert(chain_id, url);
        }
        Ok(source)
    }
}

/// Replaces `$NAME` and `${NAME}` with `lookup(NAME)`.
///
/// References that do not resolve are kept verbatim.
fn expand_env_vars(input: &str, lookup: impl Fn(&str) -> Option<String>) -> String {
    let mut out = String::with_capacity(input.len());
    let mut rest = input;
    while let Some(pos) = rest.find('$') {
        out.push_str(&rest[..pos]);
        let after = &rest[pos + 1..];
        let (name, reference_len) = if let Some(braced) = after.strip_prefix('{') {
            match braced.find('}') {
                Some(end) => (&braced[..end], end + 2),
                None => ("", 0),
            }
        } else {
            let end = after
                .find(|c: char| !(c.is_ascii_alphanumeric() || c == '_'))
                .unwrap_or(after.len());
            (&after[..end], end)
        };

        match (name.is_empty(), lookup(name)) {
            (false, Some(value)) => out.push_str(&value),
            _ => out.push_str(&rest[pos..=pos + reference_len]),
        }
        rest = &after[reference_len..];
    }
    out.push_str(rest);
    out
}
