use anyhow::{Context, Result};
use config::{Config, Environment, File as ConfigFile};
use metronome_time::config::DEFAULT_NAMESPACE;
use metronome_time::{ClientConfig, EstimatorConfig, ExchangeConfig, ReferenceConfig};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};

/// Application configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    // Network
    pub listen_addr: String,
    pub reference_addr: String,

    // Logging
    pub log_level: String,
    pub log_format: String,

    // Clock sync
    pub namespace: String,
    pub probe_peers: bool,
    /// Constant offset applied to this node's clock, for demonstrations
    pub clock_offset_secs: f64,
    pub exchange: ExchangeConfig,
    pub estimator: EstimatorConfig,

    #[serde(skip)]
    pub config_path: Option<PathBuf>,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            listen_addr: "127.0.0.1:7070".to_string(),
            reference_addr: "127.0.0.1:7070".to_string(),
            namespace: DEFAULT_NAMESPACE.to_string(),
            probe_peers: false,
            clock_offset_secs: 0.0,
            exchange: ExchangeConfig::default(),
            estimator: EstimatorConfig::default(),
            log_level: "info".to_string(),
            log_format: "pretty".to_string(),
            config_path: None,
        }
    }
}

impl AppConfig {
    /// Layer the optional TOML file, then `METRONOME_*` environment variables.
    pub fn load(config_path: Option<&Path>) -> Result<Self> {
        let mut builder = Config::builder();

        if let Some(path) = config_path {
            if !path.exists() {
                anyhow::bail!(
                    "Configuration file {} not found (specified via --config)",
                    path.display()
                );
            }
            builder = builder.add_source(ConfigFile::from(path));
        }

        builder = builder.add_source(
            Environment::with_prefix("METRONOME")
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true),
        );

        let mut config: AppConfig = builder
            .build()
            .context("failed to assemble configuration sources")?
            .try_deserialize()
            .context("failed to parse configuration")?;
        config.config_path = config_path.map(Path::to_path_buf);
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        self.listen_socket()?;
        self.reference_socket()?;
        if !matches!(self.log_format.as_str(), "pretty" | "json") {
            anyhow::bail!("LOG_FORMAT must be 'pretty' or 'json', got '{}'", self.log_format);
        }
        if !self.clock_offset_secs.is_finite() {
            anyhow::bail!("CLOCK_OFFSET_SECS must be finite");
        }
        self.client_config().validate()?;
        self.reference_config().validate()?;
        Ok(())
    }

    pub fn listen_socket(&self) -> Result<SocketAddr> {
        self.listen_addr
            .parse()
            .with_context(|| format!("invalid LISTEN_ADDR '{}'", self.listen_addr))
    }

    pub fn reference_socket(&self) -> Result<SocketAddr> {
        self.reference_addr
            .parse()
            .with_context(|| format!("invalid REFERENCE_ADDR '{}'", self.reference_addr))
    }

    pub fn client_config(&self) -> ClientConfig {
        ClientConfig {
            namespace: self.namespace.clone(),
            exchange: self.exchange.clone(),
            estimator: self.estimator.clone(),
        }
    }

    pub fn reference_config(&self) -> ReferenceConfig {
        ReferenceConfig {
            namespace: self.namespace.clone(),
            probe_peers: self.probe_peers,
            exchange: self.exchange.clone(),
            estimator: self.estimator.clone(),
        }
    }
}
