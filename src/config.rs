//! Configuration parsing and validation for the router server
//!
//! Command-line arguments (with environment fallbacks) are parsed with clap. Provider definitions
//! live in a separate JSON file named by `--providers`.
use anyhow::anyhow;
use clap::Parser;
use std::path::PathBuf;

#[derive(Debug, Clone, Parser)]
#[command(version, about, long_about = None)]
pub struct Config {
    /// The port on which the router will listen.
    #[arg(short = 'p', long, env = "SWITCHYARD_PORT", default_value_t = 3000)]
    pub port: u16,

    /// The port on which the metrics server will listen.
    #[arg(long, default_value_t = 9090)]
    pub metrics_port: u16,

    /// Whether to enable the metrics endpoint.
    #[arg(short = 'm', long, default_value_t = true)]
    pub metrics: bool,

    /// The prefix to use for metrics.
    #[arg(long, default_value = "switchyard")]
    pub metrics_prefix: String,

    /// The JSON file listing providers and router settings.
    #[arg(short = 'f', long, env = "SWITCHYARD_PROVIDERS")]
    pub providers: PathBuf,

    /// Where provider health is persisted between restarts.
    #[arg(long, env = "SWITCHYARD_STATE", default_value = "data/provider-state.json")]
    pub state_file: PathBuf,

    /// Bearer key required on /admin endpoints. Without one they are open.
    #[arg(long, env = "SWITCHYARD_ADMIN_KEY", hide_env_values = true)]
    pub admin_key: Option<String>,

    /// Per-request timeout for provider calls, in seconds.
    #[arg(long, default_value_t = 60)]
    pub request_timeout_secs: u64,

    /// How often stale errors and expired disablements are swept, in seconds.
    #[arg(long, default_value_t = 600)]
    pub sweep_interval_secs: u64,

    /// Maximum number of idle HTTP connections to keep alive per provider host.
    #[arg(long, default_value_t = 100)]
    pub pool_max_idle_per_host: usize,

    /// How long (in seconds) to keep idle HTTP connections alive.
    #[arg(long, default_value_t = 90)]
    pub pool_idle_timeout_secs: u64,
}

impl Config {
    pub fn validate(self) -> Result<Self, anyhow::Error> {
        if !self.providers.exists() {
            return Err(anyhow!(
                "Config file '{}' does not exist",
                self.providers.display()
            ));
        }
        if self.request_timeout_secs == 0 {
            return Err(anyhow!("--request-timeout-secs must be greater than zero"));
        }
        if self.sweep_interval_secs == 0 {
            return Err(anyhow!("--sweep-interval-secs must be greater than zero"));
        }
        if self.metrics && self.metrics_port == self.port {
            return Err(anyhow!(
                "Metrics port {} clashes with the router port",
                self.metrics_port
            ));
        }
        Ok(self)
    }
}
