use std::path::Path;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::Deserialize;

/// Top-level configuration for the netspectra engine.
#[derive(Debug, Deserialize)]
pub struct Config {
    /// Logging verbosity (debug, info, warn, error). Default: "info".
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Aggregation engine configuration.
    pub aggregator: AggregatorConfig,

    /// Rule-based alerting configuration.
    #[serde(default)]
    pub alerter: AlerterConfig,

    /// SMTP settings for the email notifier.
    #[serde(default)]
    pub smtp: SmtpConfig,

    /// Prometheus health metrics server configuration.
    #[serde(default)]
    pub health: HealthConfig,
}

/// Aggregation engine configuration.
#[derive(Debug, Deserialize)]
pub struct AggregatorConfig {
    /// Aggregator kinds to instantiate ("exact", "sketch").
    pub types: Vec<String>,

    /// Global measurement period: every task resets on this cadence.
    /// Default: 5m.
    #[serde(default = "default_period", with = "humantime_serde")]
    pub period: Duration,

    /// Number of packet-processing workers. Default: 4.
    #[serde(default = "default_num_workers")]
    pub num_workers: usize,

    /// Capacity of the bounded packet inbox. Default: 65536.
    #[serde(default = "default_packet_channel_size")]
    pub size_of_packet_channel: usize,

    /// Exact aggregator group.
    #[serde(default)]
    pub exact: GroupConfig<ExactTaskDef>,

    /// Sketch aggregator group.
    #[serde(default)]
    pub sketch: GroupConfig<SketchTaskDef>,
}

/// One aggregator group: its tasks and the writers that persist them.
#[derive(Debug, Deserialize)]
pub struct GroupConfig<T> {
    #[serde(default)]
    pub writers: Vec<WriterDef>,

    #[serde(default)]
    pub tasks: Vec<T>,
}

impl<T> Default for GroupConfig<T> {
    fn default() -> Self {
        Self {
            writers: Vec::new(),
            tasks: Vec::new(),
        }
    }
}

/// Declarative writer definition.
#[derive(Debug, Clone, Deserialize)]
pub struct WriterDef {
    /// Writer kind: "clickhouse", "binary", or "text".
    #[serde(rename = "type")]
    pub kind: String,

    /// Disabled writers are skipped at group construction.
    #[serde(default)]
    pub enabled: bool,

    /// Cadence at which this writer snapshots its tasks. Default: 30s.
    #[serde(default = "default_snapshot_interval", with = "humantime_serde")]
    pub snapshot_interval: Duration,

    /// ClickHouse connection settings (clickhouse writers).
    #[serde(default)]
    pub clickhouse: ClickHouseConfig,

    /// Root directory for file writers (binary, text).
    #[serde(default)]
    pub root_path: String,
}

/// ClickHouse connection configuration.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ClickHouseConfig {
    /// Native protocol address (host:port).
    #[serde(default)]
    pub endpoint: String,

    /// Target database name. Default: "default".
    #[serde(default = "default_database")]
    pub database: String,

    #[serde(default)]
    pub username: String,

    #[serde(default)]
    pub password: String,
}

/// Exact aggregation task definition.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ExactTaskDef {
    pub name: String,

    /// Shard count; 0 or values >= 32768 fall back to the default of 256.
    #[serde(default)]
    pub num_shards: u32,

    /// Ordered key fields drawn from SrcIP, DstIP, SrcPort, DstPort,
    /// Protocol.
    pub key_fields: Vec<String>,
}

/// Sketch aggregation task definition. Zero-valued sketch parameters take
/// the sketch's built-in defaults.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct SketchTaskDef {
    pub name: String,

    /// 0 = Count-Min, 1 = SuperSpreader.
    #[serde(default)]
    pub skt_type: u8,

    pub flow_fields: Vec<String>,

    #[serde(default)]
    pub element_fields: Vec<String>,

    #[serde(default)]
    pub width: u32,

    #[serde(default)]
    pub depth: u32,

    #[serde(default)]
    pub size_threshold: u32,

    #[serde(default)]
    pub count_threshold: u32,

    /// HLL register count (SuperSpreader).
    #[serde(default)]
    pub m: u32,

    /// HLL register bit width (SuperSpreader).
    #[serde(default)]
    pub size: u32,

    /// Geometric base of the HLL sampler (SuperSpreader).
    #[serde(default)]
    pub base: f64,

    /// Rejection base for replacement-slot decrements (SuperSpreader).
    #[serde(default)]
    pub b: f64,
}

/// Rule-based alerting configuration.
#[derive(Debug, Default, Deserialize)]
pub struct AlerterConfig {
    #[serde(default)]
    pub enabled: bool,

    /// Evaluation cadence. Default: 1m.
    #[serde(default = "default_check_interval", with = "humantime_serde")]
    pub check_interval: Duration,

    #[serde(default)]
    pub rules: Vec<AlerterRule>,
}

/// One threshold rule evaluated against a task's live aggregates.
#[derive(Debug, Clone, Deserialize)]
pub struct AlerterRule {
    pub name: String,
    pub task_name: String,
    /// total_packets, total_bytes, total_flows, heavy_hitter_count,
    /// heavy_hitter_size, or super_spreader_spread.
    pub metric: String,
    /// One of >, <, =, >=, <=.
    pub operator: String,
    pub threshold: f64,
}

/// SMTP settings for the email notifier.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct SmtpConfig {
    #[serde(default)]
    pub host: String,

    #[serde(default = "default_smtp_port")]
    pub port: u16,

    #[serde(default)]
    pub username: String,

    #[serde(default)]
    pub password: String,

    #[serde(default)]
    pub from: String,

    /// Comma-separated recipient list.
    #[serde(default)]
    pub to: String,
}

/// Prometheus health metrics server configuration.
#[derive(Debug, Deserialize)]
pub struct HealthConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Listen address. Default: ":9090".
    #[serde(default = "default_health_addr")]
    pub addr: String,
}

// --- Default value functions ---

fn default_log_level() -> String {
    "info".to_string()
}

fn default_period() -> Duration {
    Duration::from_secs(300)
}

fn default_num_workers() -> usize {
    4
}

fn default_packet_channel_size() -> usize {
    65536
}

fn default_snapshot_interval() -> Duration {
    Duration::from_secs(30)
}

fn default_database() -> String {
    "default".to_string()
}

fn default_check_interval() -> Duration {
    Duration::from_secs(60)
}

fn default_smtp_port() -> u16 {
    587
}

fn default_true() -> bool {
    true
}

fn default_health_addr() -> String {
    ":9090".to_string()
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            addr: default_health_addr(),
        }
    }
}

impl SmtpConfig {
    /// Whether enough is configured to build an email notifier.
    pub fn is_configured(&self) -> bool {
        !self.host.is_empty()
    }
}

// --- Validation and loading ---

impl Config {
    /// Load configuration from a YAML file.
    pub fn load(path: &Path) -> Result<Self> {
        let data = std::fs::read_to_string(path)
            .with_context(|| format!("reading config file {}", path.display()))?;

        let cfg: Config = serde_yaml::from_str(&data)
            .with_context(|| format!("parsing config file {}", path.display()))?;

        cfg.validate()?;

        Ok(cfg)
    }

    /// Validate required fields and consistency. Configuration problems are
    /// fatal at start.
    pub fn validate(&self) -> Result<()> {
        if self.aggregator.types.is_empty() {
            bail!("aggregator.types must name at least one aggregator kind");
        }

        if self.aggregator.period.is_zero() {
            bail!("aggregator.period must be a positive duration");
        }

        if self.aggregator.num_workers == 0 {
            bail!("aggregator.num_workers must be positive");
        }

        if self.aggregator.size_of_packet_channel == 0 {
            bail!("aggregator.size_of_packet_channel must be positive");
        }

        if self.alerter.enabled && self.alerter.check_interval.is_zero() {
            bail!("alerter.check_interval must be a positive duration");
        }

        for rule in &self.alerter.rules {
            if rule.name.is_empty() || rule.task_name.is_empty() {
                bail!("alerter rules require a name and a task_name");
            }
        }

        Ok(())
    }
}
