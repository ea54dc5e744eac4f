use serde::{Deserialize, Serialize};
use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::chunk::ReassemblerConfig;
use crate::reconnect::{BackoffConfig, MAX_DELAY};

const CONFIG_FILE: &str = "config.toml";
const ENV_PREFIX: &str = "SYNAPSE_";

/// Smallest outbound frame ceiling that still leaves room for a chunk envelope.
const MIN_OUTBOUND_FRAME_BYTES: usize = 4096;

#[derive(Debug, Clone, Deserialize, Serialize, Default)]
#[serde(default)]
pub struct Config {
    pub host: HostConfig,
    pub chunks: ChunksConfig,
    pub handshake: HandshakeConfig,
    pub reconnect: ReconnectConfig,
    pub safety: SafetyConfig,
    pub liveness: LivenessConfig,
    pub dispatch: DispatchConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct HostConfig {
    pub service_addr: String,
    pub max_inbound_message_bytes: usize,
    pub max_outbound_frame_bytes: usize,
    pub capabilities: Vec<String>,
    pub service_reconnect: ReconnectConfig,
}

impl Default for HostConfig {
    fn default() -> Self {
        Self {
            service_addr: "127.0.0.1:5678".to_string(),
            max_inbound_message_bytes: 50 * 1024 * 1024,
            max_outbound_frame_bytes: 1024 * 1024,
            capabilities: vec![
                "chunking".to_string(),
                "heartbeat".to_string(),
                "slave_mode".to_string(),
            ],
            service_reconnect: ReconnectConfig {
                max_attempts: 0,
                ..ReconnectConfig::default()
            },
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ChunksConfig {
    pub max_in_flight: usize,
    pub stale_after_ms: u64,
    pub strict_base64: bool,
}

impl Default for ChunksConfig {
    fn default() -> Self {
        Self {
            max_in_flight: 15,
            stale_after_ms: 120_000,
            strict_base64: false,
        }
    }
}

impl ChunksConfig {
    pub fn reassembler(&self, max_message_bytes: usize) -> ReassemblerConfig {
        ReassemblerConfig {
            max_in_flight: self.max_in_flight,
            stale_after: Duration::from_millis(self.stale_after_ms),
            max_message_bytes,
            strict_base64: self.strict_base64,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize, Default)]
#[serde(default)]
pub struct HandshakeConfig {
    pub confirm_grace_ms: u64,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ReconnectConfig {
    pub base_delay_ms: u64,
    pub growth: f64,
    pub exponent_cap: u32,
    /// 0 retries forever.
    pub max_attempts: u32,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            base_delay_ms: 1000,
            growth: 2.0,
            exponent_cap: 5,
            max_attempts: 10,
        }
    }
}

impl ReconnectConfig {
    pub fn backoff(&self) -> BackoffConfig {
        BackoffConfig {
            base_delay: Duration::from_millis(self.base_delay_ms),
            growth: self.growth,
            exponent_cap: self.exponent_cap,
            max_attempts: self.max_attempts,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct SafetyConfig {
    pub lock_timeout_ms: u64,
}

impl Default for SafetyConfig {
    fn default() -> Self {
        Self {
            lock_timeout_ms: 30_000,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct LivenessConfig {
    pub interval_ms: u64,
}

impl Default for LivenessConfig {
    fn default() -> Self {
        Self { interval_ms: 15_000 }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct DispatchConfig {
    pub wait_default_timeout_ms: u64,
    pub wait_max_timeout_ms: u64,
    pub wait_poll_interval_ms: u64,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            wait_default_timeout_ms: 10_000,
            wait_max_timeout_ms: 60_000,
            wait_poll_interval_ms: 100,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub dir: String,
    pub telemetry_refresh_secs: u64,
    pub filter: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            dir: default_logs_dir().to_string_lossy().into_owned(),
            telemetry_refresh_secs: 30,
            filter: "info".to_string(),
        }
    }
}

impl LoggingConfig {
    pub fn dir_path(&self) -> PathBuf {
        PathBuf::from(&self.dir)
    }
}

fn default_logs_dir() -> PathBuf {
    match env::var("LOCALAPPDATA") {
        Ok(local) if !local.trim().is_empty() => {
            Path::new(&local).join("Synapse").join("logs")
        }
        _ => env::temp_dir().join("synapse").join("logs"),
    }
}

impl Config {
    pub fn load() -> Result<Self, Box<dyn std::error::Error>> {
        let mut config = Self::default();
        let config_path = active_config_path();

        if let Ok(raw) = fs::read_to_string(&config_path) {
            config = toml::from_str::<Config>(&raw)?;
        }

        config.apply_env_overrides();

        config.validate()?;
        Ok(config)
    }

    fn apply_env_overrides(&mut self) {
        // Host
        if let Ok(val) = env::var(format!("{}SERVICE_ADDR", ENV_PREFIX)) {
            self.host.service_addr = val;
        }
        if let Ok(val) = env::var(format!("{}MAX_INBOUND_MESSAGE_BYTES", ENV_PREFIX)) {
            if let Ok(bytes) = val.parse() {
                self.host.max_inbound_message_bytes = bytes;
            }
        }
        if let Ok(val) = env::var(format!("{}MAX_OUTBOUND_FRAME_BYTES", ENV_PREFIX)) {
            if let Ok(bytes) = val.parse() {
                self.host.max_outbound_frame_bytes = bytes;
            }
        }

        // Chunks
        if let Ok(val) = env::var(format!("{}CHUNK_MAX_IN_FLIGHT", ENV_PREFIX)) {
            if let Ok(n) = val.parse() {
                self.chunks.max_in_flight = n;
            }
        }
        if let Ok(val) = env::var(format!("{}CHUNK_STALE_AFTER_MS", ENV_PREFIX)) {
            if let Ok(ms) = val.parse() {
                self.chunks.stale_after_ms = ms;
            }
        }
        if let Ok(val) = env::var(format!("{}STRICT_BASE64", ENV_PREFIX)) {
            self.chunks.strict_base64 = val.parse().unwrap_or(false);
        }

        // Handshake / reconnect
        if let Ok(val) = env::var(format!("{}CONFIRM_GRACE_MS", ENV_PREFIX)) {
            if let Ok(ms) = val.parse() {
                self.handshake.confirm_grace_ms = ms;
            }
        }
        if let Ok(val) = env::var(format!("{}RECONNECT_MAX_ATTEMPTS", ENV_PREFIX)) {
            if let Ok(n) = val.parse() {
                self.reconnect.max_attempts = n;
            }
        }

        // Safety lock
        if let Ok(val) = env::var(format!("{}LOCK_TIMEOUT_MS", ENV_PREFIX)) {
            if let Ok(ms) = val.parse() {
                self.safety.lock_timeout_ms = ms;
            }
        }

        // Liveness
        if let Ok(val) = env::var(format!("{}HEARTBEAT_INTERVAL_MS", ENV_PREFIX)) {
            if let Ok(ms) = val.parse() {
                self.liveness.interval_ms = ms;
            }
        }

        // Logging
        if let Ok(val) = env::var(format!("{}LOG_DIR", ENV_PREFIX)) {
            self.logging.dir = val;
        }
        if let Ok(val) = env::var(format!("{}LOG_FILTER", ENV_PREFIX)) {
            self.logging.filter = val;
        }
    }

    pub fn validate(&self) -> Result<(), Box<dyn std::error::Error>> {
        if self.host.service_addr.trim().is_empty() {
            return Err("host.service_addr must be set".into());
        }
        if self.host.max_outbound_frame_bytes < MIN_OUTBOUND_FRAME_BYTES {
            return Err(format!(
                "host.max_outbound_frame_bytes must be >= {MIN_OUTBOUND_FRAME_BYTES}"
            )
            .into());
        }
        if self.host.max_inbound_message_bytes < self.host.max_outbound_frame_bytes {
            return Err(
                "host.max_inbound_message_bytes must be >= host.max_outbound_frame_bytes".into(),
            );
        }
        if self.chunks.max_in_flight == 0 {
            return Err("chunks.max_in_flight must be non-zero".into());
        }
        if self.chunks.stale_after_ms == 0 {
            return Err("chunks.stale_after_ms must be non-zero".into());
        }
        for (name, reconnect) in [
            ("reconnect", &self.reconnect),
            ("host.service_reconnect", &self.host.service_reconnect),
        ] {
            if reconnect.base_delay_ms == 0 {
                return Err(format!("{name}.base_delay_ms must be non-zero").into());
            }
            if !(reconnect.growth.is_finite() && reconnect.growth >= 1.0) {
                return Err(format!("{name}.growth must be a finite value >= 1.0").into());
            }
            if reconnect.backoff().ceiling().is_none() {
                return Err(format!(
                    "{name}: base_delay_ms * growth^exponent_cap must not exceed {} s",
                    MAX_DELAY.as_secs()
                )
                .into());
            }
        }
        if self.safety.lock_timeout_ms == 0 {
            return Err("safety.lock_timeout_ms must be non-zero".into());
        }
        if self.liveness.interval_ms < 100 {
            return Err("liveness.interval_ms must be >= 100".into());
        }
        if self.dispatch.wait_poll_interval_ms == 0 {
            return Err("dispatch.wait_poll_interval_ms must be non-zero".into());
        }
        if self.dispatch.wait_default_timeout_ms > self.dispatch.wait_max_timeout_ms {
            return Err(
                "dispatch.wait_default_timeout_ms must not exceed dispatch.wait_max_timeout_ms"
                    .into(),
            );
        }
        if self.logging.dir.trim().is_empty() {
            return Err("logging.dir must be set".into());
        }
        Ok(())
    }

    pub fn write_default<P: AsRef<Path>>(path: P) -> Result<(), Box<dyn std::error::Error>> {
        if path.as_ref().exists() {
            return Err("config.toml already exists".into());
        }
        if let Some(parent) = path.as_ref().parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        let data = toml::to_string_pretty(&Config::default())?;
        fs::write(path, data)?;
        Ok(())
    }

    pub fn default_path() -> PathBuf {
        managed_config_path()
    }

    pub fn active_path() -> PathBuf {
        active_config_path()
    }
}

fn managed_config_path() -> PathBuf {
    if let Ok(path) = env::var(format!("{}CONFIG_PATH", ENV_PREFIX)) {
        return PathBuf::from(path);
    }
    let appdata = env::var("APPDATA")
        .or_else(|_| env::var("HOME").map(|home| format!("{home}/.config")))
        .unwrap_or_else(|_| ".".to_string());
    Path::new(&appdata).join("Synapse").join(CONFIG_FILE)
}

fn active_config_path() -> PathBuf {
    let local = PathBuf::from(CONFIG_FILE);
    if local.exists() {
        local
    } else {
        managed_config_path()
    }
}
