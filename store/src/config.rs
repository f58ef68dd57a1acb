use std::str::FromStr;

use serde::{Deserialize, Serialize};
use vram_common::size::ByteSize;

use crate::error::{Result, StoreError};

/// Device memory kept free when the export size is derived from the
/// device total.
pub const DEFAULT_SAFETY_RESERVE: ByteSize = ByteSize::mib(256);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    Cuda,
    Sim,
}

impl Default for BackendKind {
    fn default() -> Self {
        if cfg!(feature = "cuda") {
            BackendKind::Cuda
        } else {
            BackendKind::Sim
        }
    }
}

impl FromStr for BackendKind {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "cuda" => Ok(BackendKind::Cuda),
            "sim" => Ok(BackendKind::Sim),
            other => Err(format!("unknown backend '{}'", other)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WriteMode {
    /// Each segment is on the device before the write returns.
    #[default]
    Sync,
    /// Segments are staged and uploaded in the background; `flush` is the
    /// durability point.
    Async,
}

impl FromStr for WriteMode {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "sync" => Ok(WriteMode::Sync),
            "async" => Ok(WriteMode::Async),
            other => Err(format!("unknown write mode '{}'", other)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    pub backend: BackendKind,
    pub device: usize,
    /// Bytes exported. Derived from the device total when unset.
    pub export_size: Option<ByteSize>,
    pub safety_reserve: ByteSize,
    pub staging_buffers: usize,
    pub write_mode: WriteMode,
    pub completion_workers: usize,
    /// Capacity of the simulated device.
    pub sim_capacity: ByteSize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            backend: BackendKind::default(),
            device: 0,
            export_size: None,
            safety_reserve: DEFAULT_SAFETY_RESERVE,
            staging_buffers: 8,
            write_mode: WriteMode::Sync,
            completion_workers: 4,
            sim_capacity: ByteSize::gib(1),
        }
    }
}

fn parse_var<T: FromStr>(key: &str, value: &str) -> Result<T>
where
    T::Err: std::fmt::Display,
{
    value
        .trim()
        .parse()
        .map_err(|e| StoreError::Config(format!("{}={}: {}", key, value, e)))
}

impl StoreConfig {
    /// Defaults overridden by `VRAM_*` environment variables.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let mut config = Self::default();
        if let Some(v) = lookup("VRAM_BACKEND") {
            config.backend = parse_var("VRAM_BACKEND", &v)?;
        }
        if let Some(v) = lookup("VRAM_DEVICE") {
            config.device = parse_var("VRAM_DEVICE", &v)?;
        }
        if let Some(v) = lookup("VRAM_SIZE") {
            config.export_size = Some(parse_var("VRAM_SIZE", &v)?);
        }
        if let Some(v) = lookup("VRAM_SAFETY_RESERVE") {
            config.safety_reserve = parse_var("VRAM_SAFETY_RESERVE", &v)?;
        }
        if let Some(v) = lookup("VRAM_STAGING_BUFFERS") {
            config.staging_buffers = parse_var("VRAM_STAGING_BUFFERS", &v)?;
        }
        if let Some(v) = lookup("VRAM_WRITE_MODE") {
            config.write_mode = parse_var("VRAM_WRITE_MODE", &v)?;
        }
        if let Some(v) = lookup("VRAM_COMPLETION_WORKERS") {
            config.completion_workers = parse_var("VRAM_COMPLETION_WORKERS", &v)?;
        }
        if let Some(v) = lookup("VRAM_SIM_CAPACITY") {
            config.sim_capacity = parse_var("VRAM_SIM_CAPACITY", &v)?;
        }
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.export_size == Some(ByteSize(0)) {
            return Err(StoreError::Config("export size must be positive".to_string()));
        }
        if self.completion_workers == 0 {
            return Err(StoreError::Config(
                "at least one completion worker is required".to_string(),
            ));
        }
        Ok(())
    }

    /// Export size for a device with `device_total` bytes.
    pub fn resolve_export_size(&self, device_total: u64) -> u64 {
        match self.export_size {
            Some(size) => size.bytes(),
            None => {
                let reserve = self.safety_reserve.bytes();
                if device_total > reserve {
                    device_total - reserve
                } else {
                    device_total
                }
            }
        }
    }
}
