use serde::Deserialize;
use std::fs::File;
use std::io::Read;
use std::path::Path;
use std::time::Duration;

#[derive(Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum DeviceKind {
    Host,
    Simulated,
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("cannot read config file {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("cannot parse config file {path}: {source}")]
    Parse {
        path: String,
        #[source]
        source: toml::de::Error,
    },
}

#[derive(Deserialize, Debug, Clone)]
#[serde(default)]
pub struct AllocatorConfig {
    pub name: String,
    pub device_id: usize,
    pub device: DeviceKind,
    /// Bytes the backing device can supply; unbounded when absent.
    pub device_capacity: Option<usize>,
    /// Hard ceiling on the bytes the allocator requests from the device.
    #[serde(alias = "total_memory_limit")]
    pub memory_limit: usize,
    /// Grow regions on demand instead of reserving `memory_limit` up front.
    pub allow_growth: bool,
    pub initial_region_size: usize,
    pub retry_timeout_ms: u64,
    pub huge_pages: bool,
    pub simulated_base: u64,
}

impl Default for AllocatorConfig {
    fn default() -> Self {
        AllocatorConfig {
            name: "bfc".to_string(),
            device_id: 0,
            device: DeviceKind::Simulated,
            device_capacity: None,
            memory_limit: 1 << 30,
            allow_growth: true,
            initial_region_size: 1 << 20,
            retry_timeout_ms: 10_000,
            huge_pages: false,
            simulated_base: 0x7f00_0000_0000,
        }
    }
}

impl AllocatorConfig {
    pub fn load_config(path: impl AsRef<Path>) -> Result<AllocatorConfig, ConfigError> {
        let path = path.as_ref();
        let display = path.display().to_string();
        let mut contents = String::new();
        File::open(path)
            .and_then(|mut file| file.read_to_string(&mut contents))
            .map_err(|source| ConfigError::Io {
                path: display.clone(),
                source,
            })?;
        Self::from_toml_str(&contents).map_err(|source| ConfigError::Parse {
            path: display,
            source,
        })
    }

    pub fn from_toml_str(contents: &str) -> Result<AllocatorConfig, toml::de::Error> {
        toml::de::from_str(contents)
    }

    pub fn retry_timeout(&self) -> Duration {
        Duration::from_millis(self.retry_timeout_ms)
    }
}
