//! Storage configuration, loadable from TOML.
//!
//! Every section has production defaults, so a config file only needs to
//! list the values it changes. Sink definitions may carry a
//! [`LevelConfigPatch`] that is merged over the global [`LevelConfig`]
//! when a new file is opened for that sink.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::bytesize::ByteSize;
use crate::duration::serde_str;
use crate::error::{ConfigError, ConfigResult};

pub const MAX_ASSIGNMENT_COUNT: u32 = 100;
pub const MIN_RELATIVE_ALLOCATION: u32 = 100;
pub const MAX_RELATIVE_ALLOCATION: u32 = 500;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(default, rename_all = "camelCase")]
pub struct StorageConfig {
    pub level: LevelConfig,
    pub retry: RetryConfig,
    pub statistics: StatisticsConfig,
    pub quota: QuotaConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(default, rename_all = "camelCase")]
pub struct LevelConfig {
    pub local: LocalConfig,
    pub staging: StagingConfig,
    pub target: TargetConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(default, rename_all = "camelCase")]
pub struct LocalConfig {
    pub volume: VolumeConfig,
    pub compression: CompressionConfig,
    pub disk_sync: DiskSyncConfig,
    pub disk_allocation: DiskAllocationConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(default, rename_all = "camelCase")]
pub struct VolumeConfig {
    pub assignment: AssignmentConfig,
    pub registration: RegistrationConfig,
}

/// How many volumes a new file is spread over, and which volume types are
/// preferred (most preferred first).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct AssignmentConfig {
    pub count: u32,
    pub preferred_types: Vec<String>,
}

impl Default for AssignmentConfig {
    fn default() -> Self {
        Self {
            count: 1,
            preferred_types: vec!["default".to_string()],
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct RegistrationConfig {
    pub ttl_seconds: u64,
}

impl Default for RegistrationConfig {
    fn default() -> Self {
        Self { ttl_seconds: 10 }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum CompressionType {
    None,
    #[default]
    Gzip,
    Zstd,
}

impl CompressionType {
    /// The staging storage and the table import accept only plain or gzip files.
    pub fn supported_by_staging(&self) -> bool {
        matches!(self, CompressionType::None | CompressionType::Gzip)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            CompressionType::None => "none",
            CompressionType::Gzip => "gzip",
            CompressionType::Zstd => "zstd",
        }
    }

    /// File name extension appended to compressed slice files.
    pub fn extension(&self) -> &'static str {
        match self {
            CompressionType::None => "",
            CompressionType::Gzip => ".gz",
            CompressionType::Zstd => ".zst",
        }
    }
}

impl std::fmt::Display for CompressionType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum GzipImplementation {
    Standard,
    Fast,
    #[default]
    Parallel,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct GzipConfig {
    pub level: u32,
    pub implementation: GzipImplementation,
    pub block_size: ByteSize,
    pub concurrency: u32,
}

impl Default for GzipConfig {
    fn default() -> Self {
        Self {
            level: 1,
            implementation: GzipImplementation::Parallel,
            block_size: ByteSize::kb(256),
            concurrency: 0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ZstdConfig {
    pub level: u32,
    pub window_size: ByteSize,
    pub concurrency: u32,
}

impl Default for ZstdConfig {
    fn default() -> Self {
        Self {
            level: 1,
            window_size: ByteSize::kb(512),
            concurrency: 0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct CompressionConfig {
    #[serde(rename = "type")]
    pub compression_type: CompressionType,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub gzip: Option<GzipConfig>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub zstd: Option<ZstdConfig>,
}

impl CompressionConfig {
    pub fn none() -> Self {
        Self {
            compression_type: CompressionType::None,
            gzip: None,
            zstd: None,
        }
    }

    pub fn gzip() -> Self {
        Self {
            compression_type: CompressionType::Gzip,
            gzip: Some(GzipConfig::default()),
            zstd: None,
        }
    }

    pub fn zstd() -> Self {
        Self {
            compression_type: CompressionType::Zstd,
            gzip: None,
            zstd: Some(ZstdConfig::default()),
        }
    }

    /// Compression of a file forwarded to the staging storage as is.
    /// Local zstd would need re-compression, which is not available.
    pub fn for_staging(&self) -> Option<CompressionConfig> {
        self.compression_type.supported_by_staging().then(|| self.clone())
    }
}

impl Default for CompressionConfig {
    fn default() -> Self {
        Self::gzip()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum SyncMode {
    Disabled,
    #[default]
    Disk,
    Cache,
}

/// When buffered records are flushed to the OS cache or synced to disk.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct DiskSyncConfig {
    pub mode: SyncMode,
    pub wait: bool,
    #[serde(with = "serde_str")]
    pub check_interval: Duration,
    pub count_trigger: u32,
    pub bytes_trigger: ByteSize,
    #[serde(with = "serde_str")]
    pub interval_trigger: Duration,
}

impl Default for DiskSyncConfig {
    fn default() -> Self {
        Self {
            mode: SyncMode::Disk,
            wait: true,
            check_interval: Duration::from_millis(5),
            count_trigger: 10_000,
            bytes_trigger: ByteSize::MB,
            interval_trigger: Duration::from_millis(50),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct DiskAllocationConfig {
    pub enabled: bool,
    /// Used when there is no statistics about previous slices.
    #[serde(rename = "static")]
    pub static_size: ByteSize,
    /// Percentage of the largest recent slice.
    pub relative: u32,
}

impl Default for DiskAllocationConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            static_size: ByteSize::mb(100),
            relative: 110,
        }
    }
}

/// Thresholds that trigger an upload or an import.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TriggerConfig {
    pub count: u64,
    pub size: ByteSize,
    #[serde(with = "serde_str")]
    pub interval: Duration,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct StagingConfig {
    /// Maximum number of file resources created in parallel on rotation.
    pub parallel_file_create_limit: usize,
    pub upload_trigger: TriggerConfig,
}

impl Default for StagingConfig {
    fn default() -> Self {
        Self {
            parallel_file_create_limit: 50,
            upload_trigger: TriggerConfig {
                count: 10_000,
                size: ByteSize::mb(5),
                interval: Duration::from_secs(30),
            },
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct TargetConfig {
    pub import_trigger: TriggerConfig,
}

impl Default for TargetConfig {
    fn default() -> Self {
        Self {
            import_trigger: TriggerConfig {
                count: 50_000,
                size: ByteSize::mb(50),
                interval: Duration::from_secs(60),
            },
        }
    }
}

/// Exponential backoff of failed file/slice operations.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct RetryConfig {
    #[serde(with = "serde_str")]
    pub initial_interval: Duration,
    pub multiplier: f64,
    #[serde(with = "serde_str")]
    pub max_interval: Duration,
    pub randomization_factor: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            initial_interval: Duration::from_secs(60),
            multiplier: 4.0,
            max_interval: Duration::from_secs(3 * 3600),
            randomization_factor: 0.2,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct StatisticsConfig {
    /// How many recently finished slices are inspected for disk allocation.
    pub recent_slices_for_allocation: usize,
}

impl Default for StatisticsConfig {
    fn default() -> Self {
        Self {
            recent_slices_for_allocation: 10,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct QuotaConfig {
    /// Maximum size of data buffered in local and staging levels per sink.
    pub max_buffered_size: ByteSize,
}

impl Default for QuotaConfig {
    fn default() -> Self {
        Self {
            max_buffered_size: ByteSize::GB,
        }
    }
}

/// Sink-level overrides, every field is optional.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(default, rename_all = "camelCase")]
pub struct LevelConfigPatch {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub local: Option<LocalConfigPatch>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub staging: Option<StagingConfigPatch>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub target: Option<TargetConfigPatch>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(default, rename_all = "camelCase")]
pub struct LocalConfigPatch {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub assignment_count: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub assignment_preferred_types: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub compression: Option<CompressionConfig>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub disk_sync: Option<DiskSyncConfig>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub disk_allocation: Option<DiskAllocationConfig>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(default, rename_all = "camelCase")]
pub struct StagingConfigPatch {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub upload_trigger: Option<TriggerConfig>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(default, rename_all = "camelCase")]
pub struct TargetConfigPatch {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub import_trigger: Option<TriggerConfig>,
}

impl StorageConfig {
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config = Self::from_toml_str(&content)?;
        Ok(config)
    }

    pub fn from_toml_str(content: &str) -> ConfigResult<Self> {
        let config: StorageConfig =
            toml::from_str(content).map_err(|e| ConfigError::Parse(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_toml_string(&self) -> anyhow::Result<String> {
        Ok(toml::to_string_pretty(self)?)
    }

    pub fn validate(&self) -> ConfigResult<()> {
        self.level.validate()?;

        let retry = &self.retry;
        if retry.initial_interval.is_zero() {
            return Err(ConfigError::Invalid("retry.initialInterval must be positive".into()));
        }
        if retry.max_interval < retry.initial_interval {
            return Err(ConfigError::Invalid(
                "retry.maxInterval must not be lower than retry.initialInterval".into(),
            ));
        }
        if retry.multiplier < 1.0 {
            return Err(ConfigError::Invalid("retry.multiplier must be at least 1".into()));
        }
        if !(0.0..1.0).contains(&retry.randomization_factor) {
            return Err(ConfigError::Invalid(
                "retry.randomizationFactor must be in the range [0, 1)".into(),
            ));
        }
        if self.statistics.recent_slices_for_allocation == 0 {
            return Err(ConfigError::Invalid(
                "statistics.recentSlicesForAllocation must be positive".into(),
            ));
        }
        Ok(())
    }
}

impl LevelConfig {
    pub fn validate(&self) -> ConfigResult<()> {
        let assignment = &self.local.volume.assignment;
        if !(1..=MAX_ASSIGNMENT_COUNT).contains(&assignment.count) {
            return Err(ConfigError::InvalidValue {
                key: "local.volume.assignment.count".into(),
                value: assignment.count.to_string(),
                reason: format!("must be between 1 and {MAX_ASSIGNMENT_COUNT}"),
            });
        }
        if assignment.preferred_types.is_empty() {
            return Err(ConfigError::Invalid(
                "local.volume.assignment.preferredTypes must contain at least one type".into(),
            ));
        }

        let allocation = &self.local.disk_allocation;
        if !(MIN_RELATIVE_ALLOCATION..=MAX_RELATIVE_ALLOCATION).contains(&allocation.relative) {
            return Err(ConfigError::InvalidValue {
                key: "local.diskAllocation.relative".into(),
                value: allocation.relative.to_string(),
                reason: format!(
                    "must be between {MIN_RELATIVE_ALLOCATION} and {MAX_RELATIVE_ALLOCATION}"
                ),
            });
        }

        if self.staging.parallel_file_create_limit == 0 {
            return Err(ConfigError::Invalid(
                "staging.parallelFileCreateLimit must be positive".into(),
            ));
        }
        Ok(())
    }

    /// Returns a copy with the patch applied. The result is validated.
    pub fn apply_patch(&self, patch: &LevelConfigPatch) -> ConfigResult<LevelConfig> {
        let mut out = self.clone();

        if let Some(local) = &patch.local {
            if let Some(count) = local.assignment_count {
                out.local.volume.assignment.count = count;
            }
            if let Some(types) = &local.assignment_preferred_types {
                out.local.volume.assignment.preferred_types = types.clone();
            }
            if let Some(compression) = &local.compression {
                out.local.compression = compression.clone();
            }
            if let Some(sync) = &local.disk_sync {
                out.local.disk_sync = sync.clone();
            }
            if let Some(allocation) = &local.disk_allocation {
                out.local.disk_allocation = allocation.clone();
            }
        }
        if let Some(trigger) = patch.staging.as_ref().and_then(|s| s.upload_trigger.clone()) {
            out.staging.upload_trigger = trigger;
        }
        if let Some(trigger) = patch.target.as_ref().and_then(|t| t.import_trigger.clone()) {
            out.target.import_trigger = trigger;
        }

        out.validate()?;
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = StorageConfig::default();
        assert_eq!(config.level.local.volume.assignment.count, 1);
        assert_eq!(config.level.local.volume.assignment.preferred_types, vec!["default"]);
        assert_eq!(config.level.local.compression.compression_type, CompressionType::Gzip);
        assert_eq!(config.level.local.disk_allocation.static_size, ByteSize::mb(100));
        assert_eq!(config.level.local.disk_allocation.relative, 110);
        assert_eq!(config.level.staging.parallel_file_create_limit, 50);
        assert_eq!(config.retry.initial_interval, Duration::from_secs(60));
        assert_eq!(config.quota.max_buffered_size, ByteSize::GB);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_parse_partial() {
        let toml_str = r#"
[level.local.volume.assignment]
count = 3
preferredTypes = ["ssd", "hdd"]

[level.local.diskAllocation]
static = "50MB"

[retry]
initialInterval = "30s"
"#;
        let config = StorageConfig::from_toml_str(toml_str).unwrap();
        assert_eq!(config.level.local.volume.assignment.count, 3);
        assert_eq!(config.level.local.volume.assignment.preferred_types, vec!["ssd", "hdd"]);
        assert_eq!(config.level.local.disk_allocation.static_size, ByteSize::mb(50));
        assert!(config.level.local.disk_allocation.enabled);
        assert_eq!(config.retry.initial_interval, Duration::from_secs(30));
        assert_eq!(config.retry.max_interval, Duration::from_secs(3 * 3600));
    }

    #[test]
    fn test_toml_output_parses_back() {
        let config = StorageConfig::default();
        let toml_str = config.to_toml_string().unwrap();
        assert!(toml_str.contains("initialInterval = \"1m\""));
        assert_eq!(StorageConfig::from_toml_str(&toml_str).unwrap(), config);
    }

    #[test]
    fn test_validate_rejects_out_of_range() {
        let mut config = StorageConfig::default();
        config.level.local.volume.assignment.count = 0;
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("local.volume.assignment.count"));

        let mut config = StorageConfig::default();
        config.level.local.disk_allocation.relative = 99;
        assert!(config.validate().is_err());

        let mut config = StorageConfig::default();
        config.level.local.volume.assignment.preferred_types.clear();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_apply_patch() {
        let level = LevelConfig::default();
        let patch = LevelConfigPatch {
            local: Some(LocalConfigPatch {
                assignment_count: Some(2),
                compression: Some(CompressionConfig::none()),
                ..Default::default()
            }),
            ..Default::default()
        };

        let patched = level.apply_patch(&patch).unwrap();
        assert_eq!(patched.local.volume.assignment.count, 2);
        assert_eq!(patched.local.compression.compression_type, CompressionType::None);
        assert_eq!(patched.local.disk_sync, level.local.disk_sync);

        let invalid = LevelConfigPatch {
            local: Some(LocalConfigPatch {
                assignment_count: Some(500),
                ..Default::default()
            }),
            ..Default::default()
        };
        assert!(level.apply_patch(&invalid).is_err());
    }

    #[test]
    fn test_staging_compression_support() {
        assert!(CompressionConfig::none().for_staging().is_some());
        assert!(CompressionConfig::gzip().for_staging().is_some());
        assert!(CompressionConfig::zstd().for_staging().is_none());
    }
}
