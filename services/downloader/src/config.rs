//! Downloader configuration.
//!
//! Every field has a default, so an empty YAML file (or none at all) gives
//! the production GFS 0.5° setup.

use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use ingestion::BuildOutputs;
use serde::{Deserialize, Serialize};
use tracing::debug;
use wind_common::{BuildTime, PressureFamily};

/// Root configuration, loaded from a YAML file.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DownloaderConfig {
    pub source: SourceConfig,
    pub timing: TimingConfig,
    pub deadline: DeadlineConfig,
    /// Concurrent workers per resolved source address.
    pub workers_per_address: usize,
    pub outputs: BuildOutputs,
    pub daemon: DaemonConfig,
}

/// Where the source files live.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SourceConfig {
    pub scheme: String,
    pub host: String,
    pub port: u16,
    /// Remote directory, with `{date}`, `{cycle:02}` and `{ymdh}`
    /// placeholders.
    pub path_template: String,
    /// File name, with `{cycle:02}`, `{family}` and `{hour:03}`
    /// placeholders.
    pub file_pattern: String,
}

impl Default for SourceConfig {
    fn default() -> Self {
        Self {
            scheme: "https".to_string(),
            host: "ftp.ncep.noaa.gov".to_string(),
            port: 443,
            path_template: "/data/nccf/com/gfs/prod/gfs.{date}/{cycle:02}/atmos/".to_string(),
            file_pattern: "gfs.t{cycle:02}z.pgrb2{family}.0p50.f{hour:03}".to_string(),
        }
    }
}

impl SourceConfig {
    pub fn file_name(&self, build_time: &BuildTime, hour: u32, family: &PressureFamily) -> String {
        self.file_pattern
            .replace("{cycle:02}", &format!("{:02}", build_time.cycle()))
            .replace("{family}", &family.flag)
            .replace("{hour:03}", &format!("{:03}", hour))
    }

    pub fn remote_directory(&self, build_time: &BuildTime) -> String {
        self.path_template
            .replace("{date}", &build_time.time().format("%Y%m%d").to_string())
            .replace("{cycle:02}", &format!("{:02}", build_time.cycle()))
            .replace("{ymdh}", &build_time.to_string())
    }

    /// Full URL of a file. The host is kept in the URL so that a client
    /// pinned to one address still sends the right `Host` header.
    pub fn url(&self, build_time: &BuildTime, file_name: &str) -> String {
        let directory = self.remote_directory(build_time);
        let separator = if directory.ends_with('/') { "" } else { "/" };
        format!(
            "{}://{}:{}{}{}{}",
            self.scheme, self.host, self.port, directory, separator, file_name
        )
    }
}

/// Timeouts, delays and retry limits, in seconds.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TimingConfig {
    /// Limit on one fetch of one file.
    pub attempt_timeout_secs: f64,
    /// Delay before retrying a missing file while no file of the build
    /// has arrived yet.
    pub first_file_delay_secs: f64,
    /// Delay before retrying a missing or bad file once the build has
    /// started arriving.
    pub retry_delay_secs: f64,
    /// Server sleeps are `backoff_base_secs * 2^exponent`.
    pub backoff_base_secs: f64,
    pub max_backoff_exponent: u32,
    /// Bad copies of one file tolerated before the build is abandoned.
    pub bad_download_retry_limit: u32,
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self {
            attempt_timeout_secs: 120.0,
            first_file_delay_secs: 600.0,
            retry_delay_secs: 120.0,
            backoff_base_secs: 1.0,
            max_backoff_exponent: 10,
            bad_download_retry_limit: 3,
        }
    }
}

impl TimingConfig {
    pub fn attempt_timeout(&self) -> Duration {
        Duration::from_secs_f64(self.attempt_timeout_secs)
    }

    pub fn first_file_delay(&self) -> Duration {
        Duration::from_secs_f64(self.first_file_delay_secs)
    }

    pub fn retry_delay(&self) -> Duration {
        Duration::from_secs_f64(self.retry_delay_secs)
    }

    /// Delay before retrying a file the source does not have yet.
    pub fn not_found_delay(&self, have_first_file: bool) -> Duration {
        if have_first_file {
            self.retry_delay()
        } else {
            self.first_file_delay()
        }
    }

    pub fn server_sleep(&self, exponent: u32) -> Duration {
        Duration::from_secs_f64(self.backoff_base_secs * 2f64.powi(exponent as i32))
    }

    /// Smallest backoff exponent whose sleep is longer than one attempt.
    pub fn timeout_exponent(&self) -> u32 {
        let ratio = self.attempt_timeout_secs / self.backoff_base_secs;
        ratio.log2().ceil().max(0.0) as u32 + 1
    }
}

/// When a build is abandoned.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DeadlineConfig {
    /// Fixed deadline; overrides the two values below.
    pub at: Option<DateTime<Utc>>,
    /// A build always gets at least this long from its start.
    pub minimum_window_secs: u64,
    /// Otherwise the deadline is this long after the build time.
    pub availability_offset_secs: u64,
}

impl Default for DeadlineConfig {
    fn default() -> Self {
        Self {
            at: None,
            minimum_window_secs: 2 * 3600,
            availability_offset_secs: 9 * 3600 + 30 * 60,
        }
    }
}

impl DeadlineConfig {
    pub fn deadline(&self, build_time: &BuildTime, now: DateTime<Utc>) -> DateTime<Utc> {
        if let Some(at) = self.at {
            return at;
        }
        let window = now + chrono::Duration::seconds(self.minimum_window_secs as i64);
        let available =
            build_time.time() + chrono::Duration::seconds(self.availability_offset_secs as i64);
        window.max(available)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DaemonConfig {
    /// Committed builds kept on disk.
    pub num_datasets: usize,
    /// How long after its build time an issuance starts to appear.
    pub availability_delay_secs: u64,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            num_datasets: 1,
            availability_delay_secs: 3 * 3600 + 30 * 60,
        }
    }
}

impl DaemonConfig {
    pub fn availability_delay(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.availability_delay_secs as i64)
    }
}

impl DownloaderConfig {
    /// Load a configuration from a YAML file.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        let config: DownloaderConfig = serde_yaml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;
        config.validate()?;

        debug!(path = %path.display(), host = %config.source.host, "Loaded downloader config");
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.workers_per_address == 0 {
            anyhow::bail!("workers_per_address must be at least 1");
        }
        let timing = &self.timing;
        if !(timing.attempt_timeout_secs > 0.0 && timing.backoff_base_secs > 0.0) {
            anyhow::bail!("attempt_timeout_secs and backoff_base_secs must be positive");
        }
        if !(timing.first_file_delay_secs >= 0.0 && timing.retry_delay_secs >= 0.0) {
            anyhow::bail!("first_file_delay_secs and retry_delay_secs must not be negative");
        }
        self.outputs
            .validate()
            .context("At least one of outputs.grid_store and outputs.mirror must be enabled")?;
        Ok(())
    }
}

impl Default for DownloaderConfig {
    fn default() -> Self {
        Self {
            source: SourceConfig::default(),
            timing: TimingConfig::default(),
            deadline: DeadlineConfig::default(),
            workers_per_address: 2,
            outputs: BuildOutputs::default(),
            daemon: DaemonConfig::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn build_time() -> BuildTime {
        BuildTime::parse("2014060312").unwrap()
    }

    #[test]
    fn test_file_name_and_url() {
        let source = SourceConfig::default();
        let family = PressureFamily {
            flag: "b".to_string(),
            levels: vec![850],
        };
        let name = source.file_name(&build_time(), 6, &family);
        assert_eq!(name, "gfs.t12z.pgrb2b.0p50.f006");
        assert_eq!(
            source.url(&build_time(), &name),
            "https://ftp.ncep.noaa.gov:443/data/nccf/com/gfs/prod/gfs.20140603/12/atmos/gfs.t12z.pgrb2b.0p50.f006"
        );
    }

    #[test]
    fn test_deadline_policy() {
        let deadline = DeadlineConfig::default();
        let bt = build_time();

        // Long after the build time, the minimum window applies.
        let late = Utc.with_ymd_and_hms(2014, 6, 4, 0, 0, 0).unwrap();
        assert_eq!(
            deadline.deadline(&bt, late),
            late + chrono::Duration::hours(2)
        );

        // Early on, the availability offset applies.
        let early = Utc.with_ymd_and_hms(2014, 6, 3, 13, 0, 0).unwrap();
        assert_eq!(
            deadline.deadline(&bt, early),
            Utc.with_ymd_and_hms(2014, 6, 3, 21, 30, 0).unwrap()
        );
    }

    #[test]
    fn test_timeout_exponent() {
        let timing = TimingConfig::default();
        // ceil(log2(120)) + 1
        assert_eq!(timing.timeout_exponent(), 8);
        assert!(timing.server_sleep(timing.timeout_exponent()) > timing.attempt_timeout());
        assert_eq!(timing.not_found_delay(false), Duration::from_secs(600));
        assert_eq!(timing.not_found_delay(true), Duration::from_secs(120));
    }

    #[test]
    fn test_parse_partial_yaml() {
        let yaml = r#"
source:
  host: mirror.example.org
timing:
  attempt_timeout_secs: 30
workers_per_address: 4
outputs:
  mirror: false
"#;
        let config: DownloaderConfig = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.source.host, "mirror.example.org");
        assert_eq!(config.source.port, 443);
        assert_eq!(config.timing.attempt_timeout_secs, 30.0);
        assert_eq!(config.timing.bad_download_retry_limit, 3);
        assert_eq!(config.workers_per_address, 4);
        assert!(config.outputs.grid_store);
        assert!(!config.outputs.mirror);
        config.validate().unwrap();
    }

    #[test]
    fn test_no_outputs_invalid() {
        let mut config = DownloaderConfig::default();
        config.outputs = BuildOutputs {
            grid_store: false,
            mirror: false,
        };
        assert!(config.validate().is_err());
    }
}
