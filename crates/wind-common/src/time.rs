//! Build times and on-disk artifact naming.
//!
//! A build is identified by the model run it came from. Artifacts are named
//! `YYYYMMDDHH` followed by an optional suffix (`""` for the grid store,
//! [`SUFFIX_GRIBMIRROR`] for the raw record mirror).

use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use chrono::{DateTime, Duration, NaiveDateTime, TimeZone, Timelike, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{CommonError, CommonResult};

/// Suffix of the raw GRIB record mirror artifact.
pub const SUFFIX_GRIBMIRROR: &str = ".gribmirror";

const BUILD_TIME_FORMAT: &str = "%Y%m%d%H";
const BUILD_TIME_LEN: usize = 10;

/// Model run time. Always on a six-hour boundary (00, 06, 12, 18 UTC).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct BuildTime(DateTime<Utc>);

impl BuildTime {
    pub fn new(time: DateTime<Utc>) -> CommonResult<Self> {
        if time.hour() % 6 != 0 || time.minute() != 0 || time.second() != 0 || time.nanosecond() != 0
        {
            return Err(CommonError::InvalidBuildTime(format!(
                "{} is not on a six-hour boundary",
                time
            )));
        }
        Ok(Self(time))
    }

    /// Most recent run at or before `time`.
    pub fn floor(time: DateTime<Utc>) -> Self {
        let hour = time.hour() - time.hour() % 6;
        let floored = time
            .date_naive()
            .and_hms_opt(hour, 0, 0)
            .map(|naive| Utc.from_utc_datetime(&naive))
            .unwrap_or(time);
        Self(floored)
    }

    pub fn parse(s: &str) -> CommonResult<Self> {
        let naive = NaiveDateTime::parse_from_str(&format!("{}0000", s), "%Y%m%d%H%M%S")
            .map_err(|e| CommonError::InvalidBuildTime(format!("{}: {}", s, e)))?;
        Self::new(Utc.from_utc_datetime(&naive))
    }

    pub fn time(&self) -> DateTime<Utc> {
        self.0
    }

    /// Run hour (0, 6, 12 or 18).
    pub fn cycle(&self) -> u32 {
        self.0.hour()
    }

    pub fn next(&self) -> Self {
        Self(self.0 + Duration::hours(6))
    }

    pub fn previous(&self) -> Self {
        Self(self.0 - Duration::hours(6))
    }

    /// Path of the artifact for this build with the given suffix.
    pub fn artifact_path(&self, directory: &Path, suffix: &str) -> PathBuf {
        directory.join(format!("{}{}", self, suffix))
    }
}

impl fmt::Display for BuildTime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.format(BUILD_TIME_FORMAT))
    }
}

impl FromStr for BuildTime {
    type Err = CommonError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

/// A file in the data directory whose name starts with a build time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Artifact {
    pub build_time: BuildTime,
    pub suffix: String,
    pub file_name: String,
    pub path: PathBuf,
}

/// List artifacts in `directory`, optionally restricted to some suffixes.
///
/// Entries whose names do not start with a valid build time are ignored.
/// Results are sorted by build time, newest last.
pub fn list_artifacts(directory: &Path, suffixes: Option<&[&str]>) -> std::io::Result<Vec<Artifact>> {
    let mut artifacts = Vec::new();
    for entry in std::fs::read_dir(directory)? {
        let entry = entry?;
        let file_name = match entry.file_name().into_string() {
            Ok(name) => name,
            Err(_) => continue,
        };
        if file_name.len() < BUILD_TIME_LEN || !file_name.is_char_boundary(BUILD_TIME_LEN) {
            continue;
        }
        let (stamp, suffix) = file_name.split_at(BUILD_TIME_LEN);
        let build_time = match BuildTime::parse(stamp) {
            Ok(t) => t,
            Err(_) => continue,
        };
        if let Some(allowed) = suffixes {
            if !allowed.contains(&suffix) {
                continue;
            }
        }
        artifacts.push(Artifact {
            build_time,
            suffix: suffix.to_string(),
            path: entry.path(),
            file_name: file_name.clone(),
        });
    }
    artifacts.sort_by(|a, b| {
        a.build_time
            .cmp(&b.build_time)
            .then_with(|| a.suffix.cmp(&b.suffix))
    });
    Ok(artifacts)
}
