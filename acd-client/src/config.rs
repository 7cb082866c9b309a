use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;
use tracing::error;

use crate::error::Error;

pub const DEFAULT_SYNC_CHUNK_SIZE: u32 = 25;
pub const DEFAULT_SYNC_INTERVAL: &str = "30s";
pub const DEFAULT_TIMEOUT: &str = "0";

/// Client configuration, loaded from a JSON file. Interval fields are
/// human-readable duration strings ("30s", "15m", "1h30m"); "0" disables a
/// timeout and an empty interval disables its worker.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Config {
    pub app_name: String,
    pub app_version: String,
    pub cache_file: PathBuf,
    pub headers: HashMap<String, String>,
    pub purge_trash_interval: String,
    pub refresh_token: String,
    pub sync_chunk_size: u32,
    pub sync_interval: String,
    pub timeout: String,
    pub user_agent: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            app_name: String::new(),
            app_version: String::new(),
            cache_file: PathBuf::new(),
            headers: HashMap::new(),
            purge_trash_interval: String::new(),
            refresh_token: String::new(),
            sync_chunk_size: DEFAULT_SYNC_CHUNK_SIZE,
            sync_interval: DEFAULT_SYNC_INTERVAL.to_string(),
            timeout: DEFAULT_TIMEOUT.to_string(),
            user_agent: String::new(),
        }
    }
}

impl Config {
    pub fn load(path: impl AsRef<Path>) -> Result<Self, Error> {
        let path = path.as_ref();
        validate_file(path, false)?;
        let file = std::fs::File::open(path).map_err(|err| {
            error!(path = ?path, error = %err, "opening the config file failed");
            Error::OpenFile {
                path: path.to_path_buf(),
                source: err,
            }
        })?;
        let config: Config = serde_json::from_reader(file).map_err(Error::JsonDecode)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), Error> {
        if self.cache_file.as_os_str().is_empty() {
            return Err(Error::CacheFileNotConfigured);
        }
        Ok(())
    }

    pub fn sync_interval(&self) -> Result<Duration, Error> {
        parse_duration(&self.sync_interval)
    }

    /// The HTTP timeout; `None` when disabled with "0".
    pub fn timeout(&self) -> Result<Option<Duration>, Error> {
        let timeout = parse_duration(&self.timeout)?;
        Ok((!timeout.is_zero()).then_some(timeout))
    }

    /// How often to purge the trash; `None` when not configured.
    pub fn purge_trash_interval(&self) -> Result<Option<Duration>, Error> {
        if self.purge_trash_interval.is_empty() {
            return Ok(None);
        }
        let interval = parse_duration(&self.purge_trash_interval)?;
        Ok((!interval.is_zero()).then_some(interval))
    }
}

pub(crate) fn validate_file(path: &Path, check_permissions: bool) -> Result<(), Error> {
    let metadata = match std::fs::metadata(path) {
        Ok(metadata) => metadata,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
            error!(path = ?path, "file not found");
            return Err(Error::FileNotFound(path.to_path_buf()));
        }
        Err(err) => {
            error!(path = ?path, error = %err, "stat failed");
            return Err(Error::StatFile {
                path: path.to_path_buf(),
                source: err,
            });
        }
    };
    #[cfg(unix)]
    if check_permissions {
        use std::os::unix::fs::PermissionsExt;
        let mode = metadata.permissions().mode() & 0o777;
        if mode != 0o600 {
            error!(path = ?path, mode = format!("{mode:o}"), "want mode 600");
            return Err(Error::WrongPermissions(path.to_path_buf()));
        }
    }
    #[cfg(not(unix))]
    let _ = (metadata, check_permissions);
    Ok(())
}

/// Parses a Go-style duration string: an integer count per unit, units
/// "ns", "us", "ms", "s", "m" and "h", concatenated ("1h30m"). A bare "0"
/// is zero.
pub(crate) fn parse_duration(value: &str) -> Result<Duration, Error> {
    let s = value.trim();
    if s == "0" {
        return Ok(Duration::ZERO);
    }
    if s.is_empty() {
        return Err(Error::InvalidDuration(value.to_string()));
    }

    let bytes = s.as_bytes();
    let mut total = Duration::ZERO;
    let mut i = 0;
    while i < bytes.len() {
        let digits_start = i;
        while i < bytes.len() && bytes[i].is_ascii_digit() {
            i += 1;
        }
        let Ok(count) = s[digits_start..i].parse::<u64>() else {
            return Err(Error::InvalidDuration(value.to_string()));
        };
        let unit_start = i;
        while i < bytes.len() && !bytes[i].is_ascii_digit() {
            i += 1;
        }
        let step = match &s[unit_start..i] {
            "ns" => Duration::from_nanos(count),
            "us" | "µs" => Duration::from_micros(count),
            "ms" => Duration::from_millis(count),
            "s" => Duration::from_secs(count),
            "m" => Duration::from_secs(count.saturating_mul(60)),
            "h" => Duration::from_secs(count.saturating_mul(3600)),
            _ => return Err(Error::InvalidDuration(value.to_string())),
        };
        total = total
            .checked_add(step)
            .ok_or_else(|| Error::InvalidDuration(value.to_string()))?;
    }
    Ok(total)
}
