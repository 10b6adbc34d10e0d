//! Journal Configuration
//!
//! ## JournalConfig
//!
//! Controls where records land and how they get there:
//!
//! - **bucket / access_key / secret_key**: object-store target and
//!   credentials (credentials are consumed by the store implementation)
//! - **directory_format**: UTC time-partition pattern for object keys
//! - **local_directory**: directory for the durable spill queue (required)
//! - **delimiter / sized**: per-record framing
//! - **compression / suffix**: batch compression and the object-key suffix
//! - **max_queue_size**: admission cap in records
//! - **max_batch_size / max_batch_latency_ms**: batcher bounds
//! - **expiration_ms**: age after which stranded uploads are reclaimed
//! - **shards**: fan out across N independent journals
//!
//! ## Usage
//!
//! ```ignore
//! use s3_journal::JournalConfig;
//!
//! let config = JournalConfig {
//!     bucket: "events".to_string(),
//!     local_directory: "./data/journal".into(),
//!     directory_format: "'myapp'/%Y/%m/%d".to_string(),
//!     ..Default::default()
//! };
//! ```

use std::path::PathBuf;

use chrono::format::{parse, Parsed, StrftimeItems};
use chrono::{DateTime, NaiveDate, TimeZone, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::frame::Compression;
use crate::store::PartLimits;

/// Shard ids are drawn from this alphabet, one character per shard.
pub const SHARD_IDS: &str = "0123456789abcdefghijklmnopqrstuvwxyz";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JournalConfig {
    /// Target bucket
    pub bucket: String,

    /// Object-store access key, if the store implementation wants one
    #[serde(default)]
    pub access_key: Option<String>,

    /// Object-store secret key
    #[serde(default)]
    pub secret_key: Option<String>,

    /// Time-partition pattern, see [`DirectoryFormat`] (default: `%Y/%m/%d`)
    #[serde(default = "default_directory_format")]
    pub directory_format: String,

    /// Directory for the durable spill queue (required)
    pub local_directory: PathBuf,

    /// Per-record separator bytes (default: `\n`; `None` disables)
    #[serde(default = "default_delimiter")]
    pub delimiter: Option<Vec<u8>>,

    /// Prepend each record with its big-endian 32-bit length
    #[serde(default)]
    pub sized: bool,

    /// Fsync durable-queue puts (default: true)
    #[serde(default = "default_fsync")]
    pub fsync: bool,

    /// Batch compression (default: identity)
    #[serde(default)]
    pub compression: Compression,

    /// Explicit object-key suffix; derived from the compressor when unset
    #[serde(default)]
    pub suffix: Option<String>,

    /// Journal identifier baked into object keys (default: local hostname)
    #[serde(default)]
    pub id: Option<String>,

    /// Admission cap in records (default: 65536)
    #[serde(default = "default_max_queue_size")]
    pub max_queue_size: u64,

    /// Batcher capacity in records
    #[serde(default)]
    pub max_batch_size: Option<usize>,

    /// Batcher flush interval in milliseconds (default: 60000)
    #[serde(default = "default_max_batch_latency_ms")]
    pub max_batch_latency_ms: Option<u64>,

    /// If set, stranded multipart uploads older than this are reclaimed
    #[serde(default)]
    pub expiration_ms: Option<u64>,

    /// If set, fan out across N shards (N <= 36)
    #[serde(default)]
    pub shards: Option<usize>,

    /// Part-size rules (default: S3 conventional values)
    #[serde(default)]
    pub limits: PartLimits,
}

impl Default for JournalConfig {
    fn default() -> Self {
        Self {
            bucket: String::new(),
            access_key: None,
            secret_key: None,
            directory_format: default_directory_format(),
            local_directory: PathBuf::new(),
            delimiter: default_delimiter(),
            sized: false,
            fsync: default_fsync(),
            compression: Compression::default(),
            suffix: None,
            id: None,
            max_queue_size: default_max_queue_size(),
            max_batch_size: None,
            max_batch_latency_ms: default_max_batch_latency_ms(),
            expiration_ms: None,
            shards: None,
            limits: PartLimits::default(),
        }
    }
}

fn default_directory_format() -> String {
    "%Y/%m/%d".to_string()
}

fn default_delimiter() -> Option<Vec<u8>> {
    Some(b"\n".to_vec())
}

fn default_fsync() -> bool {
    true
}

fn default_max_queue_size() -> u64 {
    65_536
}

fn default_max_batch_latency_ms() -> Option<u64> {
    Some(60_000)
}

impl JournalConfig {
    /// Check the config for the mistakes a typo can produce.
    pub fn validate(&self) -> Result<()> {
        if self.bucket.is_empty() {
            return Err(Error::Config("bucket must be set".to_string()));
        }
        if self.local_directory.as_os_str().is_empty() {
            return Err(Error::Config("local_directory must be set".to_string()));
        }
        if self.max_batch_size.is_none() && self.max_batch_latency_ms.is_none() {
            return Err(Error::Config(
                "at least one of max_batch_size and max_batch_latency_ms must be set".to_string(),
            ));
        }
        if self.max_queue_size == 0 {
            return Err(Error::Config("max_queue_size must be positive".to_string()));
        }
        if let Some(shards) = self.shards {
            if shards == 0 || shards > SHARD_IDS.len() {
                return Err(Error::Config(format!(
                    "shards must be between 1 and {}, got {}",
                    SHARD_IDS.len(),
                    shards
                )));
            }
        }
        DirectoryFormat::parse(&self.directory_format)?;
        Ok(())
    }

    /// The journal id to bake into object keys: the configured one, or the
    /// local hostname.
    pub fn resolved_id(&self) -> String {
        if let Some(id) = &self.id {
            return id.clone();
        }
        hostname::get()
            .ok()
            .and_then(|h| h.into_string().ok())
            .unwrap_or_else(|| "journal".to_string())
    }

    /// Effective object-key suffix: the explicit one, or the compressor's.
    pub fn resolved_suffix(&self) -> Option<String> {
        self.suffix
            .clone()
            .or_else(|| self.compression.suffix().map(str::to_string))
    }
}

/// A UTC time-partition pattern for object directories.
///
/// Grammar: `'<literal>'/<strftime pattern>` — an optional leading
/// single-quoted literal segment becomes a fixed key prefix, the rest is a
/// `strftime`-style pattern rendered under UTC. Examples:
///
/// ```text
/// %Y/%m/%d              -> 2024/01/15
/// 'myapp'/%Y/%m/%d      -> myapp/2024/01/15
/// 'logs'/%Y/%m/%d/%H    -> logs/2024/01/15/23
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirectoryFormat {
    prefix: Option<String>,
    pattern: String,
    pattern_segments: usize,
}

impl DirectoryFormat {
    /// Parse a format string against the grammar above.
    pub fn parse(format: &str) -> Result<Self> {
        let (prefix, pattern) = match format.strip_prefix('\'') {
            Some(rest) => {
                let end = rest.find('\'').ok_or_else(|| {
                    Error::Config(format!("unterminated literal in directory format: {format}"))
                })?;
                let literal = &rest[..end];
                let after = rest[end + 1..].strip_prefix('/').ok_or_else(|| {
                    Error::Config(format!(
                        "directory format literal must be followed by '/': {format}"
                    ))
                })?;
                (Some(literal.to_string()), after.to_string())
            }
            None => (None, format.to_string()),
        };

        if pattern.is_empty() {
            return Err(Error::Config(
                "directory format needs a time pattern".to_string(),
            ));
        }

        // Surface bad strftime specifiers now instead of at the first flush
        if StrftimeItems::new(&pattern).any(|item| matches!(item, chrono::format::Item::Error)) {
            return Err(Error::Config(format!(
                "invalid strftime pattern in directory format: {format}"
            )));
        }

        let pattern_segments = pattern.split('/').count();
        Ok(Self {
            prefix,
            pattern,
            pattern_segments,
        })
    }

    /// Render the directory string for `at`.
    pub fn render(&self, at: DateTime<Utc>) -> String {
        let time = at.format(&self.pattern).to_string();
        match &self.prefix {
            Some(prefix) => format!("{prefix}/{time}"),
            None => time,
        }
    }

    /// The fixed key prefix the format pins, with a trailing slash, or an
    /// empty string. This is the prefix recovery lists uploads under.
    pub fn list_prefix(&self) -> String {
        match &self.prefix {
            Some(prefix) => format!("{prefix}/"),
            None => String::new(),
        }
    }

    /// Parse the time back out of a rendered directory string.
    ///
    /// Only the trailing pattern segments are considered, so directories
    /// written by peers with different (or no) prefixes still parse.
    /// Fields the pattern does not mention are anchored at their minimum
    /// (January 1st, midnight).
    pub fn parse_directory(&self, directory: &str) -> Option<DateTime<Utc>> {
        let segments: Vec<&str> = directory.split('/').collect();
        if segments.len() < self.pattern_segments {
            return None;
        }
        let candidate = segments[segments.len() - self.pattern_segments..].join("/");

        let mut parsed = Parsed::new();
        parse(&mut parsed, &candidate, StrftimeItems::new(&self.pattern)).ok()?;

        let year = parsed.year?;
        let month = parsed.month.unwrap_or(1);
        let day = parsed.day.unwrap_or(1);
        let hour = match (parsed.hour_div_12, parsed.hour_mod_12) {
            (Some(div), Some(rem)) => div * 12 + rem,
            _ => 0,
        };
        let minute = parsed.minute.unwrap_or(0);
        let second = parsed.second.unwrap_or(0);

        let naive = NaiveDate::from_ymd_opt(year, month, day)?
            .and_hms_opt(hour, minute, second)?;
        Some(Utc.from_utc_datetime(&naive))
    }

    /// The same format with a shard segment prepended to the prefix, used by
    /// the sharded fan-out to give each shard its own key space.
    pub fn with_shard(&self, shard: char) -> DirectoryFormat {
        let prefix = match &self.prefix {
            Some(prefix) => format!("{shard}/{prefix}"),
            None => shard.to_string(),
        };
        DirectoryFormat {
            prefix: Some(prefix),
            pattern: self.pattern.clone(),
            pattern_segments: self.pattern_segments,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn at(y: i32, mo: u32, d: u32, h: u32, mi: u32, s: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, mo, d, h, mi, s).single().unwrap()
    }

    #[test]
    fn test_render_default_format() {
        let format = DirectoryFormat::parse("%Y/%m/%d").unwrap();
        assert_eq!(format.render(at(2024, 1, 15, 23, 59, 59)), "2024/01/15");
        assert_eq!(format.list_prefix(), "");
    }

    #[test]
    fn test_render_with_literal_prefix() {
        let format = DirectoryFormat::parse("'myapp'/%Y/%m/%d").unwrap();
        assert_eq!(
            format.render(at(2024, 1, 15, 0, 0, 0)),
            "myapp/2024/01/15"
        );
        assert_eq!(format.list_prefix(), "myapp/");
    }

    #[test]
    fn test_parse_directory_roundtrip() {
        let format = DirectoryFormat::parse("'myapp'/%Y/%m/%d").unwrap();
        let rendered = format.render(at(2024, 1, 15, 12, 30, 0));
        // Date-only patterns anchor at midnight
        assert_eq!(
            format.parse_directory(&rendered),
            Some(at(2024, 1, 15, 0, 0, 0))
        );
    }

    #[test]
    fn test_parse_directory_ignores_foreign_prefix() {
        let format = DirectoryFormat::parse("%Y/%m/%d").unwrap();
        assert_eq!(
            format.parse_directory("some/other/prefix/2024/01/15"),
            Some(at(2024, 1, 15, 0, 0, 0))
        );
    }

    #[test]
    fn test_parse_directory_with_hours() {
        let format = DirectoryFormat::parse("%Y/%m/%d/%H").unwrap();
        assert_eq!(
            format.parse_directory("2024/01/15/23"),
            Some(at(2024, 1, 15, 23, 0, 0))
        );
    }

    #[test]
    fn test_parse_directory_rejects_garbage() {
        let format = DirectoryFormat::parse("%Y/%m/%d").unwrap();
        assert_eq!(format.parse_directory("not/a/date"), None);
        assert_eq!(format.parse_directory(""), None);
    }

    #[test]
    fn test_unterminated_literal_rejected() {
        assert!(DirectoryFormat::parse("'oops/%Y").is_err());
    }

    #[test]
    fn test_with_shard_prepends_segment() {
        let format = DirectoryFormat::parse("'app'/%Y/%m/%d").unwrap();
        let sharded = format.with_shard('3');
        assert_eq!(
            sharded.render(at(2024, 1, 15, 0, 0, 0)),
            "3/app/2024/01/15"
        );
        assert_eq!(sharded.list_prefix(), "3/app/");
    }

    #[test]
    fn test_config_validation() {
        let mut config = JournalConfig {
            bucket: "b".to_string(),
            local_directory: "/tmp/q".into(),
            ..Default::default()
        };
        assert!(config.validate().is_ok());

        config.shards = Some(37);
        assert!(config.validate().is_err());
        config.shards = Some(36);
        assert!(config.validate().is_ok());

        config.max_batch_size = None;
        config.max_batch_latency_ms = None;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_resolved_suffix_follows_compressor() {
        let mut config = JournalConfig {
            bucket: "b".to_string(),
            local_directory: "/tmp/q".into(),
            compression: Compression::Gzip,
            ..Default::default()
        };
        assert_eq!(config.resolved_suffix(), Some("gz".to_string()));

        config.suffix = Some("dat".to_string());
        assert_eq!(config.resolved_suffix(), Some("dat".to_string()));
    }
}
