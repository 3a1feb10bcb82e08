//! Data-file naming conventions.
//!
//! Base files are named `{file_id}_{instant_time}.parquet`. Log files are
//! named `.{file_id}_{base_instant}.log.{version}` and sort after their
//! base file within a partition listing. File ids may contain underscores
//! (they are usually UUIDs), so parsing splits on the last `_`.

use crate::model::{BaseFile, LogFile};

pub const BASE_FILE_EXTENSION: &str = ".parquet";
pub const LOG_FILE_INFIX: &str = ".log.";

pub fn base_file_name(file_id: &str, instant_time: &str) -> String {
    format!("{file_id}_{instant_time}{BASE_FILE_EXTENSION}")
}

pub fn log_file_name(file_id: &str, base_instant: &str, version: u32) -> String {
    format!(".{file_id}_{base_instant}{LOG_FILE_INFIX}{version}")
}

/// Parse a partition-relative base file name. Returns `None` for names not
/// following the convention.
pub fn parse_base_file_name(name: &str) -> Option<BaseFile> {
    let stem = name.strip_suffix(BASE_FILE_EXTENSION)?;
    let (file_id, instant_time) = stem.rsplit_once('_')?;
    if file_id.is_empty() || instant_time.is_empty() {
        return None;
    }
    Some(BaseFile {
        file_name: name.to_string(),
        file_id: file_id.to_string(),
        instant_time: instant_time.to_string(),
        bootstrap_source: None,
    })
}

/// Parse a partition-relative log file name. Returns `None` for names not
/// following the convention.
pub fn parse_log_file_name(name: &str) -> Option<LogFile> {
    let stem = name.strip_prefix('.')?;
    let (ids, version) = stem.split_once(LOG_FILE_INFIX)?;
    let version: u32 = version.parse().ok()?;
    let (file_id, base_instant) = ids.rsplit_once('_')?;
    if file_id.is_empty() || base_instant.is_empty() {
        return None;
    }
    Some(LogFile {
        file_name: name.to_string(),
        file_id: file_id.to_string(),
        base_instant: base_instant.to_string(),
        version,
    })
}
