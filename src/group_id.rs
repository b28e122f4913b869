//! # Group Ids — Canonical Observation Timestamps
//!
//! Observation groups are keyed by a fixed-width, zero-padded ISO-8601
//! timestamp (`YYYY-MM-DDTHH:MM:SS`). Because every id has the same width,
//! lexical order of the strings equals chronological order, which lets the
//! store answer "which groups lie within ±T seconds" with a plain
//! `group_id BETWEEN $lo AND $hi` range scan on the primary key.
//!
//! Subband files follow the naming convention
//! `2025-10-02T00:12:00_sb05.hdf5` (timestamp, `_sb`, two-digit index).

use crate::error::PipelineError;
use chrono::{Duration, NaiveDateTime};
use std::path::Path;

/// `strftime` layout of a canonical group id.
pub const GROUP_ID_FORMAT: &str = "%Y-%m-%dT%H:%M:%S";

const GROUP_ID_LEN: usize = 19;

/// Parse a group id, accepting a space in place of the `T` separator.
pub fn parse_group_id(raw: &str) -> Result<NaiveDateTime, PipelineError> {
    let trimmed = raw.trim();
    if trimmed.len() != GROUP_ID_LEN {
        return Err(PipelineError::validation(format!(
            "group id '{}' is not a {}-character timestamp",
            raw, GROUP_ID_LEN
        )));
    }
    let normalized = trimmed.replacen(' ', "T", 1);
    NaiveDateTime::parse_from_str(&normalized, GROUP_ID_FORMAT).map_err(|e| {
        PipelineError::validation(format!("group id '{}' is not a timestamp: {}", raw, e))
    })
}

pub fn format_group_id(ts: &NaiveDateTime) -> String {
    ts.format(GROUP_ID_FORMAT).to_string()
}

/// Normalize a candidate id to the canonical fixed-width form.
pub fn normalize_group_id(raw: &str) -> Result<String, PipelineError> {
    parse_group_id(raw).map(|ts| format_group_id(&ts))
}

/// Inclusive `[lo, hi]` id range within `tolerance_s` of `candidate`.
///
/// Fractional tolerances are truncated to whole seconds, the resolution of
/// the id format.
pub fn tolerance_window(candidate: &str, tolerance_s: f64) -> Result<(String, String), PipelineError> {
    if !tolerance_s.is_finite() || tolerance_s < 0.0 {
        return Err(PipelineError::validation(format!(
            "cluster tolerance must be a non-negative number of seconds, got {}",
            tolerance_s
        )));
    }
    let ts = parse_group_id(candidate)?;
    let delta = Duration::seconds(tolerance_s.trunc() as i64);
    Ok((format_group_id(&(ts - delta)), format_group_id(&(ts + delta))))
}

/// Absolute distance between two ids in whole seconds.
pub fn seconds_between(a: &str, b: &str) -> Result<i64, PipelineError> {
    let ta = parse_group_id(a)?;
    let tb = parse_group_id(b)?;
    Ok((ta - tb).num_seconds().abs())
}

/// Extract `(group_id, subband_index)` from a subband file name.
///
/// Returns `None` for anything not shaped like `<timestamp>_sbNN.hdf5`.
pub fn parse_subband_filename(path: &Path) -> Option<(String, u32)> {
    let name = path.file_name()?.to_str()?;
    let stem = name.strip_suffix(".hdf5")?;
    let (timestamp, index) = stem.rsplit_once("_sb")?;
    if index.len() != 2 || !index.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    let group_id = normalize_group_id(timestamp).ok()?;
    // The id must already be canonical in the file name, not merely parseable.
    if group_id != timestamp {
        return None;
    }
    Some((group_id, index.parse().ok()?))
}

/// Canonical file name for a subband of `group_id`.
pub fn build_subband_filename(group_id: &str, subband_index: u32) -> String {
    format!("{}_sb{:02}.hdf5", group_id, subband_index)
}
