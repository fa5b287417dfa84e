//! Modification times, local and remote.

use std::path::Path;

use chrono::{DateTime, NaiveDateTime, TimeDelta, Utc};
use filetime::FileTime;

use crate::TransferError;

/// Modification time of a local file, `None` if it cannot be read.
pub fn local_mtime(path: &Path) -> Option<DateTime<Utc>> {
    let modified = std::fs::metadata(path).ok()?.modified().ok()?;
    Some(DateTime::<Utc>::from(modified))
}

pub fn set_local_mtime(path: &Path, time: DateTime<Utc>) -> Result<(), TransferError> {
    let ft = FileTime::from_unix_time(time.timestamp(), time.timestamp_subsec_nanos());
    filetime::set_file_mtime(path, ft)?;
    Ok(())
}

/// Moves a time by a server's timezone offset in minutes.
pub(crate) fn shift(time: DateTime<Utc>, minutes: i32) -> DateTime<Utc> {
    time + TimeDelta::minutes(i64::from(minutes))
}

/// Parses `YYYYMMDDHHMMSS` with an optional `.fff` fraction, as UTC.
pub(crate) fn parse_compact(s: &str) -> Option<DateTime<Utc>> {
    let s = s.trim();
    let (whole, fraction) = match s.split_once('.') {
        Some((w, f)) => (w, Some(f)),
        None => (s, None),
    };
    if whole.len() != 14 || !whole.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    let mut time = NaiveDateTime::parse_from_str(whole, "%Y%m%d%H%M%S")
        .ok()?
        .and_utc();
    if let Some(f) = fraction {
        if f.is_empty() || !f.bytes().all(|b| b.is_ascii_digit()) {
            return None;
        }
        let digits = &f[..f.len().min(3)];
        let millis: i64 = digits.parse().ok()?;
        time += TimeDelta::milliseconds(millis * 10i64.pow(3 - digits.len() as u32));
    }
    Some(time)
}

pub(crate) fn format_compact(time: DateTime<Utc>) -> String {
    time.format("%Y%m%d%H%M%S").to_string()
}

pub(crate) fn from_unix_seconds(secs: i64) -> Option<DateTime<Utc>> {
    DateTime::from_timestamp(secs, 0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn compact_round_trip() {
        let t = Utc.with_ymd_and_hms(2024, 2, 29, 13, 5, 9).unwrap();
        assert_eq!(format_compact(t), "20240229130509");
        assert_eq!(parse_compact("20240229130509"), Some(t));
    }

    #[test]
    fn compact_fraction() {
        let t = parse_compact("20240101000000.5").unwrap();
        assert_eq!(t.timestamp_subsec_millis(), 500);
        let t = parse_compact("20240101000000.123456").unwrap();
        assert_eq!(t.timestamp_subsec_millis(), 123);
    }

    #[test]
    fn compact_rejects_garbage() {
        assert_eq!(parse_compact("2024"), None);
        assert_eq!(parse_compact("20241301000000"), None);
        assert_eq!(parse_compact("2024010100000x"), None);
        assert_eq!(parse_compact("20240101000000."), None);
    }

    #[test]
    fn shift_by_offset() {
        let t = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        assert_eq!(shift(t, -90), Utc.with_ymd_and_hms(2023, 12, 31, 22, 30, 0).unwrap());
    }

    #[test]
    fn set_and_read_local_mtime() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("f");
        std::fs::write(&path, b"x").unwrap();
        let t = Utc.with_ymd_and_hms(2001, 9, 9, 1, 46, 40).unwrap();
        set_local_mtime(&path, t).unwrap();
        assert_eq!(local_mtime(&path), Some(t));
        assert_eq!(local_mtime(&dir.path().join("missing")), None);
        assert!(set_local_mtime(&dir.path().join("missing"), t).is_err());
    }
}
