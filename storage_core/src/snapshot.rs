//! Snapshot name parsing (spec §3 "Snapshot timestamp parsing").
//!
//! Snapshot directory names under `.snapshots/` are timestamps. Two special
//! names are never timestamps and must be rejected before any parse attempt:
//! `working` (the in-progress snapshot) and any name containing `save`
//! (operator-pinned snapshots, exempt from retention).

use chrono::{DateTime, NaiveDateTime, Utc};

/// A parsed snapshot name: the original string plus its timestamp, if any.
#[derive(Debug, Clone, PartialEq)]
pub struct SnapshotName {
    pub raw: String,
    pub timestamp: DateTime<Utc>,
}

/// Returns `true` for names retention must never touch: the live `working`
/// tree and any `save`-tagged snapshot (spec §3, §4.3).
pub fn is_protected(name: &str) -> bool {
    name == "working" || name.contains("save")
}

/// Parse a snapshot directory name into a timestamp, trying formats in the
/// order the original agent does: ISO-8601 with fractional seconds, then
/// without, then a bare POSIX epoch float (spec §3).
///
/// Returns `None` for `working`/`save*` names and anything that matches
/// none of the three formats.
pub fn parse(name: &str) -> Option<SnapshotName> {
    if is_protected(name) {
        return None;
    }

    if let Ok(naive) = NaiveDateTime::parse_from_str(name, "%Y-%m-%dT%H:%M:%S%.f") {
        return Some(SnapshotName {
            raw: name.to_string(),
            timestamp: DateTime::from_utc(naive, Utc),
        });
    }

    if let Ok(naive) = NaiveDateTime::parse_from_str(name, "%Y-%m-%dT%H:%M:%S") {
        return Some(SnapshotName {
            raw: name.to_string(),
            timestamp: DateTime::from_utc(naive, Utc),
        });
    }

    if let Ok(epoch) = name.parse::<f64>() {
        let secs = epoch.trunc() as i64;
        let nanos = (epoch.fract() * 1_000_000_000.0).round() as u32;
        let naive = NaiveDateTime::from_timestamp_opt(secs, nanos)?;
        return Some(SnapshotName {
            raw: name.to_string(),
            timestamp: DateTime::from_utc(naive, Utc),
        });
    }

    None
}

/// Render a timestamp back to the canonical on-disk snapshot name, with
/// microsecond precision (spec §8 invariant 2: round-tripping a timestamp
/// through `format` then `parse` must be stable to microsecond precision).
pub fn format(ts: DateTime<Utc>) -> String {
    ts.format("%Y-%m-%dT%H:%M:%S%.6f").to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn working_and_save_names_are_protected_and_unparseable() {
        assert!(is_protected("working"));
        assert!(is_protected("2020-01-01T00:00:00-save"));
        assert!(parse("working").is_none());
        assert!(parse("manual-save-before-migration").is_none());
    }

    #[test]
    fn parses_iso_with_and_without_fraction() {
        let with_frac = parse("2021-06-15T08:30:00.123456").unwrap();
        assert_eq!(with_frac.timestamp, Utc.ymd(2021, 6, 15).and_hms_micro(8, 30, 0, 123456));

        let without_frac = parse("2021-06-15T08:30:00").unwrap();
        assert_eq!(without_frac.timestamp, Utc.ymd(2021, 6, 15).and_hms(8, 30, 0));
    }

    #[test]
    fn parses_epoch_float() {
        let parsed = parse("1623745800.5").unwrap();
        assert_eq!(parsed.timestamp.timestamp(), 1623745800);
    }

    #[test]
    fn garbage_is_unparseable() {
        assert!(parse("not-a-timestamp").is_none());
    }

    #[test]
    fn format_then_parse_round_trips_to_microsecond_precision() {
        let ts = Utc.ymd(2022, 3, 4).and_hms_micro(5, 6, 7, 891_234);
        let name = format(ts);
        let reparsed = parse(&name).unwrap();
        assert_eq!(reparsed.timestamp, ts);
    }
}
