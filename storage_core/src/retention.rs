//! The snapshot retention DSL evaluator (spec §4.3).
//!
//! Input: a comma-separated retention string and a list of on-disk snapshot
//! names. Output: the subset to delete. Each directive contributes a
//! keep-set; the final delete-set is every parseable snapshot not kept by
//! any directive, unless the union keep-set is empty, in which case nothing
//! is deleted (a malformed retention string must never erase history).
//!
//! Two behaviours below are preserved verbatim from the original agent
//! rather than fixed:
//!  - `earliest of N week` steps back in week-sized increments but then
//!    snaps each step to the first of that calendar month before comparing,
//!    which looks like a transcription error from the monthly branch. It is
//!    reproduced here rather than corrected.
//!  - `fortnight` is only ever handled by a string-rewrite the parser's
//!    regex never actually reaches, so `earliest of N fortnight` fails to
//!    parse like any other unrecognized directive. It is genuinely dead
//!    syntax, not a supported period.

use std::collections::BTreeSet;

use chrono::{DateTime, Datelike, Duration, TimeZone, Utc};
use regex::Regex;

use crate::snapshot::{is_protected, SnapshotName};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Period {
    Day,
    Week,
    Month,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Directive {
    LastSnapshots(u32),
    LastDays(u32),
    EarliestOf(u32, Period),
}

/// Parse one retention directive. Whitespace-insensitive, case-insensitive.
/// `N` defaults to 1 when omitted from `earliest of (day|week|month)`.
/// `fortnight` is deliberately absent from the period alternation: the
/// original only rewrites it to `week` with doubled N from inside a branch
/// this regex never matches, so it is unparseable here too.
pub fn parse_directive(line: &str) -> Option<Directive> {
    let line = line.trim().to_lowercase();

    let last_re = Regex::new(r"^last\s+(\d+)\s+(day|snapshot)s?$").unwrap();
    if let Some(caps) = last_re.captures(&line) {
        let n: u32 = caps[1].parse().ok()?;
        return Some(match &caps[2] {
            "day" => Directive::LastDays(n),
            "snapshot" => Directive::LastSnapshots(n),
            _ => unreachable!(),
        });
    }

    let earliest_re = Regex::new(r"^earliest\s+of\s+(?:(\d+)\s+)?(day|week|month)s?$").unwrap();
    if let Some(caps) = earliest_re.captures(&line) {
        let n: u32 = caps.get(1).map(|m| m.as_str().parse().unwrap()).unwrap_or(1);
        let period = match &caps[2] {
            "day" => Period::Day,
            "week" => Period::Week,
            "month" => Period::Month,
            _ => unreachable!(),
        };
        return Some(Directive::EarliestOf(n, period));
    }

    None
}

/// Evaluate a full retention policy (comma-separated directives) against a
/// set of snapshot names, returning the raw names to delete.
pub fn evaluate(policy: &str, snapshots: &[SnapshotName], now: DateTime<Utc>) -> BTreeSet<String> {
    let directives: Vec<Directive> = policy
        .split(',')
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .filter_map(parse_directive)
        .collect();

    let mut parsed: Vec<&SnapshotName> = snapshots.iter().filter(|s| !is_protected(&s.raw)).collect();
    parsed.sort_by_key(|s| s.timestamp);

    let mut keep: BTreeSet<String> = BTreeSet::new();
    for directive in &directives {
        keep.extend(apply_directive(*directive, &parsed, now));
    }

    if keep.is_empty() {
        return BTreeSet::new();
    }

    parsed
        .iter()
        .filter(|s| !keep.contains(&s.raw))
        .map(|s| s.raw.clone())
        .collect()
}

fn apply_directive(directive: Directive, parsed: &[&SnapshotName], now: DateTime<Utc>) -> BTreeSet<String> {
    match directive {
        Directive::LastSnapshots(n) => parsed.iter().rev().take(n as usize).map(|s| s.raw.clone()).collect(),
        Directive::LastDays(n) => {
            let cutoff = now - Duration::days(i64::from(n));
            parsed
                .iter()
                .filter(|s| s.timestamp >= cutoff)
                .map(|s| s.raw.clone())
                .collect()
        }
        Directive::EarliestOf(n, period) => {
            let cutoff = earliest_of_cutoff(n, period, now);
            let mut keep = BTreeSet::new();
            if let Some(earliest) = parsed.iter().find(|s| s.timestamp >= cutoff) {
                keep.insert(earliest.raw.clone());
            }
            keep
        }
    }
}

fn midnight(dt: DateTime<Utc>) -> DateTime<Utc> {
    Utc.ymd(dt.year(), dt.month(), dt.day()).and_hms(0, 0, 0)
}

fn first_of_month(dt: DateTime<Utc>) -> DateTime<Utc> {
    Utc.ymd(dt.year(), dt.month(), 1).and_hms(0, 0, 0)
}

fn previous_month_first(dt: DateTime<Utc>) -> DateTime<Utc> {
    if dt.month() == 1 {
        Utc.ymd(dt.year() - 1, 12, 1).and_hms(0, 0, 0)
    } else {
        Utc.ymd(dt.year(), dt.month() - 1, 1).and_hms(0, 0, 0)
    }
}

fn earliest_of_cutoff(n: u32, period: Period, now: DateTime<Utc>) -> DateTime<Utc> {
    match period {
        Period::Day => midnight(now) - Duration::days(i64::from(n.saturating_sub(1))),
        Period::Month => {
            let mut cutoff = first_of_month(now);
            for _ in 1..n {
                cutoff = previous_month_first(cutoff);
            }
            cutoff
        }
        Period::Week => {
            // Week treated as ending on Sunday: step back (weekday+1)%7 days
            // from midnight today, where Monday = 0 .. Sunday = 6.
            let weekday = now.weekday().num_days_from_monday() as i64;
            let offset = (weekday + 1) % 7;
            let mut cutoff = midnight(now) - Duration::days(offset);
            for _ in 1..n {
                // Preserved anomaly: steps back a week, then snaps to that
                // month's first day instead of the previous week's start.
                cutoff = first_of_month(cutoff - Duration::weeks(1));
            }
            cutoff
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn snap(raw: &str) -> SnapshotName {
        SnapshotName { raw: raw.to_string(), timestamp: Utc.datetime_from_str(raw, "%Y-%m-%dT%H:%M:%S").unwrap() }
    }

    #[test]
    fn parses_last_and_earliest_directives() {
        assert_eq!(parse_directive("last 7 day"), Some(Directive::LastDays(7)));
        assert_eq!(parse_directive("last 10 snapshot"), Some(Directive::LastSnapshots(10)));
        assert_eq!(parse_directive("earliest of 4 week"), Some(Directive::EarliestOf(4, Period::Week)));
        assert_eq!(parse_directive("earliest of month"), Some(Directive::EarliestOf(1, Period::Month)));
        assert_eq!(parse_directive("nonsense"), None);
    }

    #[test]
    fn fortnight_is_dead_syntax() {
        assert_eq!(parse_directive("earliest of 2 fortnight"), None);
    }

    #[test]
    fn scenario_s1_retention_by_weekday() {
        let now = Utc.ymd(2024, 1, 8).and_hms(12, 0, 0);
        let snaps = vec![
            snap("2024-01-01T00:00:00"),
            snap("2024-01-05T00:00:00"),
            snap("2024-01-06T00:00:00"),
            snap("2024-01-07T00:00:00"),
            snap("2024-01-08T00:00:00"),
        ];
        let deleted = evaluate("last 3 snapshot, earliest of 1 week", &snaps, now);
        let expected: BTreeSet<String> =
            vec!["2024-01-01T00:00:00".to_string(), "2024-01-05T00:00:00".to_string()].into_iter().collect();
        assert_eq!(deleted, expected);
    }

    #[test]
    fn scenario_s2_empty_keep_set_deletes_nothing() {
        let now = Utc.ymd(2024, 3, 1).and_hms(0, 0, 0);
        let snaps = vec![snap("2024-01-01T00:00:00"), snap("2024-01-02T00:00:00")];
        let deleted = evaluate("earliest of 1 day", &snaps, now);
        assert!(deleted.is_empty());
    }

    #[test]
    fn protected_names_are_never_in_the_delete_set() {
        let now = Utc.ymd(2024, 1, 10).and_hms(0, 0, 0);
        let snaps = vec![
            SnapshotName { raw: "working".to_string(), timestamp: now },
            snap("2024-01-01T00:00:00"),
        ];
        let deleted = evaluate("last 1 snapshot", &snaps, now);
        assert!(!deleted.contains("working"));
    }

    #[test]
    fn last_n_days_keeps_everything_newer_than_the_threshold() {
        let now = Utc.ymd(2024, 1, 10).and_hms(0, 0, 0);
        let snaps = vec![
            snap("2024-01-01T00:00:00"),
            snap("2024-01-09T00:00:00"),
            snap("2024-01-10T00:00:00"),
        ];
        let deleted = evaluate("last 2 day", &snaps, now);
        assert_eq!(deleted, vec!["2024-01-01T00:00:00".to_string()].into_iter().collect());
    }
}
