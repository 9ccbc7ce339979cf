use chrono::{DateTime, NaiveDateTime, Utc};
use uuid::Uuid;

/// Agent id assigned to orphan positions discovered during reconciliation.
pub const UNOWNED_AGENT_ID: Uuid = Uuid::nil();

/// Fixed-width UTC timestamp format stored in TEXT columns.
///
/// Fixed width keeps lexicographic ordering equal to chronological ordering,
/// which the stale-heartbeat and stale-pending queries rely on.
const TS_FORMAT: &str = "%Y-%m-%d %H:%M:%S%.6f";

pub fn format_ts(ts: DateTime<Utc>) -> String {
    ts.format(TS_FORMAT).to_string()
}

pub fn parse_ts(raw: &str) -> Option<DateTime<Utc>> {
    NaiveDateTime::parse_from_str(raw, TS_FORMAT)
        .ok()
        .map(|naive| naive.and_utc())
}
