use std::collections::VecDeque;
use std::sync::Mutex;

use serde::Serialize;
use serde_json::Value;

/// Direction of a logged frame relative to the broker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum Direction {
    FromClient,
    ToClient,
    FromExtension,
    ToExtension,
    ClientLifecycle,
    ExtensionLifecycle,
}

impl Direction {
    /// All directions, in counting order.
    pub const ALL: [Self; 6] = [
        Self::FromClient,
        Self::ToClient,
        Self::FromExtension,
        Self::ToExtension,
        Self::ClientLifecycle,
        Self::ExtensionLifecycle,
    ];

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::FromClient => "fromClient",
            Self::ToClient => "toClient",
            Self::FromExtension => "fromExtension",
            Self::ToExtension => "toExtension",
            Self::ClientLifecycle => "clientLifecycle",
            Self::ExtensionLifecycle => "extensionLifecycle",
        }
    }

    fn index(self) -> usize {
        match self {
            Self::FromClient => 0,
            Self::ToClient => 1,
            Self::FromExtension => 2,
            Self::ToExtension => 3,
            Self::ClientLifecycle => 4,
            Self::ExtensionLifecycle => 5,
        }
    }
}

/// One logged frame or lifecycle note.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LogEntry {
    /// Monotonic, gap-free sequence number. Never reused.
    pub seq: u64,
    /// Observation time, simplified ISO 8601.
    pub timestamp: String,
    pub direction: Direction,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub client_id: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub client_label: Option<String>,
    /// The frame or lifecycle payload, opaque to the ring.
    pub message: Value,
}

/// Result of a [`LogRing::since`] query.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LogQuery {
    pub entries: Vec<LogEntry>,
    pub latest_seq: u64,
    /// True when the reader's cursor has been overrun by eviction: entries
    /// the reader never saw are gone and it must restart from `latest_seq`.
    pub reset_required: bool,
}

struct RingInner {
    entries: VecDeque<LogEntry>,
    next_seq: u64,
    counts: [u64; 6],
}

/// Bounded, sequenced log of all brokered frames and connection lifecycle.
///
/// Appends are O(1); overflow evicts the oldest entry. `seq` is strictly
/// increasing and reflects observation order at the broker. A single lock
/// serializes appends so readers always observe a consistent prefix.
pub struct LogRing {
    inner: Mutex<RingInner>,
    capacity: usize,
}

impl LogRing {
    /// Create a ring holding at most `capacity` entries (minimum 1).
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            inner: Mutex::new(RingInner {
                entries: VecDeque::with_capacity(capacity),
                next_seq: 1,
                counts: [0; 6],
            }),
            capacity,
        }
    }

    /// Append an entry, assigning the next sequence number.
    ///
    /// Returns the assigned `seq`.
    pub fn append(
        &self,
        direction: Direction,
        client_id: Option<u64>,
        client_label: Option<&str>,
        message: Value,
    ) -> u64 {
        let timestamp = now_iso8601();
        let mut inner = self.inner.lock().expect("log ring lock poisoned");
        let seq = inner.next_seq;
        inner.next_seq += 1;
        inner.counts[direction.index()] += 1;
        if inner.entries.len() == self.capacity {
            inner.entries.pop_front();
        }
        inner.entries.push_back(LogEntry {
            seq,
            timestamp,
            direction,
            client_id,
            client_label: client_label.map(str::to_owned),
            message,
        });
        seq
    }

    /// Return entries with `seq > after`, up to `limit`.
    ///
    /// `reset_required` is true when entries after the reader's cursor have
    /// already been evicted, i.e. the cursor no longer points into a
    /// contiguous retained prefix.
    #[must_use]
    pub fn since(&self, after: u64, limit: usize) -> LogQuery {
        let inner = self.inner.lock().expect("log ring lock poisoned");
        let latest_seq = inner.next_seq - 1;
        let first_retained = inner.next_seq - inner.entries.len() as u64;
        let reset_required = after + 1 < first_retained;
        let entries = inner
            .entries
            .iter()
            .filter(|e| e.seq > after)
            .take(limit)
            .cloned()
            .collect();
        LogQuery {
            entries,
            latest_seq,
            reset_required,
        }
    }

    /// Per-direction totals since process start (unaffected by eviction).
    #[must_use]
    pub fn counts(&self) -> Vec<(&'static str, u64)> {
        let inner = self.inner.lock().expect("log ring lock poisoned");
        Direction::ALL
            .iter()
            .map(|d| (d.as_str(), inner.counts[d.index()]))
            .collect()
    }

    /// The most recently assigned sequence number (0 if nothing logged yet).
    #[must_use]
    pub fn latest_seq(&self) -> u64 {
        self.inner.lock().expect("log ring lock poisoned").next_seq - 1
    }
}

/// Format the current time as a simplified ISO 8601 string.
#[must_use]
pub fn now_iso8601() -> String {
    use std::time::{SystemTime, UNIX_EPOCH};

    let secs = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs();

    format_unix_secs(secs)
}

// Howard Hinnant's algorithm for civil date from days since epoch.
#[allow(
    clippy::similar_names,
    clippy::cast_possible_wrap,
    clippy::cast_possible_truncation,
    clippy::cast_sign_loss
)]
fn format_unix_secs(secs: u64) -> String {
    let day_secs = secs % 86_400;
    let hours = day_secs / 3_600;
    let minutes = (day_secs % 3_600) / 60;
    let seconds = day_secs % 60;

    let mut days = (secs / 86_400) as i64;
    days += 719_468; // shift epoch from 1970-01-01 to 0000-03-01
    let era = if days >= 0 { days } else { days - 146_096 } / 146_097;
    let day_of_era = (days - era * 146_097) as u32; // [0, 146096]
    let year_of_era =
        (day_of_era - day_of_era / 1460 + day_of_era / 36524 - day_of_era / 146_096) / 365;
    let y = i64::from(year_of_era) + era * 400;
    let day_of_year = day_of_era - (365 * year_of_era + year_of_era / 4 - year_of_era / 100);
    let mp = (5 * day_of_year + 2) / 153;
    let d = day_of_year - (153 * mp + 2) / 5 + 1;
    let m = if mp < 10 { mp + 3 } else { mp - 9 };
    let y = if m <= 2 { y + 1 } else { y };

    format!("{y:04}-{m:02}-{d:02}T{hours:02}:{minutes:02}:{seconds:02}Z")
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn fill(ring: &LogRing, n: u64) {
        for i in 0..n {
            ring.append(Direction::FromClient, None, None, json!({ "n": i }));
        }
    }

    // --- append / seq ---

    #[test]
    fn seq_starts_at_one_and_is_gap_free() {
        let ring = LogRing::new(10);
        assert_eq!(ring.append(Direction::FromClient, None, None, json!({})), 1);
        assert_eq!(ring.append(Direction::ToClient, None, None, json!({})), 2);
        let q = ring.since(0, 100);
        let seqs: Vec<u64> = q.entries.iter().map(|e| e.seq).collect();
        assert_eq!(seqs, vec![1, 2]);
    }

    #[test]
    fn overflow_evicts_oldest() {
        let ring = LogRing::new(3);
        fill(&ring, 5);
        let q = ring.since(0, 100);
        let seqs: Vec<u64> = q.entries.iter().map(|e| e.seq).collect();
        assert_eq!(seqs, vec![3, 4, 5]);
        assert_eq!(q.latest_seq, 5);
    }

    #[test]
    fn seq_never_reused_after_eviction() {
        let ring = LogRing::new(2);
        fill(&ring, 4);
        let next = ring.append(Direction::FromExtension, None, None, json!({}));
        assert_eq!(next, 5);
    }

    // --- since / reset_required ---

    #[test]
    fn since_returns_entries_after_cursor() {
        let ring = LogRing::new(10);
        fill(&ring, 5);
        let q = ring.since(3, 100);
        let seqs: Vec<u64> = q.entries.iter().map(|e| e.seq).collect();
        assert_eq!(seqs, vec![4, 5]);
        assert!(!q.reset_required);
    }

    #[test]
    fn since_respects_limit() {
        let ring = LogRing::new(10);
        fill(&ring, 5);
        let q = ring.since(0, 2);
        assert_eq!(q.entries.len(), 2);
        assert_eq!(q.latest_seq, 5);
    }

    #[test]
    fn reset_required_after_overrun() {
        let ring = LogRing::new(5);
        fill(&ring, 10);
        // Retained: 6..=10. A cursor at 0 has lost entries 1..=5.
        let q = ring.since(0, 100);
        assert!(q.reset_required);
        assert_eq!(q.latest_seq, 10);
    }

    #[test]
    fn cursor_at_retained_boundary_is_not_reset() {
        let ring = LogRing::new(5);
        fill(&ring, 10);
        // Retained: 6..=10; a cursor at 5 can still read contiguously.
        let q = ring.since(5, 100);
        assert!(!q.reset_required);
        assert_eq!(q.entries.len(), 5);
    }

    #[test]
    fn fresh_cursor_on_fresh_ring_is_not_reset() {
        let ring = LogRing::new(5);
        let q = ring.since(0, 100);
        assert!(!q.reset_required);
        assert!(q.entries.is_empty());
        assert_eq!(q.latest_seq, 0);
    }

    #[test]
    fn cursor_at_latest_returns_empty_then_resumes() {
        let ring = LogRing::new(5);
        fill(&ring, 10);
        let latest = ring.latest_seq();
        let q = ring.since(latest, 100);
        assert!(q.entries.is_empty());
        assert!(!q.reset_required);

        ring.append(Direction::ToExtension, None, None, json!({}));
        let q = ring.since(latest, 100);
        assert_eq!(q.entries.len(), 1);
        assert_eq!(q.entries[0].seq, latest + 1);
    }

    #[test]
    fn since_entries_have_no_gaps() {
        let ring = LogRing::new(100);
        fill(&ring, 50);
        for after in [0u64, 10, 25, 49] {
            let q = ring.since(after, 1000);
            for pair in q.entries.windows(2) {
                assert_eq!(pair[1].seq, pair[0].seq + 1, "gap after seq {}", pair[0].seq);
            }
        }
    }

    // --- counts ---

    #[test]
    fn counts_survive_eviction() {
        let ring = LogRing::new(2);
        fill(&ring, 10);
        ring.append(Direction::ToClient, None, None, json!({}));
        let counts = ring.counts();
        let get = |name: &str| counts.iter().find(|(n, _)| *n == name).unwrap().1;
        assert_eq!(get("fromClient"), 10);
        assert_eq!(get("toClient"), 1);
        assert_eq!(get("toExtension"), 0);
    }

    // --- serialization ---

    #[test]
    fn entry_serializes_camel_case() {
        let ring = LogRing::new(2);
        ring.append(
            Direction::ClientLifecycle,
            Some(3),
            Some("probe"),
            json!({"event": "connected"}),
        );
        let q = ring.since(0, 10);
        let value = serde_json::to_value(&q).unwrap();
        assert_eq!(value["entries"][0]["direction"], "clientLifecycle");
        assert_eq!(value["entries"][0]["clientId"], 3);
        assert_eq!(value["entries"][0]["clientLabel"], "probe");
        assert!(value["latestSeq"].is_u64());
        assert_eq!(value["resetRequired"], false);
    }

    // --- time formatting ---

    #[test]
    fn format_unix_epoch() {
        assert_eq!(format_unix_secs(0), "1970-01-01T00:00:00Z");
    }

    #[test]
    fn format_known_timestamp() {
        assert_eq!(format_unix_secs(1_000_000_000), "2001-09-09T01:46:40Z");
    }
}
