//! Charging sessions
//!
//! A `ChargingSession` is a live transaction on a connector. When it ends
//! it is archived as a `ClosedSession` and, when history is enabled,
//! appended to the sessions CSV file.

use std::fs::OpenOptions;
use std::path::Path;

use chrono::{DateTime, Local, Utc};
use tracing::info;

use crate::support::errors::ConfigError;

/// One `(timestamp, offer)` transition. `None` records an offer being
/// dropped without a known replacement value (disconnect, fault).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OfferRecord {
    pub timestamp: DateTime<Utc>,
    pub offered: Option<u32>,
}

/// A live transaction.
#[derive(Debug, Clone)]
pub struct ChargingSession {
    pub transaction_id: i32,
    pub id_tag: String,
    pub user_name: Option<String>,
    pub start_time: DateTime<Utc>,
    /// Meter reading at start (Wh).
    pub meter_start: i64,
    /// Cumulative meter reading (Wh), updated by MeterValues.
    pub energy_wh: i64,
    /// Last reported maximum phase current (A).
    pub usage_a: Option<f64>,
    pub last_usage_time: DateTime<Utc>,
    /// Per-session priority override (tag or API); `None` defers to the
    /// charger/group/config chain.
    pub priority: Option<i32>,
    pub history: Vec<OfferRecord>,
}

impl ChargingSession {
    pub fn new(
        transaction_id: i32,
        id_tag: impl Into<String>,
        user_name: Option<String>,
        start_time: DateTime<Utc>,
        meter_start: i64,
        priority: Option<i32>,
    ) -> Self {
        Self {
            transaction_id,
            id_tag: id_tag.into(),
            user_name,
            start_time,
            meter_start,
            energy_wh: meter_start,
            usage_a: None,
            last_usage_time: start_time,
            priority,
            history: Vec::new(),
        }
    }

    /// Energy delivered so far (Wh).
    pub fn energy_delivered_wh(&self) -> i64 {
        self.energy_wh - self.meter_start
    }

    pub fn record_offer(&mut self, timestamp: DateTime<Utc>, offered: Option<u32>) {
        self.history.push(OfferRecord { timestamp, offered });
    }
}

/// An archived session, one row in sessions.csv.
#[derive(Debug, Clone)]
pub struct ClosedSession {
    pub session_id: String,
    pub charger_id: String,
    pub charger_alias: String,
    pub group_id: String,
    pub id_tag: String,
    pub user_name: Option<String>,
    pub stop_id_tag: Option<String>,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    pub energy_wh: i64,
    pub stop_reason: Option<String>,
    pub history: Vec<OfferRecord>,
}

impl ClosedSession {
    pub fn close(
        session: ChargingSession,
        charger_id: &str,
        charger_alias: &str,
        group_id: &str,
        meter_stop: i64,
        end_time: DateTime<Utc>,
        stop_reason: Option<String>,
        stop_id_tag: Option<String>,
    ) -> Self {
        let session_id = format!(
            "{}-{}",
            charger_id,
            session
                .start_time
                .with_timezone(&Local)
                .format("%Y-%m-%d-%H:%M:%S")
        );
        Self {
            session_id,
            charger_id: charger_id.to_string(),
            charger_alias: charger_alias.to_string(),
            group_id: group_id.to_string(),
            id_tag: session.id_tag,
            user_name: session.user_name,
            stop_id_tag,
            start_time: session.start_time,
            end_time,
            energy_wh: meter_stop - session.meter_start,
            stop_reason,
            history: session.history,
        }
    }

    pub fn duration_str(&self) -> String {
        let total = self
            .end_time
            .signed_duration_since(self.start_time)
            .num_seconds()
            .max(0);
        format!("{:02}:{:02}:{:02}", total / 3600, (total % 3600) / 60, total % 60)
    }

    pub fn kwh_str(&self) -> String {
        format!("{:.3}", self.energy_wh as f64 / 1000.0)
    }

    /// `;`-joined `TIMESTAMP=<N>A` tuples, `None` for a cleared offer.
    pub fn history_str(&self) -> String {
        self.history
            .iter()
            .map(|record| {
                let offered = match record.offered {
                    Some(a) => format!("{}A", a),
                    None => "None".to_string(),
                };
                format!(
                    "{}={}",
                    record.timestamp.with_timezone(&Local).format("%Y-%m-%d %H:%M:%S"),
                    offered
                )
            })
            .collect::<Vec<_>>()
            .join(";")
    }
}

/// Append-only writer for sessions.csv. Flushes after every row; there is
/// no further durability guarantee.
pub struct SessionHistoryWriter {
    writer: csv::Writer<std::fs::File>,
}

const SESSION_CSV_HEADER: [&str; 13] = [
    "session_id",
    "charger_id",
    "charger_alias",
    "group_id",
    "id_tag",
    "user_name",
    "stop_id_tag",
    "start_time",
    "end_time",
    "duration",
    "energy",
    "stop_reason",
    "history",
];

impl SessionHistoryWriter {
    /// Open the sessions file, writing the header if the file is new.
    pub fn open(path: &Path) -> Result<Self, ConfigError> {
        let is_new = !path.exists();
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .map_err(|source| ConfigError::Io {
                path: path.display().to_string(),
                source,
            })?;
        let mut writer = csv::WriterBuilder::new().from_writer(file);
        if is_new {
            writer
                .write_record(SESSION_CSV_HEADER)
                .map_err(|e| ConfigError::Csv {
                    path: path.display().to_string(),
                    message: e.to_string(),
                })?;
        }
        info!(path = %path.display(), "Appending completed sessions");
        Ok(Self { writer })
    }

    pub fn append(&mut self, session: &ClosedSession) {
        let row = [
            session.session_id.clone(),
            session.charger_id.clone(),
            session.charger_alias.clone(),
            session.group_id.clone(),
            session.id_tag.clone(),
            session.user_name.clone().unwrap_or_default(),
            session.stop_id_tag.clone().unwrap_or_default(),
            session
                .start_time
                .with_timezone(&Local)
                .format("%Y-%m-%d %H:%M:%S")
                .to_string(),
            session
                .end_time
                .with_timezone(&Local)
                .format("%Y-%m-%d %H:%M:%S")
                .to_string(),
            session.duration_str(),
            session.kwh_str(),
            session.stop_reason.clone().unwrap_or_default(),
            session.history_str(),
        ];
        if let Err(e) = self.writer.write_record(row) {
            tracing::warn!(error = %e, "Failed to append session row");
        }
        let _ = self.writer.flush();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn sample_closed() -> ClosedSession {
        let start = Utc.with_ymd_and_hms(2026, 3, 1, 9, 0, 0).unwrap();
        let mut session = ChargingSession::new(7, "E08CEE18", Some("roadrunner".into()), start, 1000, None);
        session.record_offer(start, Some(6));
        session.record_offer(start + chrono::Duration::seconds(300), Some(9));
        session.record_offer(start + chrono::Duration::seconds(4000), None);
        session.record_offer(start + chrono::Duration::seconds(4100), Some(0));
        session.energy_wh = 5500;
        ClosedSession::close(
            session,
            "CP-1",
            "RR2-01",
            "RR2",
            5500,
            start + chrono::Duration::seconds(4100),
            Some("Local".into()),
            None,
        )
    }

    #[test]
    fn energy_and_duration_formatting() {
        let closed = sample_closed();
        assert_eq!(closed.energy_wh, 4500);
        assert_eq!(closed.kwh_str(), "4.500");
        assert_eq!(closed.duration_str(), "01:08:20");
    }

    #[test]
    fn history_serializes_offers_and_none() {
        let closed = sample_closed();
        let history = closed.history_str();
        let parts: Vec<&str> = history.split(';').collect();
        assert_eq!(parts.len(), 4);
        assert!(parts[0].ends_with("=6A"));
        assert!(parts[1].ends_with("=9A"));
        assert!(parts[2].ends_with("=None"));
        assert!(parts[3].ends_with("=0A"));
    }

    #[test]
    fn history_timestamps_are_monotonic() {
        let closed = sample_closed();
        let mut previous = None;
        for record in &closed.history {
            if let Some(prev) = previous {
                assert!(record.timestamp >= prev);
            }
            previous = Some(record.timestamp);
        }
        // Final entry is the offer at stop time.
        assert_eq!(closed.history.last().unwrap().offered, Some(0));
    }

    #[test]
    fn writer_appends_rows() {
        let dir = std::env::temp_dir().join("ampshare_sessions_test");
        let _ = std::fs::create_dir_all(&dir);
        let path = dir.join("sessions.csv");
        let _ = std::fs::remove_file(&path);

        {
            let mut writer = SessionHistoryWriter::open(&path).unwrap();
            writer.append(&sample_closed());
        }
        {
            let mut writer = SessionHistoryWriter::open(&path).unwrap();
            writer.append(&sample_closed());
        }

        let content = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = content.lines().collect();
        assert_eq!(lines.len(), 3); // header + 2 rows
        assert!(lines[0].starts_with("session_id,"));
        let _ = std::fs::remove_dir_all(&dir);
    }
}
