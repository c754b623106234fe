//! Allocation schedules
//!
//! A schedule partitions the 24-hour day into intervals, each carrying a
//! mapping from priority threshold to a current cap in whole amperes:
//!
//! ```text
//! 00:00-05:59>0=48;06:00-16:59>0=16:3=32:5=48;17:00-20:59>0=0:5=48;21:00-23:59>0=32:5=48
//! ```
//!
//! Intervals are minute-granular, may not overlap, may not wrap midnight
//! and must cover the whole day. Thresholds within an interval are strictly
//! ascending. A session of priority `p` counts against the band keyed by
//! the greatest threshold `<= p`; `cap_at` returns that band's cap, or 0
//! when no threshold admits `p` (charging disabled for that priority).

use std::fmt;

use chrono::{NaiveTime, Timelike};

use crate::support::errors::ModelError;

const LAST_MINUTE: u16 = 23 * 60 + 59;

/// One `[start, end]` interval (inclusive minutes of day) with its
/// priority bands, ascending by threshold.
#[derive(Debug, Clone, PartialEq, Eq)]
struct Interval {
    start: u16,
    end: u16,
    bands: Vec<(i32, u32)>,
}

/// A parsed, validated allocation schedule.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Schedule {
    intervals: Vec<Interval>,
}

impl Schedule {
    /// Parse the text form. Fails on overlap, gap, non-ascending
    /// priorities or malformed tokens.
    pub fn parse(text: &str) -> Result<Self, ModelError> {
        let mut intervals = Vec::new();
        for part in text.split(';') {
            let part = part.trim();
            if part.is_empty() {
                continue;
            }
            intervals.push(parse_interval(part)?);
        }
        if intervals.is_empty() {
            return Err(ModelError::InvalidSchedule("empty schedule".into()));
        }

        intervals.sort_by_key(|i| i.start);

        // Coverage check: first at 00:00, contiguous, last at 23:59.
        if intervals[0].start != 0 {
            return Err(ModelError::InvalidSchedule(format!(
                "day not covered before {}",
                minute_str(intervals[0].start)
            )));
        }
        for pair in intervals.windows(2) {
            let (a, b) = (&pair[0], &pair[1]);
            if b.start <= a.end {
                return Err(ModelError::InvalidSchedule(format!(
                    "intervals overlap at {}",
                    minute_str(b.start)
                )));
            }
            if b.start != a.end + 1 {
                return Err(ModelError::InvalidSchedule(format!(
                    "gap between {} and {}",
                    minute_str(a.end),
                    minute_str(b.start)
                )));
            }
        }
        let last = intervals.last().expect("non-empty");
        if last.end != LAST_MINUTE {
            return Err(ModelError::InvalidSchedule(format!(
                "day not covered after {}",
                minute_str(last.end)
            )));
        }

        Ok(Self { intervals })
    }

    /// Cap for `priority` at `time`: the band keyed by the greatest
    /// threshold `<= priority`, 0 if none admits it.
    pub fn cap_at(&self, time: NaiveTime, priority: i32) -> u32 {
        let bands = self.bands_at(time);
        for (threshold, cap) in bands.iter().rev() {
            if priority >= *threshold {
                return *cap;
            }
        }
        0
    }

    /// The priority bands valid at `time`, ascending by threshold.
    /// Coverage is total, so this never comes back empty.
    pub fn bands_at(&self, time: NaiveTime) -> &[(i32, u32)] {
        let minute = (time.hour() * 60 + time.minute()) as u16;
        for interval in &self.intervals {
            if minute >= interval.start && minute <= interval.end {
                return &interval.bands;
            }
        }
        &[]
    }

    /// The overall group cap at `time`: the cap of the highest band.
    pub fn max_cap_at(&self, time: NaiveTime) -> u32 {
        self.bands_at(time).last().map(|(_, cap)| *cap).unwrap_or(0)
    }
}

fn parse_interval(text: &str) -> Result<Interval, ModelError> {
    let (range, bands_text) = text
        .split_once('>')
        .ok_or_else(|| ModelError::InvalidSchedule(format!("missing '>' in '{}'", text)))?;
    let (start_text, end_text) = range
        .split_once('-')
        .ok_or_else(|| ModelError::InvalidSchedule(format!("missing '-' in '{}'", range)))?;

    let start = parse_minute(start_text)?;
    let end = parse_minute(end_text)?;
    if end < start {
        return Err(ModelError::InvalidSchedule(format!(
            "interval '{}' wraps midnight",
            range
        )));
    }

    let mut bands = Vec::new();
    for token in bands_text.split(':') {
        let (prio_text, cap_text) = token
            .split_once('=')
            .ok_or_else(|| ModelError::InvalidSchedule(format!("malformed band '{}'", token)))?;
        let priority: i32 = prio_text
            .parse()
            .map_err(|_| ModelError::InvalidSchedule(format!("bad priority '{}'", prio_text)))?;
        let cap: u32 = cap_text
            .parse()
            .map_err(|_| ModelError::InvalidSchedule(format!("bad cap '{}'", cap_text)))?;
        if priority < 0 {
            return Err(ModelError::InvalidSchedule(format!(
                "negative priority '{}'",
                prio_text
            )));
        }
        if let Some((prev, _)) = bands.last() {
            if priority <= *prev {
                return Err(ModelError::InvalidSchedule(format!(
                    "priorities not ascending at '{}'",
                    token
                )));
            }
        }
        bands.push((priority, cap));
    }
    if bands.is_empty() {
        return Err(ModelError::InvalidSchedule(format!(
            "no bands in '{}'",
            text
        )));
    }

    Ok(Interval { start, end, bands })
}

fn parse_minute(text: &str) -> Result<u16, ModelError> {
    let (hh, mm) = text
        .split_once(':')
        .ok_or_else(|| ModelError::InvalidSchedule(format!("bad time '{}'", text)))?;
    let hours: u16 = hh
        .parse()
        .map_err(|_| ModelError::InvalidSchedule(format!("bad time '{}'", text)))?;
    let minutes: u16 = mm
        .parse()
        .map_err(|_| ModelError::InvalidSchedule(format!("bad time '{}'", text)))?;
    if hours > 23 || minutes > 59 {
        return Err(ModelError::InvalidSchedule(format!("bad time '{}'", text)));
    }
    Ok(hours * 60 + minutes)
}

fn minute_str(minute: u16) -> String {
    format!("{:02}:{:02}", minute / 60, minute % 60)
}

impl fmt::Display for Schedule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let parts: Vec<String> = self
            .intervals
            .iter()
            .map(|i| {
                let bands: Vec<String> = i
                    .bands
                    .iter()
                    .map(|(p, c)| format!("{}={}", p, c))
                    .collect();
                format!(
                    "{}-{}>{}",
                    minute_str(i.start),
                    minute_str(i.end),
                    bands.join(":")
                )
            })
            .collect();
        write!(f, "{}", parts.join(";"))
    }
}
