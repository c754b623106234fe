//! Rebalancing algorithm
//!
//! `plan` is a pure function from a registry snapshot to the offer changes
//! one allocation group wants: reductions first (they free capacity),
//! growth second, plus the reclaim suspensions and EV-plateau detections
//! that go with them. Committing the changes is the runner's job; nothing
//! here touches the registry or the wire.
//!
//! Capacity accounting works in per-priority bands: a connector counts
//! against the band keyed by the greatest schedule threshold at or below
//! its priority, and the whole group is additionally bounded by the cap of
//! the highest band. Caps compound across nested allocation groups; a
//! candidate ampere must fit every enclosing allocation group's budget.

use std::collections::HashMap;

use chrono::{DateTime, Duration, NaiveTime, Timelike, Utc};
use tracing::debug;

use crate::config::AllocatorConfig;
use crate::model::charger::ConnectorStatus;
use crate::model::snapshot::Snapshot;

/// One offer change to implement over OCPP.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OfferChange {
    pub charger_id: String,
    pub connector_id: u32,
    /// `None` while no transaction exists yet: implemented by clearing
    /// (allocation > 0) or reinstalling (allocation == 0) the blocking
    /// profile instead of a TxProfile.
    pub transaction_id: Option<i32>,
    pub allocation: u32,
    /// Set on unused-offer reclamation: defer re-evaluation until then.
    pub suspend_until: Option<DateTime<Utc>>,
}

/// A newly observed per-session EV ceiling.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlateauCap {
    pub charger_id: String,
    pub connector_id: u32,
    pub plateau: u32,
}

#[derive(Debug, Default)]
pub struct Plan {
    /// Changes that free capacity. Implement these first.
    pub reduce: Vec<OfferChange>,
    /// Changes that use capacity. Implement after the reductions, plus a
    /// `wait_after_reduce` grace.
    pub grow: Vec<OfferChange>,
    pub plateaus: Vec<PlateauCap>,
}

impl Plan {
    pub fn is_empty(&self) -> bool {
        self.reduce.is_empty() && self.grow.is_empty()
    }
}

// ── Budget tracking ────────────────────────────────────────────

struct GroupBudget {
    /// Ascending (threshold, cap) bands for the current interval.
    bands: Vec<(i32, u32)>,
    used: Vec<u32>,
    total_used: u32,
    max_cap: u32,
}

impl GroupBudget {
    fn new(bands: &[(i32, u32)]) -> Self {
        Self {
            bands: bands.to_vec(),
            used: vec![0; bands.len()],
            total_used: 0,
            max_cap: bands.last().map(|(_, cap)| *cap).unwrap_or(0),
        }
    }

    /// Index of the band keyed by the greatest threshold `<= priority`.
    fn band_index(&self, priority: i32) -> Option<usize> {
        self.bands
            .iter()
            .rposition(|(threshold, _)| priority >= *threshold)
    }

    fn headroom(&self, priority: i32) -> u32 {
        match self.band_index(priority) {
            None => 0,
            Some(i) => {
                let band_room = self.bands[i].1.saturating_sub(self.used[i]);
                let total_room = self.max_cap.saturating_sub(self.total_used);
                band_room.min(total_room)
            }
        }
    }

    fn charge(&mut self, priority: i32, amount: u32) {
        if let Some(i) = self.band_index(priority) {
            self.used[i] += amount;
        }
        self.total_used += amount;
    }
}

struct Budget {
    groups: HashMap<String, GroupBudget>,
}

impl Budget {
    /// Build band budgets for every allocation group, pre-charged with the
    /// installed offers of connectors *not* owned by the group being
    /// planned (their offers are fixed from this group's point of view).
    fn new(snapshot: &Snapshot, planned_group: &str, time: NaiveTime) -> Self {
        let mut groups = HashMap::new();
        for group in snapshot.groups.values() {
            if let Some(schedule) = &group.schedule {
                groups.insert(
                    group.group_id.clone(),
                    GroupBudget::new(schedule.bands_at(time)),
                );
            }
        }

        let mut budget = Self { groups };
        for charger in &snapshot.chargers {
            let owned_here =
                charger.allocation_ancestors.first().map(String::as_str) == Some(planned_group);
            if owned_here {
                continue;
            }
            for conn in &charger.connectors {
                if conn.offer > 0 {
                    budget.charge(
                        &charger.allocation_ancestors,
                        conn.effective_priority,
                        conn.offer,
                    );
                }
            }
        }
        budget
    }

    fn fits(&self, ancestors: &[String], priority: i32, amount: u32) -> bool {
        ancestors.iter().all(|id| {
            self.groups
                .get(id)
                .map(|g| g.headroom(priority) >= amount)
                .unwrap_or(true)
        })
    }

    fn charge(&mut self, ancestors: &[String], priority: i32, amount: u32) {
        for id in ancestors {
            if let Some(g) = self.groups.get_mut(id) {
                g.charge(priority, amount);
            }
        }
    }
}

// ── Working state ──────────────────────────────────────────────

struct Work {
    charger_id: String,
    connector_id: u32,
    conn_max: u32,
    priority: i32,
    status: ConnectorStatus,
    offer: u32,
    last_offer_change: Option<DateTime<Utc>>,
    plateau: Option<u32>,
    rolling_max: f64,
    transaction_id: Option<i32>,
    energy_delivered: i64,
    usage_a: Option<f64>,
    ancestors: Vec<String>,
    allocation: u32,
    max: u32,
    done: bool,
    suspend_until_new: Option<DateTime<Utc>>,
}

impl Work {
    fn dwell(&self, now: DateTime<Utc>) -> Duration {
        self.last_offer_change
            .map(|t| now.signed_duration_since(t))
            .unwrap_or(Duration::MAX)
    }
}

/// Interval/2 before the next top of the hour.
fn next_top_of_hour(now: DateTime<Utc>, interval_secs: u64) -> DateTime<Utc> {
    let into_hour = (now.minute() * 60 + now.second()) as i64;
    now + Duration::seconds(3600 - into_hour) - Duration::seconds(interval_secs as i64 / 2)
}

/// Compute the offer changes for one allocation group.
pub fn plan(
    snapshot: &Snapshot,
    group_id: &str,
    now: DateTime<Utc>,
    local_time: NaiveTime,
    cfg: &AllocatorConfig,
) -> Plan {
    let mut result = Plan::default();
    let Some(group) = snapshot.groups.get(group_id) else {
        return result;
    };
    if group.schedule.is_none() {
        return result;
    }

    let mut budget = Budget::new(snapshot, group_id, local_time);

    // Collect working entries for eligible connectors. A connector whose
    // reclaim suspension has expired is an entry candidate again even if
    // the charger never refreshed its status.
    let mut works: Vec<Work> = Vec::new();
    for charger in snapshot.chargers_owned_by(group_id) {
        if !charger.connected || !charger.profile_initialized {
            continue;
        }
        for conn in &charger.connectors {
            let suspension_expired = conn
                .suspend_until
                .map(|t| now >= t)
                .unwrap_or(true);
            let eligible = conn.status.is_transactional()
                || (conn.status == ConnectorStatus::SuspendedEVSE
                    && conn.session.is_none()
                    && suspension_expired);
            if !eligible {
                continue;
            }
            if !suspension_expired {
                continue;
            }
            let status = if conn.status == ConnectorStatus::SuspendedEVSE {
                ConnectorStatus::Preparing
            } else {
                conn.status
            };
            works.push(Work {
                charger_id: charger.charger_id.clone(),
                connector_id: conn.connector_id,
                conn_max: charger.conn_max,
                priority: conn.effective_priority,
                status,
                offer: conn.offer,
                last_offer_change: conn.last_offer_change,
                plateau: conn.plateau,
                rolling_max: conn.rolling_max_usage,
                transaction_id: conn.session.as_ref().map(|s| s.transaction_id),
                energy_delivered: conn
                    .session
                    .as_ref()
                    .map(|s| s.energy_delivered_wh)
                    .unwrap_or(0),
                usage_a: conn.session.as_ref().and_then(|s| s.usage_a),
                ancestors: charger.allocation_ancestors.clone(),
                allocation: 0,
                max: 0,
                done: false,
                suspend_until_new: None,
            });
        }
    }

    let monitoring = Duration::seconds(cfg.usage_monitoring_interval as i64);
    let reclaim_dwell = Duration::seconds(cfg.suspended_allocation_timeout as i64);
    let increase_dwell = Duration::seconds(cfg.min_offer_increase_interval as i64);

    // ── Reductions and reclamation ─────────────────────────────
    for w in works.iter_mut() {
        // Unused-offer reclamation: a suspended EV that has drawn nothing
        // for the whole window loses its offer; re-evaluation is deferred.
        if w.status == ConnectorStatus::SuspendedEV
            && w.offer > 0
            && w.rolling_max < cfg.usage_threshold
            && w.dwell(now) > reclaim_dwell
        {
            w.allocation = 0;
            w.done = true;
            w.suspend_until_new = Some(if w.energy_delivered >= cfg.energy_threshold {
                now + Duration::seconds(cfg.suspended_delayed_time_not_first as i64)
            } else if cfg.suspend_top_of_hour {
                next_top_of_hour(now, cfg.suspended_allocation_timeout)
            } else {
                now + Duration::seconds(cfg.suspended_delayed_time as i64)
            });
            debug!(
                charger_id = w.charger_id.as_str(),
                connector_id = w.connector_id,
                "Reclaiming unused offer"
            );
            continue;
        }

        // Reduction: the EV has demonstrably stopped using the full offer.
        let plateau_breached = match (w.plateau, w.usage_a) {
            (Some(plateau), Some(usage)) => usage.ceil() as u32 > plateau,
            _ => false,
        };
        if w.status == ConnectorStatus::Charging
            && w.transaction_id.is_some()
            && w.usage_a.is_some()
            && w.dwell(now) > monitoring
            && w.offer >= cfg.min_allocation
            && w.rolling_max >= cfg.min_allocation as f64
            && w.rolling_max <= w.offer as f64 - cfg.margin_lower
            && !plateau_breached
        {
            // Smallest whole ampere strictly above observed usage.
            let target = ((w.rolling_max.floor() as u32) + 1).max(cfg.min_allocation);
            w.allocation = target;
            w.done = true;
            if w.plateau.map(|p| target < p).unwrap_or(true) {
                w.plateau = Some(target);
                result.plateaus.push(PlateauCap {
                    charger_id: w.charger_id.clone(),
                    connector_id: w.connector_id,
                    plateau: target,
                });
            }
        }
    }

    // ── Demand bands ───────────────────────────────────────────
    for w in works.iter_mut().filter(|w| !w.done) {
        let raw = if w.status == ConnectorStatus::SuspendedEV {
            // Keep a suspended EV at the minimum while the reclaim window
            // is still open.
            cfg.min_allocation
        } else if w.offer == 0 || w.transaction_id.is_none() {
            cfg.min_allocation
        } else if w.dwell(now) < increase_dwell {
            w.offer
        } else if (w.offer as f64 - w.rolling_max) < cfg.margin_increase {
            w.offer + cfg.max_offer_increase
        } else {
            w.offer
        };
        let capped = w.plateau.map(|p| raw.min(p)).unwrap_or(raw);
        w.max = capped.min(w.conn_max);
    }

    // Phase-1 outcomes consume budget before anything is handed out.
    for w in works.iter().filter(|w| w.done && w.allocation > 0) {
        budget.charge(&w.ancestors, w.priority, w.allocation);
    }

    // Reductions and reclaims settled above keep their scan order and are
    // emitted ahead of the allocation ordering below.
    let settled: Vec<usize> = works
        .iter()
        .enumerate()
        .filter(|(_, w)| w.done)
        .map(|(i, _)| i)
        .collect();

    // ── Ordering: priority, then fairness, then determinism ────
    let mut order: Vec<usize> = works
        .iter()
        .enumerate()
        .filter(|(_, w)| !w.done)
        .map(|(i, _)| i)
        .collect();
    order.sort_by(|&a, &b| {
        let (wa, wb) = (&works[a], &works[b]);
        wb.priority
            .cmp(&wa.priority)
            .then_with(|| {
                let ta = wa.last_offer_change.unwrap_or(DateTime::<Utc>::MIN_UTC);
                let tb = wb.last_offer_change.unwrap_or(DateTime::<Utc>::MIN_UTC);
                ta.cmp(&tb)
            })
            .then_with(|| wa.charger_id.cmp(&wb.charger_id))
            .then_with(|| wa.connector_id.cmp(&wb.connector_id))
    });

    // ── Initial allocation: the minimum for whoever fits ───────
    for &i in &order {
        let w = &mut works[i];
        if w.max >= cfg.min_allocation && budget.fits(&w.ancestors, w.priority, cfg.min_allocation)
        {
            w.allocation = cfg.min_allocation;
            let (ancestors, priority) = (w.ancestors.clone(), w.priority);
            budget.charge(&ancestors, priority, cfg.min_allocation);
        } else {
            w.allocation = 0;
            w.done = true;
        }
    }

    // ── Growth: whole amperes round-robin within the ordering ──
    loop {
        let mut progressed = false;
        for &i in &order {
            let w = &works[i];
            if w.done {
                continue;
            }
            if w.allocation >= w.max {
                works[i].done = true;
                continue;
            }
            if budget.fits(&w.ancestors, w.priority, 1) {
                let (ancestors, priority) = (w.ancestors.clone(), w.priority);
                works[i].allocation += 1;
                budget.charge(&ancestors, priority, 1);
                progressed = true;
            } else {
                works[i].done = true;
            }
        }
        if !progressed {
            break;
        }
    }

    // ── Diff against installed offers ──────────────────────────
    for &i in settled.iter().chain(order.iter()) {
        let w = &works[i];
        let change = OfferChange {
            charger_id: w.charger_id.clone(),
            connector_id: w.connector_id,
            transaction_id: w.transaction_id,
            allocation: w.allocation,
            suspend_until: w.suspend_until_new,
        };
        if w.allocation > w.offer {
            result.grow.push(change);
        } else if w.allocation < w.offer {
            result.reduce.push(change);
        }
        // Unchanged offers are silently dropped.
    }

    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::schedule::Schedule;
    use crate::model::snapshot::{
        ChargerSnapshot, ConnectorSnapshot, GroupSnapshot, SessionSnapshot,
    };
    use chrono::TimeZone;

    fn cfg() -> AllocatorConfig {
        AllocatorConfig::default()
    }

    fn noon() -> NaiveTime {
        NaiveTime::from_hms_opt(12, 0, 0).unwrap()
    }

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 2, 11, 12, 0).unwrap()
    }

    fn group(group_id: &str, parent: Option<&str>, schedule: Option<&str>) -> GroupSnapshot {
        GroupSnapshot {
            group_id: group_id.to_string(),
            parent_id: parent.map(String::from),
            schedule: schedule.map(|s| Schedule::parse(s).unwrap()),
            allocator_suspended: false,
        }
    }

    fn idle_connector(priority: i32) -> ConnectorSnapshot {
        ConnectorSnapshot {
            connector_id: 1,
            status: ConnectorStatus::Preparing,
            offer: 0,
            last_offer_change: None,
            suspend_until: None,
            plateau: None,
            rolling_max_usage: 0.0,
            blocking_profile_installed: true,
            needs_review: true,
            session: None,
            effective_priority: priority,
        }
    }

    fn charging_connector(
        priority: i32,
        offer: u32,
        rolling_max: f64,
        last_change_ago_secs: i64,
        transaction_id: i32,
    ) -> ConnectorSnapshot {
        ConnectorSnapshot {
            connector_id: 1,
            status: ConnectorStatus::Charging,
            offer,
            last_offer_change: Some(t0() - Duration::seconds(last_change_ago_secs)),
            suspend_until: None,
            plateau: None,
            rolling_max_usage: rolling_max,
            blocking_profile_installed: true,
            needs_review: false,
            session: Some(SessionSnapshot {
                transaction_id,
                energy_delivered_wh: 2000,
                usage_a: Some(rolling_max),
            }),
            effective_priority: priority,
        }
    }

    fn charger(
        charger_id: &str,
        ancestors: &[&str],
        conn_max: u32,
        connectors: Vec<ConnectorSnapshot>,
    ) -> ChargerSnapshot {
        ChargerSnapshot {
            charger_id: charger_id.to_string(),
            alias: charger_id.to_lowercase(),
            group_id: ancestors.first().unwrap_or(&"G").to_string(),
            conn_max,
            connected: true,
            profile_initialized: true,
            requested_status: true,
            allocation_ancestors: ancestors.iter().map(|s| s.to_string()).collect(),
            connectors,
        }
    }

    fn snapshot(groups: Vec<GroupSnapshot>, chargers: Vec<ChargerSnapshot>) -> Snapshot {
        Snapshot {
            taken_at: t0(),
            groups: groups.into_iter().map(|g| (g.group_id.clone(), g)).collect(),
            chargers,
        }
    }

    /// Check the committed-offer invariants for one group's schedule.
    fn assert_band_invariants(snapshot: &Snapshot, group_id: &str, time: NaiveTime) {
        let schedule = snapshot.groups[group_id].schedule.as_ref().unwrap();
        let bands = schedule.bands_at(time);
        let connectors: Vec<(&ConnectorSnapshot, u32)> = snapshot
            .chargers
            .iter()
            .filter(|c| c.allocation_ancestors.iter().any(|a| a == group_id))
            .flat_map(|c| c.connectors.iter().map(move |conn| (conn, c.conn_max)))
            .collect();

        let mut per_band: Vec<u32> = vec![0; bands.len()];
        let mut total = 0;
        for (conn, conn_max) in &connectors {
            assert!(conn.offer <= *conn_max, "offer exceeds conn_max");
            if !conn.status.is_transactional() {
                assert_eq!(conn.offer, 0, "offer outside transactional state");
            }
            if conn.offer > 0 {
                let idx = bands
                    .iter()
                    .rposition(|(t, _)| conn.effective_priority >= *t)
                    .expect("offer without an admitting band");
                per_band[idx] += conn.offer;
                total += conn.offer;
            }
        }
        for (i, (_, cap)) in bands.iter().enumerate() {
            assert!(per_band[i] <= *cap, "band {} over cap", i);
        }
        assert!(total <= bands.last().unwrap().1, "group over max cap");
    }

    /// Pretend the runner committed every change.
    fn apply(snapshot: &mut Snapshot, plan: &Plan, now: DateTime<Utc>, min_allocation: u32) {
        for change in plan.reduce.iter().chain(plan.grow.iter()) {
            let conn = snapshot
                .chargers
                .iter_mut()
                .find(|c| c.charger_id == change.charger_id)
                .unwrap()
                .connectors
                .iter_mut()
                .find(|c| c.connector_id == change.connector_id)
                .unwrap();
            conn.offer = change.allocation;
            if change.allocation >= min_allocation {
                conn.last_offer_change = Some(now);
                conn.rolling_max_usage = 0.0;
                conn.suspend_until = None;
            }
            if let Some(until) = change.suspend_until {
                conn.suspend_until = Some(until);
                conn.status = ConnectorStatus::SuspendedEVSE;
            }
        }
        for plateau in &plan.plateaus {
            let conn = snapshot
                .chargers
                .iter_mut()
                .find(|c| c.charger_id == plateau.charger_id)
                .unwrap()
                .connectors
                .iter_mut()
                .find(|c| c.connector_id == plateau.connector_id)
                .unwrap();
            conn.plateau = Some(plateau.plateau);
        }
    }

    #[test]
    fn first_pass_grants_minimum() {
        // Single charger, 24 A group: first full pass must land at 6 A.
        let snap = snapshot(
            vec![group("RR2", None, Some("00:00-23:59>0=24"))],
            vec![charger("RR2-01", &["RR2"], 32, vec![idle_connector(1)])],
        );
        let plan = plan(&snap, "RR2", t0(), noon(), &cfg());
        assert_eq!(plan.reduce.len(), 0);
        assert_eq!(plan.grow.len(), 1);
        assert_eq!(plan.grow[0].allocation, 6);
        assert_eq!(plan.grow[0].transaction_id, None);
    }

    #[test]
    fn growth_is_step_bounded_and_dwell_gated() {
        // Steady usage at the full offer grows by max_offer_increase once
        // the dwell has passed, and not before.
        let mut snap = snapshot(
            vec![group("RR2", None, Some("00:00-23:59>0=24"))],
            vec![charger(
                "RR2-01",
                &["RR2"],
                32,
                vec![charging_connector(1, 6, 6.0, 120, 11)],
            )],
        );
        let p = plan(&snap, "RR2", t0(), noon(), &cfg());
        assert_eq!(p.grow.len(), 1);
        assert_eq!(p.grow[0].allocation, 9);

        apply(&mut snap, &p, t0(), 6);
        assert_band_invariants(&snap, "RR2", noon());

        // Immediately after the commit the dwell gates any further growth.
        snap.chargers[0].connectors[0].rolling_max_usage = 9.0;
        snap.chargers[0].connectors[0].session.as_mut().unwrap().usage_a = Some(9.0);
        let p2 = plan(&snap, "RR2", t0() + Duration::seconds(10), noon(), &cfg());
        assert!(p2.is_empty());

        // After the dwell it steps again: 9 -> 12.
        let later = t0() + Duration::seconds(120);
        let p3 = plan(&snap, "RR2", later, noon(), &cfg());
        assert_eq!(p3.grow.len(), 1);
        assert_eq!(p3.grow[0].allocation, 12);
    }

    #[test]
    fn unused_headroom_is_reduced_not_grown() {
        // Offer 9, usage only 6.5: the EV is not consuming what it has.
        // With margin_lower 0.8 the slack is large enough to reduce.
        let snap = snapshot(
            vec![group("RR2", None, Some("00:00-23:59>0=24"))],
            vec![charger(
                "RR2-01",
                &["RR2"],
                32,
                vec![charging_connector(1, 9, 6.5, 400, 11)],
            )],
        );
        let p = plan(&snap, "RR2", t0(), noon(), &cfg());
        assert!(p.grow.is_empty());
        assert_eq!(p.reduce.len(), 1);
        assert_eq!(p.reduce[0].allocation, 7); // floor(6.5) + 1
    }

    #[test]
    fn priority_gating_blocks_low_priority_in_evening_window() {
        // 17:00-20:59>0=0:5=48 at 18:00: priority 1 gets nothing,
        // priority 5 grows toward its conn_max of 32.
        let evening = NaiveTime::from_hms_opt(18, 0, 0).unwrap();
        let schedule = "00:00-16:59>0=48;17:00-20:59>0=0:5=48;21:00-23:59>0=48";
        let mut snap = snapshot(
            vec![group("RR1", None, Some(schedule))],
            vec![
                charger("RR1-01", &["RR1"], 32, vec![idle_connector(1)]),
                charger("RR1-02", &["RR1"], 32, vec![idle_connector(5)]),
            ],
        );
        let p = plan(&snap, "RR1", t0(), evening, &cfg());
        assert_eq!(p.grow.len(), 1);
        assert_eq!(p.grow[0].charger_id, "RR1-02");
        assert_eq!(p.grow[0].allocation, 6);

        apply(&mut snap, &p, t0(), 6);
        assert_eq!(snap.chargers[0].connectors[0].offer, 0);
        assert_band_invariants(&snap, "RR1", evening);

        // Let the p5 session run at full draw past the dwell repeatedly:
        // it climbs in 3 A steps to its connector cap.
        let mut now = t0();
        snap.chargers[1].connectors[0].status = ConnectorStatus::Charging;
        snap.chargers[1].connectors[0].session = Some(SessionSnapshot {
            transaction_id: 21,
            energy_delivered_wh: 4000,
            usage_a: Some(6.0),
        });
        for _ in 0..12 {
            now += Duration::seconds(120);
            let offer = snap.chargers[1].connectors[0].offer;
            snap.chargers[1].connectors[0].rolling_max_usage = offer as f64;
            snap.chargers[1].connectors[0].session.as_mut().unwrap().usage_a =
                Some(offer as f64);
            let p = plan(&snap, "RR1", now, evening, &cfg());
            apply(&mut snap, &p, now, 6);
            assert_band_invariants(&snap, "RR1", evening);
        }
        assert_eq!(snap.chargers[1].connectors[0].offer, 32);
        assert_eq!(snap.chargers[0].connectors[0].offer, 0);
    }

    #[test]
    fn reduction_lands_strictly_above_usage() {
        // Offer 16, rolling max 10.0, margin_lower 0.8: reduce to 11 and
        // remember the plateau.
        let snap = snapshot(
            vec![group("RR2", None, Some("00:00-23:59>0=48"))],
            vec![charger(
                "RR2-01",
                &["RR2"],
                32,
                vec![charging_connector(1, 16, 10.0, 400, 11)],
            )],
        );
        let p = plan(&snap, "RR2", t0(), noon(), &cfg());
        assert_eq!(p.reduce.len(), 1);
        assert_eq!(p.reduce[0].allocation, 11);
        assert_eq!(p.reduce[0].transaction_id, Some(11));
        assert_eq!(p.plateaus.len(), 1);
        assert_eq!(p.plateaus[0].plateau, 11);
    }

    #[test]
    fn plateau_caps_future_growth() {
        let mut conn = charging_connector(1, 11, 11.0, 400, 11);
        conn.plateau = Some(11);
        let snap = snapshot(
            vec![group("RR2", None, Some("00:00-23:59>0=48"))],
            vec![charger("RR2-01", &["RR2"], 32, vec![conn])],
        );
        // Usage right at the offer would normally trigger growth; the
        // plateau pins it.
        let p = plan(&snap, "RR2", t0(), noon(), &cfg());
        assert!(p.is_empty());
    }

    #[test]
    fn unused_offer_is_reclaimed_with_deferral() {
        let mut conn = charging_connector(1, 6, 0.5, 400, 11);
        conn.status = ConnectorStatus::SuspendedEV;
        conn.session.as_mut().unwrap().energy_delivered_wh = 120; // below energy_threshold
        let snap = snapshot(
            vec![group("RR2", None, Some("00:00-23:59>0=24"))],
            vec![charger("RR2-01", &["RR2"], 32, vec![conn])],
        );
        let p = plan(&snap, "RR2", t0(), noon(), &cfg());
        assert_eq!(p.reduce.len(), 1);
        assert_eq!(p.reduce[0].allocation, 0);
        let until = p.reduce[0].suspend_until.expect("deferral set");
        assert!(until >= t0() + Duration::seconds(300));
    }

    #[test]
    fn reclaim_aligns_to_top_of_hour_for_first_session() {
        let mut config = cfg();
        config.suspend_top_of_hour = true;
        let mut conn = charging_connector(1, 6, 0.5, 400, 11);
        conn.status = ConnectorStatus::SuspendedEV;
        conn.session.as_mut().unwrap().energy_delivered_wh = 120;
        let snap = snapshot(
            vec![group("RR2", None, Some("00:00-23:59>0=24"))],
            vec![charger("RR2-01", &["RR2"], 32, vec![conn])],
        );
        let p = plan(&snap, "RR2", t0(), noon(), &config);
        let until = p.reduce[0].suspend_until.unwrap();
        // t0 is 11:12:00; next top is 12:00:00, minus 300/2 = 11:57:30.
        assert_eq!(until, Utc.with_ymd_and_hms(2026, 3, 2, 11, 57, 30).unwrap());
    }

    #[test]
    fn suspended_ev_within_window_keeps_minimum() {
        // Recently offered, usage zero: the reclaim dwell has not elapsed,
        // the connector keeps (or is trimmed to) the minimum.
        let mut conn = charging_connector(1, 9, 0.0, 60, 11);
        conn.status = ConnectorStatus::SuspendedEV;
        let snap = snapshot(
            vec![group("RR2", None, Some("00:00-23:59>0=24"))],
            vec![charger("RR2-01", &["RR2"], 32, vec![conn])],
        );
        let p = plan(&snap, "RR2", t0(), noon(), &cfg());
        assert_eq!(p.reduce.len(), 1);
        assert_eq!(p.reduce[0].allocation, 6);
        assert!(p.reduce[0].suspend_until.is_none());
    }

    #[test]
    fn suspended_connector_is_skipped_until_deferral_expires() {
        let mut conn = idle_connector(1);
        conn.status = ConnectorStatus::SuspendedEVSE;
        conn.suspend_until = Some(t0() + Duration::seconds(600));
        let snap = snapshot(
            vec![group("RR2", None, Some("00:00-23:59>0=24"))],
            vec![charger("RR2-01", &["RR2"], 32, vec![conn])],
        );
        let p = plan(&snap, "RR2", t0(), noon(), &cfg());
        assert!(p.is_empty());

        // After expiry the connector is an entry candidate again.
        let p = plan(&snap, "RR2", t0() + Duration::seconds(700), noon(), &cfg());
        assert_eq!(p.grow.len(), 1);
        assert_eq!(p.grow[0].allocation, 6);
    }

    #[test]
    fn group_budget_shared_fairly_under_contention() {
        // 24 A cap, four priority-1 connectors: 6 A each, no growth.
        let chargers: Vec<ChargerSnapshot> = (1..=4)
            .map(|i| {
                charger(
                    &format!("RR2-0{}", i),
                    &["RR2"],
                    32,
                    vec![charging_connector(1, 6, 6.0, 400, i)],
                )
            })
            .collect();
        let mut snap = snapshot(vec![group("RR2", None, Some("00:00-23:59>0=24"))], chargers);
        let p = plan(&snap, "RR2", t0(), noon(), &cfg());
        assert!(p.is_empty(), "cap exhausted, no growth expected");

        // One disconnects: the remaining three split the freed capacity
        // in whole amperes on the next pass.
        snap.chargers[3].connected = false;
        snap.chargers[3].connectors[0].offer = 0;
        snap.chargers[3].connectors[0].status = ConnectorStatus::Unknown;
        let p = plan(&snap, "RR2", t0(), noon(), &cfg());
        assert_eq!(p.grow.len(), 3);
        for change in &p.grow {
            assert_eq!(change.allocation, 8);
        }
        apply(&mut snap, &p, t0(), 6);
        assert_band_invariants(&snap, "RR2", noon());
    }

    #[test]
    fn nested_allocation_groups_compound() {
        // SITE caps everything at 10 A; SUB would allow 48. The SUB
        // charger must still fit SITE's budget next to SITE's own charger.
        let mut snap = snapshot(
            vec![
                group("SITE", None, Some("00:00-23:59>0=10")),
                group("SUB", Some("SITE"), Some("00:00-23:59>0=48")),
            ],
            vec![
                charger("CP-A", &["SITE"], 32, vec![idle_connector(1)]),
                charger("CP-B", &["SUB", "SITE"], 32, vec![idle_connector(1)]),
            ],
        );

        // SITE plans its own charger first.
        let p_site = plan(&snap, "SITE", t0(), noon(), &cfg());
        assert_eq!(p_site.grow.len(), 1);
        assert_eq!(p_site.grow[0].charger_id, "CP-A");
        apply(&mut snap, &p_site, t0(), 6);

        // SUB has 48 A of its own but only 4 A remain at SITE: the
        // minimum no longer fits, CP-B gets nothing.
        let p_sub = plan(&snap, "SUB", t0(), noon(), &cfg());
        assert!(p_sub.grow.is_empty());
        assert_band_invariants(&snap, "SITE", noon());
    }

    #[test]
    fn fairness_prefers_oldest_offer_change_then_charger_id() {
        // 12 A cap, three idle connectors: only two fit at the minimum.
        let mut c1 = charger("CP-B", &["G"], 32, vec![idle_connector(1)]);
        c1.connectors[0].last_offer_change = Some(t0() - Duration::seconds(50));
        let mut c2 = charger("CP-A", &["G"], 32, vec![idle_connector(1)]);
        c2.connectors[0].last_offer_change = Some(t0() - Duration::seconds(50));
        let mut c3 = charger("CP-C", &["G"], 32, vec![idle_connector(1)]);
        c3.connectors[0].last_offer_change = Some(t0() - Duration::seconds(500));

        let snap = snapshot(
            vec![group("G", None, Some("00:00-23:59>0=12"))],
            vec![c1, c2, c3],
        );
        let p = plan(&snap, "G", t0(), noon(), &cfg());
        let granted: Vec<&str> = p
            .grow
            .iter()
            .filter(|c| c.allocation > 0)
            .map(|c| c.charger_id.as_str())
            .collect();
        // Oldest change (CP-C) first, then CP-A beats CP-B on id.
        assert_eq!(granted, vec!["CP-C", "CP-A"]);
    }

    #[test]
    fn disabled_priority_band_admits_nobody() {
        let snap = snapshot(
            vec![group("G", None, Some("00:00-23:59>5=48"))],
            vec![charger("CP-A", &["G"], 32, vec![idle_connector(1)])],
        );
        let p = plan(&snap, "G", t0(), noon(), &cfg());
        assert!(p.is_empty());
    }

    #[test]
    fn uninitialized_chargers_are_left_alone() {
        let mut c = charger("CP-A", &["G"], 32, vec![idle_connector(1)]);
        c.profile_initialized = false;
        let snap = snapshot(vec![group("G", None, Some("00:00-23:59>0=24"))], vec![c]);
        assert!(plan(&snap, "G", t0(), noon(), &cfg()).is_empty());
    }

    #[test]
    fn conn_max_below_minimum_gets_nothing() {
        let snap = snapshot(
            vec![group("G", None, Some("00:00-23:59>0=24"))],
            vec![charger("CP-A", &["G"], 4, vec![idle_connector(1)])],
        );
        assert!(plan(&snap, "G", t0(), noon(), &cfg()).is_empty());
    }

    #[test]
    fn second_run_with_no_input_change_is_empty() {
        let mut snap = snapshot(
            vec![group("RR2", None, Some("00:00-23:59>0=24"))],
            vec![
                charger("RR2-01", &["RR2"], 32, vec![idle_connector(1)]),
                charger("RR2-02", &["RR2"], 32, vec![charging_connector(3, 6, 6.0, 400, 7)]),
            ],
        );
        let p1 = plan(&snap, "RR2", t0(), noon(), &cfg());
        assert!(!p1.is_empty());
        apply(&mut snap, &p1, t0(), 6);
        let p2 = plan(&snap, "RR2", t0(), noon(), &cfg());
        assert!(p2.is_empty(), "idempotent: {:?}", p2);
    }
}
