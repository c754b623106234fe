//! Allocator control loop
//!
//! One loop per allocation group. Every cycle handles the urgent work
//! (profile initialization for fresh connects, status resync, blocking
//! profile bookkeeping, new transactions); a full rebalancing pass runs
//! every `intervals_full` cycles, or immediately when a connector flags
//! itself for review.
//!
//! The loop never holds the registry lock across an OCPP call: it works
//! from snapshots, issues calls, and records accepted changes back.
//! Back-pressure lives in the command sender: a charger that times out
//! cools off for roughly one cycle, so this loop only needs to treat
//! `CoolingOff` as "try again next time".

use std::sync::Arc;
use std::time::Duration;

use chrono::{Local, Utc};
use tracing::{debug, info, warn};

use crate::allocator::plan::{plan, OfferChange, Plan};
use crate::config::AllocatorConfig;
use crate::model::snapshot::Snapshot;
use crate::model::ModelRegistry;
use crate::ocpp::commands::SharedCommandSender;
use crate::ocpp::profile;
use crate::support::errors::CommandError;
use crate::support::shutdown::ShutdownSignal;

pub struct AllocatorRunner {
    registry: Arc<ModelRegistry>,
    commands: SharedCommandSender,
    cfg: AllocatorConfig,
    shutdown: ShutdownSignal,
}

impl AllocatorRunner {
    pub fn new(
        registry: Arc<ModelRegistry>,
        commands: SharedCommandSender,
        cfg: AllocatorConfig,
        shutdown: ShutdownSignal,
    ) -> Self {
        Self {
            registry,
            commands,
            cfg,
            shutdown,
        }
    }

    /// Spawn one loop per allocation group. `run_interval = 0` disables
    /// smart charging; the caller checks that before calling here.
    pub fn spawn_all(self: Arc<Self>) {
        let snapshot = self.registry.snapshot(Utc::now());
        for group in snapshot.allocation_groups() {
            let runner = self.clone();
            let group_id = group.group_id.clone();
            info!(group_id = group_id.as_str(), "Starting smart charging loop");
            tokio::spawn(async move {
                runner.run_loop(group_id).await;
            });
        }
    }

    async fn run_loop(&self, group_id: String) {
        // Startup grace so chargers can reconnect first.
        tokio::select! {
            _ = tokio::time::sleep(Duration::from_secs(self.cfg.first_wait)) => {}
            _ = self.shutdown.notified().wait() => return,
        }

        let mut loop_count: u64 = 0;

        loop {
            tokio::select! {
                _ = tokio::time::sleep(Duration::from_secs(self.cfg.run_interval)) => {}
                _ = self.shutdown.notified().wait() => {
                    info!(group_id = group_id.as_str(), "Allocator loop shutting down");
                    return;
                }
            }
            loop_count += 1;

            let now = Utc::now();
            let snapshot = self.registry.snapshot(now);

            let urgent = self.has_urgent_work(&snapshot, &group_id);
            if loop_count % self.cfg.intervals_full != 0 && !urgent {
                continue;
            }
            if snapshot.allocator_suspended(&group_id) {
                debug!(group_id = group_id.as_str(), "Group suspended, skipping");
                continue;
            }

            debug!(
                group_id = group_id.as_str(),
                loop_count, urgent, "Allocator cycle"
            );

            // Fresh connects get their default profiles before anything
            // else; rebalancing waits a cycle so the charger settles.
            if self.initialize_chargers(&snapshot, &group_id).await {
                continue;
            }

            self.request_status(&snapshot, &group_id).await;
            self.reinstall_idle_blocking(&snapshot, &group_id).await;
            self.setup_new_transactions(&snapshot, &group_id).await;

            // Plan on a fresh snapshot: the steps above move offers.
            let now = Utc::now();
            let snapshot = self.registry.snapshot(now);
            let cycle_plan = plan(&snapshot, &group_id, now, Local::now().time(), &self.cfg);
            self.commit(&group_id, cycle_plan).await;

            for charger in snapshot.chargers_owned_by(&group_id) {
                self.registry.clear_review_flags(&charger.charger_id);
            }
        }
    }

    fn has_urgent_work(&self, snapshot: &Snapshot, group_id: &str) -> bool {
        snapshot.chargers_owned_by(group_id).iter().any(|c| {
            c.connected
                && (!c.profile_initialized
                    || !c.requested_status
                    || c.connectors.iter().any(|conn| conn.needs_review))
        })
    }

    /// Drive freshly connected chargers to the known profile baseline:
    /// clear defaults, blocking profile per connector, minimum profile.
    /// Returns true when any charger was initialized this cycle.
    async fn initialize_chargers(&self, snapshot: &Snapshot, group_id: &str) -> bool {
        let pending: Vec<_> = snapshot
            .chargers_owned_by(group_id)
            .into_iter()
            .filter(|c| c.connected && !c.profile_initialized)
            .cloned()
            .collect();
        if pending.is_empty() {
            return false;
        }

        for charger in pending {
            let charger_id = charger.charger_id.as_str();
            match profile::clear_all_default_profiles(&self.commands, charger_id).await {
                Ok(true) => {}
                Ok(false) => warn!(charger_id, "Clearing default profiles not accepted"),
                Err(e) => {
                    warn!(charger_id, error = %e, "Failed to clear default profiles");
                    continue;
                }
            }

            let mut all_ok = true;
            for conn in &charger.connectors {
                match profile::set_blocking_profile(&self.commands, charger_id, conn.connector_id)
                    .await
                {
                    Ok(true) => {
                        self.registry.set_blocking_profile_installed(
                            charger_id,
                            conn.connector_id,
                            true,
                        );
                    }
                    Ok(false) | Err(_) => {
                        warn!(
                            charger_id,
                            connector_id = conn.connector_id,
                            "Failed to set blocking profile"
                        );
                        all_ok = false;
                    }
                }
            }

            match profile::set_minimum_profile(&self.commands, charger_id, self.cfg.min_allocation)
                .await
            {
                Ok(true) => {}
                Ok(false) | Err(_) => {
                    warn!(charger_id, "Failed to set minimum profile");
                    all_ok = false;
                }
            }

            if all_ok {
                info!(charger_id, "Default profiles installed");
            }
            // Initialization is not retried endlessly on partial failure;
            // the profile pair is re-established at the next reconnect.
            self.registry.set_profile_initialized(charger_id, true);
        }
        true
    }

    /// Ask recently (re)connected chargers for a full status picture.
    async fn request_status(&self, snapshot: &Snapshot, group_id: &str) {
        for charger in snapshot.chargers_owned_by(group_id) {
            if !charger.connected || charger.requested_status {
                continue;
            }
            let charger_id = charger.charger_id.as_str();
            let _ = profile::trigger_boot_notification(&self.commands, charger_id).await;
            for conn in &charger.connectors {
                let _ = profile::trigger_status_notification(
                    &self.commands,
                    charger_id,
                    conn.connector_id,
                )
                .await;
            }
            let _ = profile::trigger_meter_values(&self.commands, charger_id).await;
            self.registry.set_requested_status(charger_id);
        }
    }

    /// Connectors that ended up outside a transaction with the blocking
    /// profile still cleared get it back. Not hard on errors; the profile
    /// may well be installed already.
    async fn reinstall_idle_blocking(&self, snapshot: &Snapshot, group_id: &str) {
        for charger in snapshot.chargers_owned_by(group_id) {
            if !charger.connected || self.commands.is_cooling_off(&charger.charger_id) {
                continue;
            }
            for conn in &charger.connectors {
                if conn.session.is_some()
                    || conn.status.is_transactional()
                    || conn.blocking_profile_installed
                {
                    continue;
                }
                match profile::set_blocking_profile(
                    &self.commands,
                    &charger.charger_id,
                    conn.connector_id,
                )
                .await
                {
                    Ok(true) => debug!(
                        charger_id = charger.charger_id.as_str(),
                        connector_id = conn.connector_id,
                        "Blocking profile reinstalled"
                    ),
                    Ok(false) | Err(_) => warn!(
                        charger_id = charger.charger_id.as_str(),
                        connector_id = conn.connector_id,
                        "Failed to reinstall blocking profile"
                    ),
                }
                // Recorded regardless; the next state change re-checks.
                self.registry.set_blocking_profile_installed(
                    &charger.charger_id,
                    conn.connector_id,
                    true,
                );
            }
        }
    }

    /// For sessions that just started: pin the current minimum as a
    /// TxProfile, then reinstate the blocking profile for the next
    /// session. The blocking profile does not affect the running
    /// transaction.
    async fn setup_new_transactions(&self, snapshot: &Snapshot, group_id: &str) {
        for charger in snapshot.chargers_owned_by(group_id) {
            if !charger.connected || self.commands.is_cooling_off(&charger.charger_id) {
                continue;
            }
            for conn in &charger.connectors {
                let Some(session) = conn.session.as_ref() else {
                    continue;
                };
                if conn.blocking_profile_installed {
                    continue;
                }
                let charger_id = charger.charger_id.as_str();
                match profile::set_tx_profile(
                    &self.commands,
                    charger_id,
                    conn.connector_id,
                    session.transaction_id,
                    self.cfg.min_allocation,
                )
                .await
                {
                    Ok(true) => {
                        self.registry.offer_change_implemented(
                            charger_id,
                            conn.connector_id,
                            self.cfg.min_allocation,
                            self.cfg.min_allocation,
                            None,
                            Utc::now(),
                        );
                        match profile::set_blocking_profile(
                            &self.commands,
                            charger_id,
                            conn.connector_id,
                        )
                        .await
                        {
                            Ok(true) => debug!(
                                charger_id,
                                connector_id = conn.connector_id,
                                "TxProfile pinned, blocking profile restored"
                            ),
                            Ok(false) | Err(_) => warn!(
                                charger_id,
                                connector_id = conn.connector_id,
                                "Failed to restore blocking profile after TxProfile"
                            ),
                        }
                    }
                    Ok(false) | Err(_) => warn!(
                        charger_id,
                        connector_id = conn.connector_id,
                        transaction_id = session.transaction_id,
                        "Initial TxProfile setup failed"
                    ),
                }
                self.registry.set_blocking_profile_installed(
                    charger_id,
                    conn.connector_id,
                    true,
                );
            }
        }
    }

    /// Implement a plan: plateaus recorded, reductions first, a grace
    /// before growth.
    async fn commit(&self, group_id: &str, cycle_plan: Plan) {
        if cycle_plan.is_empty() && cycle_plan.plateaus.is_empty() {
            return;
        }

        for plateau in &cycle_plan.plateaus {
            self.registry
                .set_plateau(&plateau.charger_id, plateau.connector_id, plateau.plateau);
        }

        let had_reduce = !cycle_plan.reduce.is_empty();
        for change in &cycle_plan.reduce {
            self.apply_change(change).await;
        }
        if had_reduce && !cycle_plan.grow.is_empty() {
            tokio::time::sleep(Duration::from_secs(self.cfg.wait_after_reduce)).await;
        }
        for change in &cycle_plan.grow {
            self.apply_change(change).await;
        }
        debug!(group_id, "Plan committed");
    }

    async fn apply_change(&self, change: &OfferChange) {
        let charger_id = change.charger_id.as_str();

        let result = match change.transaction_id {
            Some(transaction_id) => {
                profile::set_tx_profile(
                    &self.commands,
                    charger_id,
                    change.connector_id,
                    transaction_id,
                    change.allocation,
                )
                .await
            }
            // No transaction yet: steer through the blocking profile.
            None if change.allocation == 0 => {
                let result =
                    profile::set_blocking_profile(&self.commands, charger_id, change.connector_id)
                        .await;
                if matches!(result, Ok(true)) {
                    self.registry.set_blocking_profile_installed(
                        charger_id,
                        change.connector_id,
                        true,
                    );
                }
                result
            }
            None => {
                let result = profile::clear_blocking_profile(
                    &self.commands,
                    charger_id,
                    change.connector_id,
                )
                .await;
                if matches!(result, Ok(true)) {
                    self.registry.set_blocking_profile_installed(
                        charger_id,
                        change.connector_id,
                        false,
                    );
                }
                result
            }
        };

        match result {
            Ok(true) => {
                info!(
                    charger_id,
                    connector_id = change.connector_id,
                    allocation = change.allocation,
                    "Offer change implemented"
                );
                self.registry.offer_change_implemented(
                    charger_id,
                    change.connector_id,
                    change.allocation,
                    self.cfg.min_allocation,
                    change.suspend_until,
                    Utc::now(),
                );
            }
            Ok(false) => {
                warn!(
                    charger_id,
                    connector_id = change.connector_id,
                    allocation = change.allocation,
                    "Offer change rejected by charger, retrying next cycle"
                );
            }
            Err(CommandError::CoolingOff(_)) => {
                debug!(charger_id, "Charger cooling off, change deferred");
            }
            Err(CommandError::Timeout) => {
                warn!(charger_id, "Offer change timed out, charger cooling off");
            }
            Err(e) => {
                warn!(charger_id, error = %e, "Offer change failed, retrying next cycle");
            }
        }
    }
}
