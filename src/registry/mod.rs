//! Target registry: the authoritative in-memory map of targets.
//!
//! Owned by the orchestrator task; every status move goes through
//! `set_status` (lifecycle edges) or the dispatch bookkeeping below, so no
//! caller can put a target into `active` without it having been `ready`,
//! `paused` or freshly prepared.
//!
//! Lifecycle:
//!   pending   → preparing → ready | active | error
//!   ready     → active
//!   active   ⇄ paused
//!   error     → pending

use crate::detect::{self, Change};
use crate::target::{Target, TargetId, TargetStatus};
use crate::worker::WorkerResult;
use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, HashMap};
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RegistryError {
    #[error("target not found: {0}")]
    NotFound(TargetId),
    #[error("duplicate target id: {0}")]
    Duplicate(TargetId),
    #[error("target {id} cannot move from {from} to {to}")]
    InvalidTransition {
        id: TargetId,
        from: TargetStatus,
        to: TargetStatus,
    },
    #[error("target {0} already has a worker in flight")]
    AlreadyInFlight(TargetId),
    #[error("target {id} is {status} and cannot be dispatched")]
    NotDispatchable { id: TargetId, status: TargetStatus },
}

/// Result of a `set_status` call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    Changed { from: TargetStatus, to: TargetStatus },
    Unchanged,
}

/// Why a worker is being run for a target.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchKind {
    /// First run, seeds `lastItemCount`.
    Prepare,
    /// Regular batch-tick run.
    Poll,
}

/// Outcome of applying a poll result.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollReport {
    pub previous: u64,
    pub current: u64,
    pub change: Change,
    pub consecutive_failures: u32,
}

#[derive(Debug, Default)]
pub struct TargetRegistry {
    targets: HashMap<TargetId, Target>,
}

impl TargetRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_targets(targets: Vec<Target>) -> Result<Self, RegistryError> {
        let mut registry = Self::new();
        for t in targets {
            registry.add(t)?;
        }
        Ok(registry)
    }

    pub fn add(&mut self, target: Target) -> Result<&Target, RegistryError> {
        use std::collections::hash_map::Entry;
        match self.targets.entry(target.id.clone()) {
            Entry::Occupied(_) => Err(RegistryError::Duplicate(target.id)),
            Entry::Vacant(slot) => Ok(slot.insert(target)),
        }
    }

    pub fn remove(&mut self, id: &TargetId) -> Result<Target, RegistryError> {
        self.targets
            .remove(id)
            .ok_or_else(|| RegistryError::NotFound(id.clone()))
    }

    pub fn get(&self, id: &TargetId) -> Option<&Target> {
        self.targets.get(id)
    }

    pub fn len(&self) -> usize {
        self.targets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.targets.is_empty()
    }

    /// All targets, oldest first.
    pub fn list(&self) -> Vec<&Target> {
        let mut all: Vec<&Target> = self.targets.values().collect();
        all.sort_by(|a, b| {
            a.timestamps
                .created_at
                .cmp(&b.timestamps.created_at)
                .then_with(|| a.id.cmp(&b.id))
        });
        all
    }

    pub fn list_by_status(&self, status: TargetStatus) -> Vec<&Target> {
        self.list()
            .into_iter()
            .filter(|t| t.status == status)
            .collect()
    }

    pub fn snapshot(&self) -> Vec<Target> {
        self.list().into_iter().cloned().collect()
    }

    pub fn counts_by_status(&self) -> BTreeMap<TargetStatus, usize> {
        let mut counts: BTreeMap<TargetStatus, usize> =
            TargetStatus::ALL.iter().map(|s| (*s, 0)).collect();
        for t in self.targets.values() {
            *counts.entry(t.status).or_default() += 1;
        }
        counts
    }

    pub fn in_flight_count(&self) -> usize {
        self.targets.values().filter(|t| t.in_flight()).count()
    }

    /// Move a target along a lifecycle edge. Setting the current status again
    /// is a no-op.
    pub fn set_status(
        &mut self,
        id: &TargetId,
        to: TargetStatus,
    ) -> Result<Transition, RegistryError> {
        let target = self.get_mut(id)?;
        let from = target.status;
        if from == to {
            return Ok(Transition::Unchanged);
        }
        if !from.can_transition(to) {
            return Err(RegistryError::InvalidTransition {
                id: id.clone(),
                from,
                to,
            });
        }
        target.status = to;
        Ok(Transition::Changed { from, to })
    }

    /// Mark a worker run as outstanding.
    ///
    /// `Prepare` needs a `pending` target and moves it to `preparing`; `Poll`
    /// needs an `active` one and bumps `processCount`. Either way a target
    /// that is already in flight is refused.
    pub fn begin_dispatch(
        &mut self,
        id: &TargetId,
        kind: DispatchKind,
    ) -> Result<&Target, RegistryError> {
        let target = self.get_mut(id)?;
        if target.runtime_flags.in_flight {
            return Err(RegistryError::AlreadyInFlight(id.clone()));
        }
        match kind {
            DispatchKind::Prepare => {
                if target.status != TargetStatus::Pending {
                    return Err(RegistryError::NotDispatchable {
                        id: id.clone(),
                        status: target.status,
                    });
                }
                target.status = TargetStatus::Preparing;
            }
            DispatchKind::Poll => {
                if target.status != TargetStatus::Active {
                    return Err(RegistryError::NotDispatchable {
                        id: id.clone(),
                        status: target.status,
                    });
                }
                target.counters.process_count += 1;
            }
        }
        target.runtime_flags.in_flight = true;
        Ok(target)
    }

    /// Apply a poll result. Status is left alone whatever the outcome.
    pub fn finish_poll(
        &mut self,
        id: &TargetId,
        result: &WorkerResult,
        now: DateTime<Utc>,
    ) -> Result<PollReport, RegistryError> {
        let target = self.get_mut(id)?;
        let previous = target.counters.last_item_count;
        let change = detect::classify(previous, result);

        target.runtime_flags.in_flight = false;
        target.timestamps.last_seen_at = Some(now);
        if result.is_success() {
            target.counters.last_item_count = result.item_count;
            target.counters.consecutive_failures = 0;
            target.last_error = None;
        } else {
            target.counters.consecutive_failures += 1;
            target.last_error = result.diagnostic.clone();
        }

        Ok(PollReport {
            previous,
            current: target.counters.last_item_count,
            change,
            consecutive_failures: target.counters.consecutive_failures,
        })
    }

    /// Apply a prepare result: seed the count and leave `preparing`.
    ///
    /// Success goes to `active` when the target starts "now" or activation
    /// was requested while preparing, otherwise to `ready`.
    pub fn finish_prepare(
        &mut self,
        id: &TargetId,
        result: &WorkerResult,
        activate: bool,
        now: DateTime<Utc>,
    ) -> Result<TargetStatus, RegistryError> {
        let target = self.get_mut(id)?;
        target.runtime_flags.in_flight = false;
        target.timestamps.last_seen_at = Some(now);

        if target.status != TargetStatus::Preparing {
            // repaired or removed-and-readded under our feet; keep what is there
            return Ok(target.status);
        }

        target.status = if result.is_success() {
            target.counters.last_item_count = result.item_count;
            target.counters.consecutive_failures = 0;
            target.last_error = None;
            if activate || target.schedule.start_at.is_now() {
                TargetStatus::Active
            } else {
                TargetStatus::Ready
            }
        } else {
            target.counters.consecutive_failures += 1;
            target.last_error = result.diagnostic.clone();
            TargetStatus::Error
        };
        Ok(target.status)
    }

    fn get_mut(&mut self, id: &TargetId) -> Result<&mut Target, RegistryError> {
        self.targets
            .get_mut(id)
            .ok_or_else(|| RegistryError::NotFound(id.clone()))
    }
}
