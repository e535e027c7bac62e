//! Handler progress across cycles.
//!
//! A [`HandlerState`] is never mutated: every outcome produces a new one. A
//! [`State`] is the set of handler states of one object for one cause.

use std::collections::{BTreeMap, BTreeSet};
use std::time::Duration;

use chrono::{DateTime, Utc};
use kreact_core::bodies::Body;
use kreact_core::causes::Reason;
use kreact_core::patches::Patch;
use kreact_persist::{ProgressRecord, ProgressStorage, StorageResult};

use crate::handlers::HandlerId;
use crate::outcomes::Outcome;

#[derive(Debug, Clone, PartialEq)]
pub struct HandlerState {
    pub started: DateTime<Utc>,
    pub stopped: Option<DateTime<Utc>>,
    pub delayed: Option<DateTime<Utc>>,
    pub purpose: Option<Reason>,
    pub retries: u32,
    pub success: bool,
    pub failure: bool,
    pub message: Option<String>,
    pub subrefs: Vec<HandlerId>,
    origin: Option<ProgressRecord>,
}

fn parse_reason(s: &str) -> Option<Reason> {
    serde_json::from_value(serde_json::Value::String(s.to_string())).ok()
}

fn to_std(d: chrono::Duration) -> Duration {
    d.to_std().unwrap_or(Duration::ZERO)
}

impl HandlerState {
    pub fn from_scratch(purpose: Option<Reason>, now: DateTime<Utc>) -> Self {
        Self {
            started: now,
            stopped: None,
            delayed: None,
            purpose,
            retries: 0,
            success: false,
            failure: false,
            message: None,
            subrefs: Vec::new(),
            origin: None,
        }
    }

    pub fn from_record(record: ProgressRecord, now: DateTime<Utc>) -> Self {
        Self {
            started: record.started.unwrap_or(now),
            stopped: record.stopped,
            delayed: record.delayed,
            purpose: record.purpose.as_deref().and_then(parse_reason),
            retries: record.retries,
            success: record.success,
            failure: record.failure,
            message: record.message.clone(),
            subrefs: record.subrefs.clone().unwrap_or_default(),
            origin: Some(record),
        }
    }

    pub fn as_record(&self) -> ProgressRecord {
        ProgressRecord {
            started: Some(self.started),
            stopped: self.stopped,
            delayed: self.delayed,
            purpose: self.purpose.map(|r| r.as_str().to_string()),
            retries: self.retries,
            success: self.success,
            failure: self.failure,
            message: self.message.clone(),
            subrefs: if self.subrefs.is_empty() { None } else { Some(self.subrefs.clone()) },
        }
    }

    /// Differs from what was read from storage (or was never stored).
    pub fn is_changed(&self) -> bool {
        self.origin.as_ref() != Some(&self.as_record())
    }

    pub fn finished(&self) -> bool {
        self.success || self.failure
    }

    pub fn sleeping(&self, now: DateTime<Utc>) -> bool {
        !self.finished() && self.delayed.map_or(false, |d| now < d)
    }

    pub fn awakened(&self, now: DateTime<Utc>) -> bool {
        !self.finished() && !self.sleeping(now)
    }

    /// Time left until the handler is due; zero when due now.
    pub fn delay(&self, now: DateTime<Utc>) -> Duration {
        self.delayed.map_or(Duration::ZERO, |d| to_std(d - now))
    }

    pub fn runtime(&self, now: DateTime<Utc>) -> Duration {
        to_std(now - self.started)
    }

    pub fn with_outcome(&self, outcome: &Outcome, now: DateTime<Utc>) -> Self {
        let mut subrefs: BTreeSet<HandlerId> = self.subrefs.iter().cloned().collect();
        subrefs.extend(outcome.subrefs.iter().cloned());
        Self {
            started: self.started,
            stopped: if outcome.is_final { Some(self.stopped.unwrap_or(now)) } else { self.stopped },
            delayed: outcome
                .delay
                .map(|d| now + chrono::Duration::from_std(d).unwrap_or_else(|_| chrono::Duration::zero())),
            purpose: self.purpose,
            retries: self.retries + 1,
            success: outcome.is_final && outcome.error.is_none(),
            failure: outcome.is_final && outcome.error.is_some(),
            message: outcome.error.as_ref().map(|e| e.to_string()),
            subrefs: subrefs.into_iter().collect(),
            origin: self.origin.clone(),
        }
    }
}

/// The handler states of one object for one cause.
#[derive(Debug, Clone, Default)]
pub struct State {
    states: BTreeMap<HandlerId, HandlerState>,
}

impl State {
    /// Read the states of the given handlers. Records started for another
    /// reason are stale and replaced with fresh states.
    pub fn load<'a>(
        body: &Body,
        storage: &dyn ProgressStorage,
        ids: impl IntoIterator<Item = &'a str>,
        purpose: Reason,
        now: DateTime<Utc>,
    ) -> StorageResult<State> {
        let mut states = BTreeMap::new();
        for id in ids {
            let state = match storage.fetch(id, body)? {
                Some(record) => {
                    let loaded = HandlerState::from_record(record, now);
                    if loaded.purpose.map_or(true, |p| p == purpose) {
                        loaded
                    } else {
                        HandlerState { origin: loaded.origin, ..HandlerState::from_scratch(Some(purpose), now) }
                    }
                }
                None => HandlerState::from_scratch(Some(purpose), now),
            };
            states.insert(id.to_string(), state);
        }
        Ok(State { states })
    }

    pub fn get(&self, id: &str) -> Option<&HandlerState> {
        self.states.get(id)
    }

    pub fn retries(&self, id: &str) -> u32 {
        self.states.get(id).map_or(0, |s| s.retries)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&HandlerId, &HandlerState)> {
        self.states.iter()
    }

    pub fn with_outcomes(&self, outcomes: &[(HandlerId, Outcome)], now: DateTime<Utc>) -> State {
        let mut states = self.states.clone();
        for (id, outcome) in outcomes {
            let base = states.get(id).cloned().unwrap_or_else(|| HandlerState::from_scratch(None, now));
            states.insert(id.clone(), base.with_outcome(outcome, now));
        }
        State { states }
    }

    pub fn store(&self, body: &Body, patch: &mut Patch, storage: &dyn ProgressStorage) {
        for (id, state) in &self.states {
            if state.is_changed() {
                storage.store(id, &state.as_record(), body, patch);
            }
        }
    }

    /// Forget all progress, sub-handlers included; the cause is fully handled.
    pub fn purge(&self, body: &Body, patch: &mut Patch, storage: &dyn ProgressStorage) {
        let mut ids: BTreeSet<&str> = BTreeSet::new();
        for (id, state) in &self.states {
            ids.insert(id);
            ids.extend(state.subrefs.iter().map(String::as_str));
        }
        for id in ids {
            storage.purge(id, body, patch);
        }
    }

    pub fn done(&self) -> bool {
        self.states.values().all(HandlerState::finished)
    }

    /// Remaining delays of the unfinished handlers; zero for those due now.
    pub fn delays(&self, now: DateTime<Utc>) -> Vec<Duration> {
        self.states.values().filter(|s| !s.finished()).map(|s| s.delay(now)).collect()
    }

    /// `(succeeded, failed, pending)` handler counts.
    pub fn counts(&self) -> (usize, usize, usize) {
        self.states.values().fold((0, 0, 0), |(ok, failed, pending), s| {
            if s.success {
                (ok + 1, failed, pending)
            } else if s.failure {
                (ok, failed + 1, pending)
            } else {
                (ok, failed, pending + 1)
            }
        })
    }
}
