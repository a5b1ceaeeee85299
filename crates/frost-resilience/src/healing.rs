//! Append-only healing ledger.
//!
//! Every recovery attempt is recorded as a diagnosis -> action -> outcome
//! event. Past events are never changed or removed; a correction is a new
//! event. Aggregations over the full history show which recovery actions
//! actually work for which failure categories.

use std::collections::BTreeMap;
use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::Path;
use std::sync::{Mutex, RwLock};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::diagnosis::Diagnosis;
use crate::error::ResilienceError;
use crate::taxonomy::{FailureCategory, RecoveryStrategy};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HealingOutcome {
    Success,
    Failure,
}

/// One recorded recovery attempt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealingEvent {
    /// Sequence number assigned when recorded.
    #[serde(default)]
    pub id: u64,
    pub diagnosis: Diagnosis,
    /// The recovery action actually taken.
    pub action: RecoveryStrategy,
    pub outcome: HealingOutcome,
    pub recorded_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub note: Option<String>,
}

impl HealingEvent {
    pub fn new(diagnosis: Diagnosis, action: RecoveryStrategy, outcome: HealingOutcome) -> Self {
        Self {
            id: 0,
            diagnosis,
            action,
            outcome,
            recorded_at: Utc::now(),
            note: None,
        }
    }

    pub fn with_note(mut self, note: impl Into<String>) -> Self {
        self.note = Some(note.into());
        self
    }

    pub fn category(&self) -> FailureCategory {
        self.diagnosis.category
    }

    pub fn succeeded(&self) -> bool {
        self.outcome == HealingOutcome::Success
    }
}

/// Success/failure tallies.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutcomeCounts {
    pub attempts: u64,
    pub successes: u64,
    pub failures: u64,
}

impl OutcomeCounts {
    fn add(&mut self, outcome: HealingOutcome) {
        self.attempts += 1;
        match outcome {
            HealingOutcome::Success => self.successes += 1,
            HealingOutcome::Failure => self.failures += 1,
        }
    }

    /// Fraction of successful attempts; `None` with no attempts.
    pub fn success_rate(&self) -> Option<f64> {
        (self.attempts > 0).then(|| self.successes as f64 / self.attempts as f64)
    }
}

/// Aggregate view over the whole ledger.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HealingSummary {
    pub total: u64,
    pub successes: u64,
    pub failures: u64,
    pub success_rate: f64,
    pub by_category: BTreeMap<FailureCategory, OutcomeCounts>,
    pub by_action: BTreeMap<RecoveryStrategy, OutcomeCounts>,
}

/// Append-only ledger of healing events, optionally mirrored to a JSON-lines file.
#[derive(Debug, Default)]
pub struct HealingLog {
    events: RwLock<Vec<HealingEvent>>,
    /// Held for the whole of `record`, so ids and file lines stay in order.
    sink: Mutex<Option<File>>,
}

impl HealingLog {
    /// In-memory ledger.
    pub fn new() -> Self {
        Self::default()
    }

    /// Ledger backed by a JSON-lines file; existing events are replayed.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, ResilienceError> {
        let path = path.as_ref();
        let mut events = Vec::new();

        if path.exists() {
            let reader = BufReader::new(File::open(path)?);
            for (index, line) in reader.lines().enumerate() {
                let line = line?;
                if line.trim().is_empty() {
                    continue;
                }
                match serde_json::from_str::<HealingEvent>(&line) {
                    Ok(event) => events.push(event),
                    Err(e) => {
                        warn!(path = %path.display(), line = index + 1, error = %e, "skipping malformed healing event");
                    }
                }
            }
        }

        let file = OpenOptions::new().create(true).append(true).open(path)?;
        info!(path = %path.display(), count = events.len(), "opened healing log");

        Ok(Self {
            events: RwLock::new(events),
            sink: Mutex::new(Some(file)),
        })
    }

    /// Append an event and return its sequence number.
    ///
    /// A file-backed log writes one line synchronously per event. Readers are
    /// not held up by the write; only concurrent `record` calls wait on it.
    pub fn record(&self, mut event: HealingEvent) -> Result<u64, ResilienceError> {
        let mut sink = self.sink.lock().unwrap_or_else(|e| e.into_inner());
        event.id = self
            .events
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .last()
            .map(|e| e.id + 1)
            .unwrap_or(1);

        if let Some(file) = sink.as_mut() {
            let line = serde_json::to_string(&event)?;
            writeln!(file, "{line}")?;
            file.flush()?;
        }

        match event.outcome {
            HealingOutcome::Success => info!(
                id = event.id,
                category = %event.category(),
                action = %event.action,
                "recovery succeeded"
            ),
            HealingOutcome::Failure => debug!(
                id = event.id,
                category = %event.category(),
                action = %event.action,
                "recovery failed"
            ),
        }

        let id = event.id;
        self.events
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .push(event);
        Ok(id)
    }

    pub fn len(&self) -> usize {
        self.events.read().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Copy of every event, oldest first.
    pub fn events(&self) -> Vec<HealingEvent> {
        self.events.read().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// Fraction of successful recoveries; `0.0` for an empty ledger.
    pub fn success_rate(&self) -> f64 {
        self.counts(|_| true).success_rate().unwrap_or(0.0)
    }

    /// Success rate for one category, if it has any history.
    pub fn success_rate_for(&self, category: FailureCategory) -> Option<f64> {
        self.counts(|e| e.category() == category).success_rate()
    }

    fn counts(&self, filter: impl Fn(&HealingEvent) -> bool) -> OutcomeCounts {
        let events = self.events.read().unwrap_or_else(|e| e.into_inner());
        let mut counts = OutcomeCounts::default();
        for event in events.iter().filter(|e| filter(e)) {
            counts.add(event.outcome);
        }
        counts
    }

    pub fn summary(&self) -> HealingSummary {
        let events = self.events.read().unwrap_or_else(|e| e.into_inner());
        let mut overall = OutcomeCounts::default();
        let mut by_category: BTreeMap<FailureCategory, OutcomeCounts> = BTreeMap::new();
        let mut by_action: BTreeMap<RecoveryStrategy, OutcomeCounts> = BTreeMap::new();

        for event in events.iter() {
            overall.add(event.outcome);
            by_category
                .entry(event.category())
                .or_default()
                .add(event.outcome);
            by_action.entry(event.action).or_default().add(event.outcome);
        }

        HealingSummary {
            total: overall.attempts,
            successes: overall.successes,
            failures: overall.failures,
            success_rate: overall.success_rate().unwrap_or(0.0),
            by_category,
            by_action,
        }
    }

    /// The action with the best observed success rate for `category`.
    ///
    /// Candidates are the category's mapped strategies followed by any other
    /// action seen for it; ties keep the earlier candidate. Without history
    /// the first mapped strategy is returned.
    pub fn recommend(&self, category: FailureCategory) -> RecoveryStrategy {
        let events = self.events.read().unwrap_or_else(|e| e.into_inner());
        let mut per_action: BTreeMap<RecoveryStrategy, OutcomeCounts> = BTreeMap::new();
        for event in events.iter().filter(|e| e.category() == category) {
            per_action.entry(event.action).or_default().add(event.outcome);
        }

        let mapped = category.strategies();
        let mut candidates: Vec<RecoveryStrategy> = mapped.to_vec();
        candidates.extend(per_action.keys().filter(|a| !mapped.contains(a)).copied());

        let mut best: Option<(RecoveryStrategy, f64)> = None;
        for action in candidates {
            let Some(rate) = per_action.get(&action).and_then(|c| c.success_rate()) else {
                continue;
            };
            if best.is_none_or(|(_, best_rate)| rate > best_rate) {
                best = Some((action, rate));
            }
        }

        best.map(|(action, _)| action)
            .or_else(|| mapped.first().copied())
            .unwrap_or(RecoveryStrategy::Escalate)
    }
}
