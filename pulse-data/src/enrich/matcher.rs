use crate::{
    event::{AggregateOutcome, MigrationOutcome, TokenEvent},
    social::SocialOutcome,
    stream::MigrationStatCache,
};
use chrono::{DateTime, Utc};
use derive_more::Display;
use parking_lot::Mutex;
use std::{collections::VecDeque, time::Duration};
use tokio::task::JoinHandle;
use tracing::warn;

/// Lifecycle of one event inside the scheduler.
///
/// `New -> AwaitingSecondary -> {Matched | TimedOut} -> Emitted`, where an event that
/// matches (or gives up) on first sight skips `AwaitingSecondary`.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Display)]
pub enum Phase {
    #[display("new")]
    New,
    #[display("awaiting_secondary")]
    AwaitingSecondary,
    #[display("matched")]
    Matched,
    #[display("timed_out")]
    TimedOut,
    #[display("emitted")]
    Emitted,
}

impl Phase {
    pub fn can_advance_to(self, next: Phase) -> bool {
        matches!(
            (self, next),
            (Phase::New, Phase::AwaitingSecondary | Phase::Matched | Phase::TimedOut)
                | (Phase::AwaitingSecondary, Phase::Matched | Phase::TimedOut)
                | (Phase::Matched | Phase::TimedOut, Phase::Emitted)
        )
    }
}

/// Handles of the lookups spawned when the event was first seen.
#[derive(Debug)]
pub struct LookupHandles {
    pub social: JoinHandle<(Option<String>, SocialOutcome)>,
    pub aggregate: JoinHandle<AggregateOutcome>,
}

/// Event waiting on its migration stat, together with its in-flight lookups.
#[derive(Debug)]
pub struct PendingEvent {
    pub event: TokenEvent,
    pub lookups: LookupHandles,
    phase: Phase,
}

impl PendingEvent {
    pub fn new(event: TokenEvent, lookups: LookupHandles) -> Self {
        Self {
            event,
            lookups,
            phase: Phase::New,
        }
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    /// Move to `next`, returning false (and staying put) if the transition is not allowed.
    pub fn advance(&mut self, next: Phase) -> bool {
        if !self.phase.can_advance_to(next) {
            warn!(
                token = %self.event.token_address,
                from = %self.phase,
                to = %next,
                "rejected phase transition"
            );
            return false;
        }

        self.phase = next;
        true
    }
}

/// Bounded queue of [`PendingEvent`]s re-checked against the migration stat cache.
#[derive(Debug)]
pub struct DeferredMatcher {
    pending: Mutex<VecDeque<PendingEvent>>,
    capacity: usize,
    max_processing_time: Duration,
}

impl DeferredMatcher {
    pub fn new(capacity: usize, max_processing_time: Duration) -> Self {
        Self {
            pending: Mutex::new(VecDeque::new()),
            capacity,
            max_processing_time,
        }
    }

    pub fn len(&self) -> usize {
        self.pending.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.lock().is_empty()
    }

    /// Queue an unmatched event. A full queue hands the event back untouched.
    pub fn enqueue(&self, mut pending: PendingEvent) -> Result<(), PendingEvent> {
        let mut queue = self.pending.lock();
        if queue.len() >= self.capacity {
            return Err(pending);
        }

        if !pending.advance(Phase::AwaitingSecondary) {
            return Err(pending);
        }

        queue.push_back(pending);
        Ok(())
    }

    /// Remove every event that either found its stat or outlived `max_processing_time`.
    pub fn sweep(
        &self,
        migrations: &MigrationStatCache,
        now: DateTime<Utc>,
    ) -> Vec<(PendingEvent, MigrationOutcome)> {
        let mut queue = self.pending.lock();
        let mut ready = Vec::new();

        for mut pending in std::mem::take(&mut *queue) {
            let event = &pending.event;

            if let Some(stat) = migrations.lookup(&event.token_address, &event.pair_address, now) {
                pending.advance(Phase::Matched);
                ready.push((pending, MigrationOutcome::Matched(stat.counts())));
            } else if event.received_at.elapsed() >= self.max_processing_time {
                pending.advance(Phase::TimedOut);
                ready.push((pending, MigrationOutcome::Unavailable));
            } else {
                queue.push_back(pending);
            }
        }

        ready
    }

    /// Take every queued event, marking each as timed out.
    pub fn drain(&self) -> Vec<PendingEvent> {
        self.pending
            .lock()
            .drain(..)
            .map(|mut pending| {
                pending.advance(Phase::TimedOut);
                pending
            })
            .collect()
    }
}
