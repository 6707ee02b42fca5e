// Competition state machine.
//
// A session tracks at most one live competition. The slot is mutated only
// through `Competition::apply`, which is fed by local intents (after the REST
// collaborator has confirmed them), by server pushes, and by the local clock.

use chrono::{DateTime, Duration, Utc};
use tracing::{debug, info, warn};

use crate::protocol::{CompetitionRecord, CompetitionStatus, Participant};

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

/// Snapshot of the counterparty, taken when the record was received. It is
/// not a live reference to the user.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Opponent {
    pub id: String,
    pub name: String,
    pub school: String,
}

impl From<&Participant> for Opponent {
    fn from(p: &Participant) -> Self {
        Opponent {
            id: p.id.clone(),
            name: p.name.clone(),
            school: p.school.clone(),
        }
    }
}

/// The session's competition slot.
///
/// Invariants, re-checked after every transition:
/// - `opponent` and `id` are present iff `status != none`
/// - `scheduled_date` is present whenever `status` is `scheduled` or `ready`
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Competition {
    id: Option<String>,
    status: CompetitionStatus,
    scheduled_date: Option<DateTime<Utc>>,
    opponent: Option<Opponent>,
    is_receiver: bool,
}

/// Inputs to the reducer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CompetitionEvent {
    /// The local user's challenge was created by the server.
    Sent(CompetitionRecord),
    /// A `competition_update` arrived over the push channel.
    Pushed(CompetitionRecord),
    /// The server's response to an accept/reject/cancel request.
    Confirmed(CompetitionRecord),
    /// Periodic local clock tick.
    Tick(DateTime<Utc>),
    /// The local user started a ready competition.
    Started,
    /// The session was cleared.
    Reset,
}

/// Why an event was not applied.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IgnoreReason {
    /// The record belongs to a competition other than the tracked one.
    ForeignId,
    /// The local user is neither the sender nor the receiver.
    NotParticipant,
    /// A scheduled or ready record arrived without a date.
    MissingScheduledDate,
    /// A new challenge was reported while another one occupies the slot.
    Occupied,
}

/// Result of applying one event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    Changed {
        from: CompetitionStatus,
        to: CompetitionStatus,
    },
    /// Same status, but the date or opponent snapshot was updated.
    Refreshed,
    Unchanged,
    Ignored(IgnoreReason),
}

impl Outcome {
    /// Whether observers need to re-render.
    pub fn is_visible(&self) -> bool {
        matches!(self, Outcome::Changed { .. } | Outcome::Refreshed)
    }
}

// ---------------------------------------------------------------------------
// Opponent resolution
// ---------------------------------------------------------------------------

/// Resolve the counterparty of `me` in `record`.
///
/// Returns the opponent snapshot and whether `me` is the receiver, or `None`
/// when `me` takes no part in the record.
pub fn resolve_opponent(record: &CompetitionRecord, me: &str) -> Option<(Opponent, bool)> {
    if record.receiver.id == me {
        Some((Opponent::from(&record.sender), true))
    } else if record.sender.id == me {
        Some((Opponent::from(&record.receiver), false))
    } else {
        None
    }
}

// ---------------------------------------------------------------------------
// Competition
// ---------------------------------------------------------------------------

impl Competition {
    pub fn id(&self) -> Option<&str> {
        self.id.as_deref()
    }

    pub fn status(&self) -> CompetitionStatus {
        self.status
    }

    pub fn scheduled_date(&self) -> Option<DateTime<Utc>> {
        self.scheduled_date
    }

    pub fn opponent(&self) -> Option<&Opponent> {
        self.opponent.as_ref()
    }

    pub fn is_receiver(&self) -> bool {
        self.is_receiver
    }

    pub fn is_live(&self) -> bool {
        self.status.is_live()
    }

    /// The receiver may answer a pending challenge.
    pub fn awaiting_my_answer(&self) -> bool {
        self.status == CompetitionStatus::Pending && self.is_receiver
    }

    /// The sender may withdraw a pending challenge.
    pub fn cancellable_by_me(&self) -> bool {
        self.status == CompetitionStatus::Pending && !self.is_receiver
    }

    /// Whether the periodic clock tick should be running.
    pub fn needs_tick(&self) -> bool {
        matches!(
            self.status,
            CompetitionStatus::Accepted | CompetitionStatus::Scheduled
        ) && self.scheduled_date.is_some()
    }

    /// Time left before a scheduled competition may start. `None` when nothing
    /// is scheduled; zero once the date has passed.
    pub fn remaining_until_start(&self, now: DateTime<Utc>) -> Option<Duration> {
        let date = self.scheduled_date?;
        if !matches!(
            self.status,
            CompetitionStatus::Accepted | CompetitionStatus::Scheduled | CompetitionStatus::Ready
        ) {
            return None;
        }
        Some((date - now).max(Duration::zero()))
    }

    /// Pick the record to restore into an empty slot: the most recently
    /// updated live competition `me` takes part in.
    pub fn select_live<'a>(
        records: &'a [CompetitionRecord],
        me: &str,
    ) -> Option<&'a CompetitionRecord> {
        records
            .iter()
            .filter(|r| r.status.is_live() && r.involves(me))
            .max_by_key(|r| r.updated_at)
    }

    /// Apply one event. This is the only way the slot changes.
    pub fn apply(&mut self, event: &CompetitionEvent, me: &str) -> Outcome {
        let outcome = match event {
            CompetitionEvent::Sent(record) => self.on_sent(record, me),
            CompetitionEvent::Pushed(record) => self.on_server_record(record, me),
            CompetitionEvent::Confirmed(record) => self.on_server_record(record, me),
            CompetitionEvent::Tick(now) => self.on_tick(*now),
            CompetitionEvent::Started => self.on_started(),
            CompetitionEvent::Reset => self.reset(),
        };
        debug_assert!(self.invariants_hold(), "competition invariants broken: {:?}", self);
        outcome
    }

    fn on_sent(&mut self, record: &CompetitionRecord, me: &str) -> Outcome {
        if record.sender.id != me {
            warn!(competition = %record.id, "created competition does not name us as sender");
            return Outcome::Ignored(IgnoreReason::NotParticipant);
        }
        if self.is_live() {
            if self.id.as_deref() == Some(record.id.as_str()) {
                // The push for our own challenge beat the REST response.
                return self.on_server_record(record, me);
            }
            warn!(
                competition = %record.id,
                tracked = ?self.id,
                "challenge created while another competition occupies the slot"
            );
            return Outcome::Ignored(IgnoreReason::Occupied);
        }
        self.track(record, me)
    }

    fn on_server_record(&mut self, record: &CompetitionRecord, me: &str) -> Outcome {
        if !self.is_live() {
            return self.track(record, me);
        }

        if self.id.as_deref() != Some(record.id.as_str()) {
            warn!(
                competition = %record.id,
                tracked = ?self.id,
                "update for an unexpected competition, ignoring"
            );
            return Outcome::Ignored(IgnoreReason::ForeignId);
        }

        let from = self.status;
        let to = record.status;

        if to == CompetitionStatus::None {
            info!(competition = %record.id, %from, "competition reset by server");
            return self.reset();
        }

        let permitted = from == to
            || matches!(
                (from, to),
                (CompetitionStatus::Pending, CompetitionStatus::Accepted)
                    | (CompetitionStatus::Pending, CompetitionStatus::Scheduled)
                    | (CompetitionStatus::Accepted, CompetitionStatus::Scheduled)
                    | (CompetitionStatus::Scheduled, CompetitionStatus::Ready)
            );
        if !permitted {
            debug!(competition = %record.id, %from, %to, "transition not permitted, state unchanged");
            return Outcome::Unchanged;
        }

        if requires_date(to) && record.scheduled_date.is_none() {
            warn!(competition = %record.id, %to, "record has no scheduled date, ignoring");
            return Outcome::Ignored(IgnoreReason::MissingScheduledDate);
        }

        let mut next = self.clone();
        next.status = to;
        next.scheduled_date = record.scheduled_date;
        match resolve_opponent(record, me) {
            Some((opponent, is_receiver)) if is_receiver == self.is_receiver => {
                next.opponent = Some(opponent);
            }
            Some(_) => {
                warn!(competition = %record.id, "record swaps sender and receiver, keeping roles");
            }
            None => {
                warn!(competition = %record.id, "tracked competition no longer names us");
                return Outcome::Ignored(IgnoreReason::NotParticipant);
            }
        }

        self.replace_with(next)
    }

    fn on_tick(&mut self, now: DateTime<Utc>) -> Outcome {
        match (self.status, self.scheduled_date) {
            (CompetitionStatus::Scheduled, Some(date)) if now >= date => {
                info!(competition = ?self.id, "scheduled time reached, competition ready");
                let from = self.status;
                self.status = CompetitionStatus::Ready;
                Outcome::Changed {
                    from,
                    to: CompetitionStatus::Ready,
                }
            }
            _ => Outcome::Unchanged,
        }
    }

    fn on_started(&mut self) -> Outcome {
        if self.status != CompetitionStatus::Ready {
            return Outcome::Unchanged;
        }
        info!(competition = ?self.id, "competition started, releasing slot");
        self.reset()
    }

    /// Adopt `record` into an empty slot.
    fn track(&mut self, record: &CompetitionRecord, me: &str) -> Outcome {
        if !record.status.is_live() {
            return Outcome::Unchanged;
        }
        let Some((opponent, is_receiver)) = resolve_opponent(record, me) else {
            warn!(competition = %record.id, "competition does not involve us, ignoring");
            return Outcome::Ignored(IgnoreReason::NotParticipant);
        };
        if requires_date(record.status) && record.scheduled_date.is_none() {
            warn!(competition = %record.id, status = %record.status, "record has no scheduled date, ignoring");
            return Outcome::Ignored(IgnoreReason::MissingScheduledDate);
        }
        info!(
            competition = %record.id,
            status = %record.status,
            opponent = %opponent.name,
            is_receiver,
            "tracking competition"
        );
        let next = Competition {
            id: Some(record.id.clone()),
            status: record.status,
            scheduled_date: record.scheduled_date,
            opponent: Some(opponent),
            is_receiver,
        };
        self.replace_with(next)
    }

    fn reset(&mut self) -> Outcome {
        let from = self.status;
        *self = Competition::default();
        if from == CompetitionStatus::None {
            Outcome::Unchanged
        } else {
            Outcome::Changed {
                from,
                to: CompetitionStatus::None,
            }
        }
    }

    fn replace_with(&mut self, next: Competition) -> Outcome {
        if next == *self {
            return Outcome::Unchanged;
        }
        let from = self.status;
        let to = next.status;
        *self = next;
        if from == to {
            Outcome::Refreshed
        } else {
            Outcome::Changed { from, to }
        }
    }

    fn invariants_hold(&self) -> bool {
        let live = self.status.is_live();
        live == self.opponent.is_some()
            && live == self.id.is_some()
            && (!requires_date(self.status) || self.scheduled_date.is_some())
            && (live || (self.scheduled_date.is_none() && !self.is_receiver))
    }
}

fn requires_date(status: CompetitionStatus) -> bool {
    matches!(
        status,
        CompetitionStatus::Scheduled | CompetitionStatus::Ready
    )
}
