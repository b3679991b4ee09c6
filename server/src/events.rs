//! Fan-out of progress and leaderboard events to subscribers.
//!
//! A thin wrapper over a `tokio` broadcast channel. Publishing is
//! non-blocking and never fails: with no subscribers the event is dropped,
//! and a subscriber that falls behind the channel capacity loses the oldest
//! events rather than slowing the worker down.

use serde::Serialize;
use tokio::sync::broadcast;

use crate::store::LeaderboardEntry;

/// Events pushed to web subscribers, serialized as tagged JSON objects.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ArenaEvent {
    /// Round-robin progress for the submission currently being tested.
    ///
    /// For one player, `current_match` is strictly increasing and the
    /// stream ends with [`ArenaEvent::Complete`] once the queue drains.
    Progress {
        player: String,
        current_match: usize,
        total_matches: usize,
        percent_complete: f64,
        eta_seconds: u64,
        queued_players: Vec<String>,
    },
    /// The submission queue is empty.
    Complete,
    /// The leaderboard changed; carries the fresh entries.
    Leaderboard { entries: Vec<LeaderboardEntry> },
}

/// Handle for publishing and subscribing to [`ArenaEvent`]s; cheap to clone.
#[derive(Debug, Clone)]
pub struct EventBus {
    sender: broadcast::Sender<ArenaEvent>,
}

impl EventBus {
    /// Bus retaining up to `capacity` events per lagging subscriber.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        EventBus { sender }
    }

    /// Publish an event to all current subscribers.
    pub fn emit(&self, event: ArenaEvent) {
        // An error only means nobody is listening.
        let _ = self.sender.send(event);
    }

    /// New subscription receiving events emitted from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<ArenaEvent> {
        self.sender.subscribe()
    }
}
