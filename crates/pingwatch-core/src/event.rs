//! State change events handed to notifiers.

use crate::peer::Peer;
use crate::state::PeerState;
use chrono::{DateTime, Local, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Layout used for the last-seen time in event text.
const LAST_SEEN_FORMAT: &str = "%Y-%m-%d %I:%M:%S %p %z";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum EventError {
    #[error("Event title must not be empty")]
    EmptyTitle,
    #[error("Event new state must not be empty")]
    EmptyNewState,
    #[error("Event previous state must not be empty")]
    EmptyPrevState,
}

/// Snapshot of a peer state change.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Event {
    /// Short summary, e.g. "Peer ISP A is Down"
    pub title: String,
    /// One-line description including the previous state
    pub text: String,
    /// When the state check that produced the event ran
    pub timestamp: DateTime<Utc>,
    /// When the peer last sent an echo request (None = never).
    ///
    /// On the wire a never-seen peer carries the zero time
    /// `0001-01-01T00:00:00Z` rather than `null`.
    #[serde(with = "zero_time")]
    pub last_seen: Option<DateTime<Utc>>,
    /// State after the check
    pub new_state: String,
    /// State before the check
    pub prev_state: String,
}

impl Event {
    /// Build the event for a peer moving from `prev` to `next`.
    pub fn transition(
        peer: &Peer,
        last_seen: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
        prev: &PeerState,
        next: &PeerState,
    ) -> Self {
        let prev_state = prev.to_string();
        let new_state = next.to_string();
        let when = match last_seen {
            Some(at) => at.with_timezone(&Local).format(LAST_SEEN_FORMAT).to_string(),
            None => "never".to_string(),
        };

        Self {
            title: format!("Peer {} is {}", peer.name(), new_state),
            text: format!(
                "{} (last seen {}) was previously {} and is now {}",
                peer.name(),
                when,
                prev_state,
                new_state
            ),
            timestamp: now,
            last_seen,
            new_state,
            prev_state,
        }
    }

    /// Check the event has a title and both states.
    pub fn validate(&self) -> Result<(), EventError> {
        if self.title.is_empty() {
            return Err(EventError::EmptyTitle);
        }
        if self.new_state.is_empty() {
            return Err(EventError::EmptyNewState);
        }
        if self.prev_state.is_empty() {
            return Err(EventError::EmptyPrevState);
        }
        Ok(())
    }
}

/// `Option<DateTime<Utc>>` as a timestamp, using the zero time for None.
mod zero_time {
    use chrono::{DateTime, Utc};
    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    const ZERO_TIME: &str = "0001-01-01T00:00:00Z";
    /// `ZERO_TIME` as seconds from the Unix epoch
    const ZERO_TIME_SECS: i64 = -62_135_596_800;

    pub fn serialize<S>(value: &Option<DateTime<Utc>>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        match value {
            Some(at) => at.serialize(serializer),
            None => serializer.serialize_str(ZERO_TIME),
        }
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<DateTime<Utc>>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let at = Option::<DateTime<Utc>>::deserialize(deserializer)?;
        Ok(at.filter(|at| at.timestamp() != ZERO_TIME_SECS || at.timestamp_subsec_nanos() != 0))
    }
}
