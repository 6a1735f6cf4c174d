//! Peer liveness state machine.
//!
//! Converts a stream of seen/not-seen observations (one per monitor cycle)
//! into a debounced up/down classification:
//! 1. A peer starts `Down`
//! 2. A contradicting observation moves a baseline state into a "maybe" state
//! 3. Consecutive corroborating observations count up to the threshold
//! 4. Reaching the threshold confirms the new baseline state (notable)
//! 5. Any contradicting observation while counting resets to the old baseline (silent)

use std::fmt::{self, Display, Formatter};

/// Consecutive observations needed to confirm a state change.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Thresholds {
    /// Seen cycles needed to go from `MaybeUp` to `Up`
    up: u32,
    /// Missed cycles needed to go from `MaybeDown` to `Down`
    down: u32,
}

impl Thresholds {
    /// Create thresholds. Zero is treated as one: both confirm on the first
    /// corroborating observation after entering a maybe state.
    pub fn new(up: u32, down: u32) -> Self {
        Self {
            up: up.max(1),
            down: down.max(1),
        }
    }

    pub fn up(&self) -> u32 {
        self.up
    }

    pub fn down(&self) -> u32 {
        self.down
    }
}

/// Current liveness classification of a peer.
///
/// Baseline states carry the peer's thresholds so the next maybe state can
/// be built without outside information.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerState {
    /// Peer is not sending echo requests
    Down(Thresholds),
    /// Peer is reliably sending echo requests
    Up(Thresholds),
    /// Peer was down and has been seen `count` cycles in a row
    MaybeUp {
        thresholds: Thresholds,
        count: u32,
    },
    /// Peer was up and has been missed `count` cycles in a row
    MaybeDown {
        thresholds: Thresholds,
        count: u32,
    },
}

impl PeerState {
    /// Initial state for a newly configured peer.
    pub fn new(thresholds: Thresholds) -> Self {
        PeerState::Down(thresholds)
    }

    /// Feed one observation into the state machine.
    ///
    /// Returns the next state and whether the change is notable. Only the
    /// final confirming step into `Up` or `Down` is notable; intermediate
    /// counts and resets are not.
    pub fn heartbeat(self, seen: bool) -> (PeerState, bool) {
        match self {
            PeerState::Up(thresholds) if seen => (PeerState::Up(thresholds), false),
            PeerState::Up(thresholds) => (
                PeerState::MaybeDown {
                    thresholds,
                    count: 1,
                },
                false,
            ),
            PeerState::Down(thresholds) if !seen => (PeerState::Down(thresholds), false),
            PeerState::Down(thresholds) => (
                PeerState::MaybeUp {
                    thresholds,
                    count: 1,
                },
                false,
            ),
            PeerState::MaybeUp { thresholds, .. } if !seen => (PeerState::Down(thresholds), false),
            PeerState::MaybeUp { thresholds, count } => {
                if count + 1 >= thresholds.up {
                    (PeerState::Up(thresholds), true)
                } else {
                    (
                        PeerState::MaybeUp {
                            thresholds,
                            count: count + 1,
                        },
                        false,
                    )
                }
            }
            PeerState::MaybeDown { thresholds, .. } if seen => (PeerState::Up(thresholds), false),
            PeerState::MaybeDown { thresholds, count } => {
                if count + 1 >= thresholds.down {
                    (PeerState::Down(thresholds), true)
                } else {
                    (
                        PeerState::MaybeDown {
                            thresholds,
                            count: count + 1,
                        },
                        false,
                    )
                }
            }
        }
    }

    pub fn thresholds(&self) -> Thresholds {
        match *self {
            PeerState::Down(thresholds) | PeerState::Up(thresholds) => thresholds,
            PeerState::MaybeUp { thresholds, .. } | PeerState::MaybeDown { thresholds, .. } => {
                thresholds
            }
        }
    }

    /// Check if the state is `Up` or `Down` (not counting toward a change).
    pub fn is_baseline(&self) -> bool {
        matches!(self, PeerState::Up(_) | PeerState::Down(_))
    }

    /// Running count and threshold of a maybe state.
    pub fn progress(&self) -> Option<(u32, u32)> {
        match *self {
            PeerState::MaybeUp { thresholds, count } => Some((count, thresholds.up)),
            PeerState::MaybeDown { thresholds, count } => Some((count, thresholds.down)),
            PeerState::Up(_) | PeerState::Down(_) => None,
        }
    }
}

// The display form ends up verbatim in event titles and webhook payloads.
impl Display for PeerState {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            PeerState::Down(_) => write!(f, "Down"),
            PeerState::Up(_) => write!(f, "Up"),
            PeerState::MaybeUp { thresholds, count } => {
                write!(f, "Maybe Up ({} of {})", count, thresholds.up)
            }
            PeerState::MaybeDown { thresholds, count } => {
                write!(f, "Maybe Down ({} of {})", count, thresholds.down)
            }
        }
    }
}
