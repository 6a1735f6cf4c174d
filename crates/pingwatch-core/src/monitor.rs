//! Liveness monitor.
//!
//! Two activities share the peer registry:
//! - **Ingestion loop**: waits on the packet source, routes each source
//!   address to a peer and stamps its last-seen time. Runs in the task that
//!   calls `Monitor::listen`.
//! - **Check loop**: once per monitor cycle, turns every peer's last-seen time
//!   into a seen/not-seen observation, advances its state machine and emits
//!   events. Runs in its own task and owns all peer states.
//!
//! Shutdown goes through `MonitorHandle::close()`: it stops the check loop and
//! closes the packet source, which makes the pending receive fail. That
//! failure ends the ingestion loop and is not reported as an error.

use crate::config::{Config, ConfigError};
use crate::event::Event;
use crate::notify::Notifier;
use crate::peer::{Peer, PeerId};
use crate::registry::PeerRegistry;
use crate::state::PeerState;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::io;
use std::net::IpAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::oneshot;
use tokio::task::JoinError;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, error, info};

#[derive(Debug, Error)]
pub enum MonitorError {
    #[error("Failed to receive packet: {0}")]
    Receive(#[from] io::Error),
    #[error("close() must be called after listen()")]
    NotListening,
    #[error("Monitor is already closed")]
    AlreadyClosed,
    #[error("{field} must be greater than zero")]
    ZeroDuration { field: &'static str },
    #[error("Check loop failed: {0}")]
    CheckLoop(#[from] JoinError),
    #[error("Check loop stopped before the monitor was closed")]
    CheckLoopStopped,
}

/// Source of inbound packets, reduced to their source addresses.
#[async_trait]
pub trait PacketSource: Send + 'static {
    type Closer: SourceCloser;

    /// Wait for the next packet and return its source address.
    ///
    /// Must fail once the source has been closed through its closer.
    async fn recv_source(&mut self) -> io::Result<IpAddr>;

    /// Handle that closes this source from another task.
    fn closer(&self) -> Self::Closer;
}

/// Closes a packet source, unblocking a pending `recv_source`.
pub trait SourceCloser: Send + Sync + 'static {
    fn close(&self);
}

/// Timing and verbosity of a monitor.
///
/// Both durations are non-zero.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MonitorSettings {
    /// Time between liveness checks
    monitor_cycle: Duration,
    /// Window a peer must have been seen within during a check
    peer_timeout: Duration,
    /// Dispatch every state change, not only confirmed ones
    verbose: bool,
}

impl MonitorSettings {
    pub fn new(
        monitor_cycle: Duration,
        peer_timeout: Duration,
        verbose: bool,
    ) -> Result<Self, MonitorError> {
        if monitor_cycle.is_zero() {
            return Err(MonitorError::ZeroDuration {
                field: "monitor_cycle",
            });
        }
        if peer_timeout.is_zero() {
            return Err(MonitorError::ZeroDuration {
                field: "peer_timeout",
            });
        }
        Ok(Self {
            monitor_cycle,
            peer_timeout,
            verbose,
        })
    }

    /// Settings from a configuration; zero durations are rejected while
    /// parsing.
    pub fn from_config(config: &Config, verbose: bool) -> Result<Self, ConfigError> {
        Ok(Self {
            monitor_cycle: config.monitor_cycle()?,
            peer_timeout: config.peer_timeout()?,
            verbose,
        })
    }

    pub fn monitor_cycle(&self) -> Duration {
        self.monitor_cycle
    }

    pub fn peer_timeout(&self) -> Duration {
        self.peer_timeout
    }

    pub fn verbose(&self) -> bool {
        self.verbose
    }
}

/// The check loop: owns the state of every peer.
///
/// States are kept in a slot array indexed by `PeerId`, so the ingestion
/// loop never touches them.
pub struct Checker<N> {
    registry: Arc<PeerRegistry>,
    states: Vec<PeerState>,
    notifier: N,
    settings: MonitorSettings,
}

impl<N: Notifier> Checker<N> {
    pub fn new(registry: Arc<PeerRegistry>, settings: MonitorSettings, notifier: N) -> Self {
        let states = registry
            .iter()
            .map(|peer| PeerState::new(peer.thresholds()))
            .collect();

        Self {
            registry,
            states,
            notifier,
            settings,
        }
    }

    /// Current state of a peer.
    pub fn state(&self, id: PeerId) -> Option<PeerState> {
        self.states.get(id.index()).copied()
    }

    /// Current states, in registry order.
    pub fn states(&self) -> &[PeerState] {
        &self.states
    }

    /// Run one check cycle over all peers, in registry order.
    pub fn check_peers(&mut self, now: DateTime<Utc>) {
        let registry = Arc::clone(&self.registry);
        for peer in registry.iter() {
            self.check_peer(peer, now);
        }
    }

    fn check_peer(&mut self, peer: &Peer, now: DateTime<Utc>) {
        let Some(prev) = self.state(peer.id()) else {
            return;
        };

        // Lock held only while computing the observation
        let (seen, last_seen) = peer.observe(now, self.settings.peer_timeout);

        let (next, notable) = prev.heartbeat(seen);
        let changed = prev.to_string() != next.to_string();

        if notable || (changed && self.settings.verbose) {
            let event = Event::transition(peer, last_seen, now, &prev, &next);
            self.notify(peer, event);
        }

        if let Some(slot) = self.states.get_mut(peer.id().index()) {
            *slot = next;
        }
    }

    /// Log the event and hand it to the notifier if the peer has a webhook.
    fn notify(&self, peer: &Peer, event: Event) {
        info!(peer = peer.name(), "{}", event.title);
        if let Some(target) = peer.webhook() {
            self.notifier.dispatch(target, event);
        }
    }

    /// Check all peers every monitor cycle until `stop` fires.
    ///
    /// The first check happens one full cycle after start.
    pub async fn run(mut self, mut stop: oneshot::Receiver<()>) -> Self {
        let cycle = self.settings.monitor_cycle;
        let mut ticker = tokio::time::interval_at(Instant::now() + cycle, cycle);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;
                _ = &mut stop => {
                    info!("Stopping monitoring");
                    return self;
                }
                _ = ticker.tick() => {
                    self.check_peers(Utc::now());
                }
            }
        }
    }
}

/// Stamp the peer owning `addr` as seen at `now`.
///
/// Returns the matched peer, or None when no configured network contains
/// the address.
pub fn record_packet(
    registry: &PeerRegistry,
    addr: IpAddr,
    now: DateTime<Utc>,
    verbose: bool,
) -> Option<PeerId> {
    match registry.find_peer_for(addr) {
        Some(peer) => {
            if verbose {
                info!("ip {} updated last seen for {}", addr, peer.name());
            }
            peer.touch(now);
            Some(peer.id())
        }
        None => {
            if verbose {
                info!("No configured peer matched {}", addr);
            }
            None
        }
    }
}

/// State shared between a monitor and its handles.
struct Shared {
    /// Set once shutdown has started
    closing: AtomicBool,
    /// Stops the check loop (one-shot)
    stop_tx: Mutex<Option<oneshot::Sender<()>>>,
    /// Closes the packet source; present only while listening
    closer: Mutex<Option<Box<dyn SourceCloser>>>,
}

impl Shared {
    fn stop_checker(&self) {
        if let Some(tx) = self.stop_tx.lock().take() {
            let _ = tx.send(());
        }
    }
}

/// Handle for shutting down a listening monitor from another task.
#[derive(Clone)]
pub struct MonitorHandle {
    shared: Arc<Shared>,
}

impl MonitorHandle {
    /// Stop the check loop and close the packet source.
    ///
    /// `Monitor::listen` then returns `Ok(())`. Fails with `NotListening`
    /// before `listen` has started and `AlreadyClosed` on a second call.
    pub fn close(&self) -> Result<(), MonitorError> {
        if self.shared.closing.swap(true, Ordering::SeqCst) {
            return Err(MonitorError::AlreadyClosed);
        }
        let Some(closer) = self.shared.closer.lock().take() else {
            self.shared.closing.store(false, Ordering::SeqCst);
            return Err(MonitorError::NotListening);
        };

        self.shared.stop_checker();
        closer.close();
        Ok(())
    }

    /// Check if shutdown has started.
    pub fn is_closing(&self) -> bool {
        self.shared.closing.load(Ordering::SeqCst)
    }
}

/// Monitors the peers of a registry for liveness.
pub struct Monitor<N> {
    registry: Arc<PeerRegistry>,
    checker: Checker<N>,
    shared: Arc<Shared>,
    stop_rx: oneshot::Receiver<()>,
    verbose: bool,
}

impl<N: Notifier> Monitor<N> {
    pub fn new(settings: MonitorSettings, registry: PeerRegistry, notifier: N) -> Self {
        let registry = Arc::new(registry);
        let checker = Checker::new(Arc::clone(&registry), settings, notifier);

        for (peer, state) in registry.iter().zip(checker.states()) {
            info!("{} - State {}", peer, state);
        }

        let (stop_tx, stop_rx) = oneshot::channel();
        Self {
            registry,
            checker,
            shared: Arc::new(Shared {
                closing: AtomicBool::new(false),
                stop_tx: Mutex::new(Some(stop_tx)),
                closer: Mutex::new(None),
            }),
            stop_rx,
            verbose: settings.verbose(),
        }
    }

    pub fn registry(&self) -> &Arc<PeerRegistry> {
        &self.registry
    }

    pub fn handle(&self) -> MonitorHandle {
        MonitorHandle {
            shared: Arc::clone(&self.shared),
        }
    }

    /// Run the monitor on `source` until it is closed or fails.
    ///
    /// Starts the check loop, then processes packets in the calling task.
    /// Returns `Ok(())` when stopped by `close()`. Otherwise returns
    /// `MonitorError::Receive` when the source fails, or `CheckLoop` /
    /// `CheckLoopStopped` when the check loop ends on its own. The check loop
    /// has stopped by the time this returns.
    pub async fn listen<S: PacketSource>(self, mut source: S) -> Result<(), MonitorError> {
        let Monitor {
            registry,
            checker,
            shared,
            stop_rx,
            verbose,
        } = self;

        *shared.closer.lock() = Some(Box::new(source.closer()));
        let mut check_task = tokio::spawn(checker.run(stop_rx));
        debug!("Monitoring {} peer(s)", registry.len());

        let ended = loop {
            tokio::select! {
                biased;
                joined = &mut check_task => break Ended::CheckLoop(joined),
                packet = source.recv_source() => match packet {
                    Ok(addr) => {
                        record_packet(&registry, addr, Utc::now(), verbose);
                    }
                    Err(e) => break Ended::Source(e),
                },
            }
        };

        shared.closer.lock().take();
        let closing = shared.closing.load(Ordering::SeqCst);

        match ended {
            Ended::Source(err) => {
                shared.stop_checker();
                let joined = check_task.await;
                if !closing {
                    if let Err(e) = joined {
                        error!("Check loop ended abnormally: {}", e);
                    }
                    return Err(MonitorError::Receive(err));
                }
                debug!("Packet source closed: {}", err);
                joined.map(drop).map_err(MonitorError::from)
            }
            Ended::CheckLoop(Ok(_)) if closing => Ok(()),
            Ended::CheckLoop(Ok(_)) => Err(MonitorError::CheckLoopStopped),
            Ended::CheckLoop(Err(e)) => {
                error!("Check loop ended abnormally: {}", e);
                Err(MonitorError::CheckLoop(e))
            }
        }
    }
}

/// Why the ingestion loop ended.
enum Ended<N> {
    Source(io::Error),
    CheckLoop(Result<Checker<N>, JoinError>),
}
