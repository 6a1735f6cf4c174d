//! Notifier seam: where events leave the monitor.
//!
//! Dispatch is fire-and-forget. A notifier must return immediately and must
//! not report delivery outcomes back to the monitor.

use crate::event::Event;
use crate::peer::WebhookTarget;
use tokio::sync::mpsc;

/// An event addressed to a webhook.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Dispatch {
    pub target: WebhookTarget,
    pub event: Event,
}

/// Hands events to an external sink without blocking.
pub trait Notifier: Send + 'static {
    fn dispatch(&self, target: &WebhookTarget, event: Event);
}

/// Queue dispatches for a dedicated delivery task.
///
/// If the receiving task is gone the dispatch is dropped.
impl Notifier for mpsc::UnboundedSender<Dispatch> {
    fn dispatch(&self, target: &WebhookTarget, event: Event) {
        if self
            .send(Dispatch {
                target: target.clone(),
                event,
            })
            .is_err()
        {
            tracing::debug!("Notifier receiver dropped, discarding event for {}", target);
        }
    }
}
