//! Webhook delivery.
//!
//! The monitor hands dispatches to an unbounded channel; a worker task turns
//! each one into its own delivery task, so a slow endpoint never holds up the
//! check loop or other deliveries. Failures are logged and dropped.

use pingwatch_core::{Dispatch, EventError};
use reqwest::Client;
use reqwest::header::CONTENT_TYPE;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Limit on a single webhook request, including reading the response.
pub const DELIVERY_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Error)]
pub enum DeliveryError {
    #[error("Refusing to deliver invalid event: {0}")]
    InvalidEvent(#[from] EventError),
    #[error("Failed to encode event: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("Request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("Webhook responded with {0}")]
    Status(reqwest::StatusCode),
}

/// `User-Agent` sent with every delivery.
pub fn user_agent() -> String {
    format!(
        "pingwatch/{} ({}; {})",
        env!("CARGO_PKG_VERSION"),
        std::env::consts::OS,
        std::env::consts::ARCH
    )
}

/// Delivers dispatches to their webhook over HTTP.
#[derive(Clone)]
pub struct WebhookNotifier {
    client: Client,
}

impl WebhookNotifier {
    pub fn new() -> Result<Self, reqwest::Error> {
        let client = Client::builder()
            .user_agent(user_agent())
            .timeout(DELIVERY_TIMEOUT)
            .build()?;
        Ok(Self { client })
    }

    /// Start the worker task.
    ///
    /// The returned sender is the monitor's notifier. The worker exits once
    /// every sender is dropped; deliveries already started keep running.
    pub fn spawn(self) -> (mpsc::UnboundedSender<Dispatch>, JoinHandle<()>) {
        let (tx, mut rx) = mpsc::unbounded_channel::<Dispatch>();

        let handle = tokio::spawn(async move {
            while let Some(dispatch) = rx.recv().await {
                let notifier = self.clone();
                tokio::spawn(async move {
                    if let Err(e) = notifier.deliver(&dispatch).await {
                        warn!(
                            "Failed to deliver \"{}\" to {}: {}",
                            dispatch.event.title, dispatch.target, e
                        );
                    }
                });
            }
            debug!("Webhook worker stopped");
        });

        (tx, handle)
    }

    /// POST one event as JSON to its target.
    pub async fn deliver(&self, dispatch: &Dispatch) -> Result<(), DeliveryError> {
        dispatch.event.validate()?;
        let body = serde_json::to_vec_pretty(&dispatch.event)?;

        let response = self
            .client
            .post(dispatch.target.as_str())
            .header(CONTENT_TYPE, "application/json")
            .body(body)
            .send()
            .await?;

        let status = response.status();
        // Read the body so the connection can be reused
        let _ = response.bytes().await?;

        if !status.is_success() {
            return Err(DeliveryError::Status(status));
        }
        debug!("Delivered \"{}\" to {}", dispatch.event.title, dispatch.target);
        Ok(())
    }
}
