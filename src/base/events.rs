//! Structured pipeline events for observers (dashboards, logs, debug feeds).
//!
//! Events are published on a bounded broadcast channel. Publishing never
//! blocks and never fails the pipeline: with no subscribers the event is
//! simply discarded, and a subscriber that falls behind loses the *oldest*
//! buffered events (it observes `RecvError::Lagged`).

use std::{fmt, time::Duration};

use chrono::{DateTime, Utc};
use tokio::sync::broadcast::{self, error::RecvError};
use tracing::{debug, error, info, instrument, warn};

use crate::{interaction::mention::MentionKind, service::llm::ApiCallRecord};

/// Failure categories surfaced to operators.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    Auth,
    RateLimit,
    TransientNetwork,
    ModelUnavailable,
    Protocol,
    Storage,
    Delivery,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ErrorKind::Auth => "auth",
            ErrorKind::RateLimit => "rate_limit",
            ErrorKind::TransientNetwork => "transient_network",
            ErrorKind::ModelUnavailable => "model_unavailable",
            ErrorKind::Protocol => "protocol",
            ErrorKind::Storage => "storage",
            ErrorKind::Delivery => "delivery",
        };

        f.write_str(name)
    }
}

/// What happened.
#[derive(Debug, Clone, PartialEq)]
pub enum EventKind {
    MentionDetected { kind: MentionKind },
    HistoryLoaded { count: usize },
    RequestSent { model: String, message_count: usize },
    ResponseReceived { tokens: u32, latency: Duration, cost: f64 },
    ApiCall(ApiCallRecord),
    Error { kind: ErrorKind, detail: String },
}

/// A timestamped pipeline event.
#[derive(Debug, Clone, PartialEq)]
pub struct Event {
    pub at: DateTime<Utc>,
    pub participant_id: Option<String>,
    pub kind: EventKind,
}

impl fmt::Display for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let who = self.participant_id.as_deref().unwrap_or("-");

        match &self.kind {
            EventKind::MentionDetected { kind } => write!(f, "[{who}] mention detected ({kind:?})"),
            EventKind::HistoryLoaded { count } => write!(f, "[{who}] loaded {count} history entries"),
            EventKind::RequestSent { model, message_count } => write!(f, "[{who}] request sent to {model} with {message_count} messages"),
            EventKind::ResponseReceived { tokens, latency, cost } => {
                write!(f, "[{who}] response received: {tokens} tokens in {:.2}s (~${cost:.6})", latency.as_secs_f64())
            }
            EventKind::ApiCall(record) => write!(
                f,
                "[{who}] api call {} model={} status={:?} tokens={} latency={}ms",
                record.request_id,
                record.model,
                record.status,
                record.tokens_used,
                record.latency.as_millis()
            ),
            EventKind::Error { kind, detail } => write!(f, "[{who}] {kind} error: {detail}"),
        }
    }
}

/// Cloneable handle to the bounded event channel.
#[derive(Clone, Debug)]
pub struct EventBus {
    sender: broadcast::Sender<Event>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    /// Publish an event; fire-and-forget.
    pub fn emit(&self, participant_id: Option<&str>, kind: EventKind) {
        let event = Event {
            at: Utc::now(),
            participant_id: participant_id.map(str::to_string),
            kind,
        };

        // No subscribers is fine.
        let _ = self.sender.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.sender.subscribe()
    }
}

/// Drain a subscription into the log until the bus closes.
#[instrument(skip_all)]
pub async fn log_events(mut receiver: broadcast::Receiver<Event>) {
    loop {
        match receiver.recv().await {
            Ok(event) => match &event.kind {
                EventKind::Error { .. } => error!("{event}"),
                EventKind::ApiCall(_) => debug!("{event}"),
                _ => info!("{event}"),
            },
            Err(RecvError::Lagged(skipped)) => warn!("Event logger fell behind; dropped {skipped} events."),
            Err(RecvError::Closed) => break,
        }
    }
}
