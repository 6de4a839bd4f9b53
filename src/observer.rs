//! System notifications.
//!
//! The engine and the consumer report what they are doing as
//! [`SystemEvent`]s to a [`SystemObserver`]. Observers are invoked
//! synchronously on the dispatching task and should avoid heavy or blocking
//! work.

use std::{fmt, sync::Arc};

use crate::{binding::HandlerType, envelope::MessageType};

/// A message is about to be handed to its handler.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DispatchingMessage {
    pub envelope_id: String,
    pub message_type: MessageType,
    pub handler_type: HandlerType,
}

impl fmt::Display for DispatchingMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Dispatching message '{}' on '{}'.",
            self.message_type, self.handler_type
        )
    }
}

/// An envelope was processed and acknowledged to its inbox.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnvelopeAcked {
    pub queue_name: String,
    pub envelope_id: String,
    pub attributes: Vec<(String, String)>,
}

impl fmt::Display for EnvelopeAcked {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] acked at '{}'", self.envelope_id, self.queue_name)
    }
}

/// An envelope taken from an inbox could not be processed.
#[derive(Debug, Clone)]
pub struct EnvelopeInboxFailed {
    pub inbox_name: String,
    pub envelope_id: Option<String>,
    pub error: Arc<dyn std::error::Error + Send + Sync>,
}

impl fmt::Display for EnvelopeInboxFailed {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Failed to retrieve message from {}: {}.",
            self.inbox_name, self.error
        )
    }
}

/// Non-fatal configuration problem detected while building the engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfigurationWarning {
    pub message: String,
}

impl fmt::Display for ConfigurationWarning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.message)
    }
}

#[derive(Debug, Clone)]
pub enum SystemEvent {
    DispatchingMessage(DispatchingMessage),
    EnvelopeAcked(EnvelopeAcked),
    EnvelopeInboxFailed(EnvelopeInboxFailed),
    ConfigurationWarning(ConfigurationWarning),
}

impl fmt::Display for SystemEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SystemEvent::DispatchingMessage(event) => fmt::Display::fmt(event, f),
            SystemEvent::EnvelopeAcked(event) => fmt::Display::fmt(event, f),
            SystemEvent::EnvelopeInboxFailed(event) => fmt::Display::fmt(event, f),
            SystemEvent::ConfigurationWarning(event) => fmt::Display::fmt(event, f),
        }
    }
}

/// Sink for [`SystemEvent`]s.
pub trait SystemObserver: Send + Sync {
    fn notify(&self, event: &SystemEvent);
}

impl<F> SystemObserver for F
where
    F: Fn(&SystemEvent) + Send + Sync,
{
    fn notify(&self, event: &SystemEvent) {
        self(event)
    }
}

/// Observer logging every event using `tracing`.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingObserver;

impl SystemObserver for TracingObserver {
    fn notify(&self, event: &SystemEvent) {
        match event {
            SystemEvent::DispatchingMessage(e) => tracing::debug!(envelope_id = %e.envelope_id, "{e}"),
            SystemEvent::EnvelopeAcked(e) => tracing::info!(attributes = ?e.attributes, "{e}"),
            SystemEvent::EnvelopeInboxFailed(e) => tracing::error!(envelope_id = ?e.envelope_id, "{e}"),
            SystemEvent::ConfigurationWarning(e) => tracing::warn!("{e}"),
        }
    }
}

/// Fan-out to several observers, in registration order.
#[derive(Clone, Default)]
pub struct Observers {
    observers: Vec<Arc<dyn SystemObserver>>,
}

impl Observers {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, observer: impl SystemObserver + 'static) {
        self.observers.push(Arc::new(observer));
    }

    pub fn with(mut self, observer: impl SystemObserver + 'static) -> Self {
        self.push(observer);
        self
    }

    pub fn is_empty(&self) -> bool {
        self.observers.is_empty()
    }
}

impl SystemObserver for Observers {
    fn notify(&self, event: &SystemEvent) {
        for observer in &self.observers {
            observer.notify(event);
        }
    }
}

impl fmt::Debug for Observers {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Observers")
            .field("len", &self.observers.len())
            .finish()
    }
}
