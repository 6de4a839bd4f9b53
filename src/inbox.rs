//! Inbox abstractions and backend drivers.
//!
//! An inbox is the transport-side source of envelopes. It hands envelopes to
//! a [`Consumer`](crate::Consumer) and learns the outcome of each dispatch:
//!
//! - [`ReceiveEnvelopes`]: stream envelopes waiting to be processed
//! - [`AckEnvelopes`]: acknowledge processed envelopes, or abandon the ones
//!   that failed
//!
//! Concrete implementations are provided by backend modules such as
//! [`inmemory`]. Redelivery of abandoned envelopes is up to the backend.

pub mod inmemory;

use futures_core::stream::BoxStream;
use tokio_util::sync::CancellationToken;
use tracing_error::SpanTrace;

use crate::envelope::Envelope;

/// Error returned by inbox operations.
///
/// Wraps the underlying backend error and captures a tracing span backtrace
/// for improved diagnostics.
#[derive(Debug)]
pub struct InboxError {
    context: SpanTrace,
    kind: InboxErrorKind,
}

/// Inbox errors kind.
#[derive(Debug)]
pub enum InboxErrorKind {
    /// Errors originating from the backend.
    Backend(tower::BoxError),
    /// The envelope was not handed out by this inbox, or was already settled.
    UnknownEnvelope(String),
    /// An envelope with the same id is already pending or in flight.
    DuplicateEnvelope(String),
}

impl InboxError {
    /// Create a backend-related inbox error.
    pub fn backend(err: impl Into<tower::BoxError>) -> Self {
        Self {
            context: SpanTrace::capture(),
            kind: InboxErrorKind::Backend(err.into()),
        }
    }

    pub(crate) fn unknown_envelope(id: &str) -> Self {
        Self {
            context: SpanTrace::capture(),
            kind: InboxErrorKind::UnknownEnvelope(id.to_owned()),
        }
    }

    pub(crate) fn duplicate_envelope(id: &str) -> Self {
        Self {
            context: SpanTrace::capture(),
            kind: InboxErrorKind::DuplicateEnvelope(id.to_owned()),
        }
    }

    pub fn kind(&self) -> &InboxErrorKind {
        &self.kind
    }
}

impl std::fmt::Display for InboxError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.kind {
            InboxErrorKind::Backend(err) => writeln!(f, "Backend error: {err}"),
            InboxErrorKind::UnknownEnvelope(id) => writeln!(f, "Envelope {id} is not in flight"),
            InboxErrorKind::DuplicateEnvelope(id) => writeln!(f, "Envelope {id} is already queued"),
        }?;
        std::fmt::Display::fmt(&self.context, f)
    }
}

impl std::error::Error for InboxError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match &self.kind {
            InboxErrorKind::Backend(err) => Some(err.as_ref()),
            InboxErrorKind::UnknownEnvelope(_) | InboxErrorKind::DuplicateEnvelope(_) => None,
        }
    }
}

/// Trait for streaming envelopes waiting in the inbox.
///
/// The returned stream should:
/// - Yield envelopes in delivery order
/// - Respect cancellation via the provided [`CancellationToken`]
#[async_trait::async_trait]
pub trait ReceiveEnvelopes {
    /// Backend-specific error type.
    type Error;

    /// Name of the queue, as reported in notifications.
    fn name(&self) -> &str;

    /// Stream envelopes until exhaustion or cancellation.
    async fn envelopes(
        &self,
        cancel: CancellationToken,
    ) -> Result<BoxStream<'_, Result<Envelope, Self::Error>>, Self::Error>;
}

/// Trait for settling envelopes handed out by the inbox.
#[async_trait::async_trait]
pub trait AckEnvelopes {
    /// Backend-specific error type.
    type Error;

    /// The envelope was fully processed and can be forgotten.
    async fn ack(&self, envelope: &Envelope) -> Result<(), Self::Error>;

    /// The envelope could not be processed.
    async fn abandon(&self, envelope: Envelope) -> Result<(), Self::Error>;
}
