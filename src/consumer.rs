//! Consumer loop feeding inbox envelopes to a dispatcher.
//!
//! This module implements a generic *inbox consumer* that:
//!
//! - Streams envelopes from an inbox
//! - Hands each one to a dispatcher `tower::Service`, usually a
//!   [`DispatchEngine`](crate::DispatchEngine)
//! - Acknowledges dispatched envelopes and abandons the ones that failed
//! - Reports both outcomes to a [`SystemObserver`]; a failed envelope is
//!   reported with the error its handler raised, not the dispatch wrapper
//!
//! The consumer runs until:
//! - The inbox stream ends
//! - A fatal error occurs
//! - A [`CancellationToken`] is triggered

use std::sync::Arc;

use tokio_stream::StreamExt as _;
use tokio_util::sync::CancellationToken;
use tower::{Service, ServiceExt as _};

use crate::{
    engine::DispatchError,
    envelope::Envelope,
    inbox::{AckEnvelopes, ReceiveEnvelopes},
    observer::{EnvelopeAcked, EnvelopeInboxFailed, Observers, SystemEvent, SystemObserver, TracingObserver},
};

/// Inbox consumer.
///
/// Generic parameters:
/// - `I`: Inbox implementation
/// - `S`: Dispatcher service
/// - `HK`: Hook implementation for lifecycle events
pub struct Consumer<I, S, HK = DefaultConsumerHook> {
    inbox: I,
    service: S,
    hook: HK,
    observer: Observers,
}

impl<I, S> Consumer<I, S, DefaultConsumerHook>
where
    I: ReceiveEnvelopes + AckEnvelopes,
    S: Service<Envelope>,
{
    /// Create a new consumer with the default hook implementation.
    pub fn new(inbox: I, service: S) -> Self {
        Self {
            inbox,
            service,
            hook: DefaultConsumerHook,
            observer: Observers::new(),
        }
    }
}

impl<I, S, HK> Consumer<I, S, HK>
where
    I: ReceiveEnvelopes + AckEnvelopes + Send + Sync,
    <I as ReceiveEnvelopes>::Error: Into<tower::BoxError>,
    <I as AckEnvelopes>::Error: Into<tower::BoxError>,
    S: Service<Envelope> + Send,
    S::Error: Into<tower::BoxError>,
    S::Future: Send,
    HK: ConsumerHook,
{
    /// Replace the consumer hook while keeping all other generics unchanged.
    pub fn with_hook<HK2: ConsumerHook>(self, hook: HK2) -> Consumer<I, S, HK2> {
        Consumer {
            inbox: self.inbox,
            service: self.service,
            hook,
            observer: self.observer,
        }
    }

    /// Add an observer. Without any, events are logged by [`TracingObserver`].
    pub fn with_observer(mut self, observer: impl SystemObserver + 'static) -> Self {
        self.observer.push(observer);
        self
    }

    /// Run the consumer loop.
    ///
    /// Every envelope is dispatched exactly once. A dispatch failure abandons
    /// the envelope and the loop moves on to the next one; inbox and
    /// service readiness failures end the loop.
    #[tracing::instrument(skip_all, fields(inbox = self.inbox.name()))]
    pub async fn run(mut self, cancel: CancellationToken) -> Result<(), ConsumerRunError> {
        if self.observer.is_empty() {
            self.observer.push(TracingObserver);
        }
        self.hook.on_startup();

        let inbox_name = self.inbox.name().to_owned();
        let mut envelope_stream = self
            .inbox
            .envelopes(cancel.clone())
            .await
            .map_err(|e| ConsumerRunError::inbox(e.into()))?;

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    self.hook.on_shutdown();
                    break;
                }
                envelope = envelope_stream.next() => {
                    match envelope {
                        Some(Ok(envelope)) => {
                            self.hook.on_envelope_received(&envelope);

                            let service = self
                                .service
                                .ready()
                                .await
                                .map_err(|e| ConsumerRunError::service(e.into()))?;

                            match service.call(envelope.clone()).await {
                                Ok(_) => {
                                    self.hook.on_envelope_dispatched(&envelope);
                                    match self.inbox.ack(&envelope).await {
                                        Ok(()) => self.observer.notify(&SystemEvent::EnvelopeAcked(EnvelopeAcked {
                                            queue_name: inbox_name.clone(),
                                            envelope_id: envelope.id().to_owned(),
                                            attributes: envelope
                                                .attributes()
                                                .iter()
                                                .map(|(k, v)| (k.clone(), v.clone()))
                                                .collect(),
                                        })),
                                        Err(e) => self.hook.on_ack_error(e.into().as_ref()),
                                    }
                                }
                                Err(e) => {
                                    let error: Arc<dyn std::error::Error + Send + Sync> =
                                        Arc::from(handler_error(e.into()));
                                    self.hook.on_dispatch_error(&envelope, error.as_ref());
                                    self.observer.notify(&SystemEvent::EnvelopeInboxFailed(EnvelopeInboxFailed {
                                        inbox_name: inbox_name.clone(),
                                        envelope_id: Some(envelope.id().to_owned()),
                                        error,
                                    }));
                                    if let Err(e) = self.inbox.abandon(envelope).await {
                                        self.hook.on_ack_error(e.into().as_ref());
                                    }
                                }
                            }
                        }
                        Some(Err(err)) => {
                            let err: tower::BoxError = err.into();
                            self.hook.on_receive_error(err.as_ref());
                            let error: Arc<dyn std::error::Error + Send + Sync> = Arc::from(err);
                            self.observer.notify(&SystemEvent::EnvelopeInboxFailed(EnvelopeInboxFailed {
                                inbox_name: inbox_name.clone(),
                                envelope_id: None,
                                error: Arc::clone(&error),
                            }));
                            return Err(ConsumerRunError::inbox_shared(error));
                        }
                        None => {
                            self.hook.on_inbox_stream_end();
                            return Ok(());
                        }
                    }
                }
            }
        }

        Ok(())
    }
}

/// Reduce a dispatcher failure to the error the handler itself raised, when
/// there is one. Other failures are passed on as they are.
fn handler_error(error: tower::BoxError) -> tower::BoxError {
    match error.downcast::<DispatchError>() {
        Ok(dispatch) => (*dispatch)
            .into_handler_error()
            .unwrap_or_else(|err| Box::new(err) as tower::BoxError),
        Err(error) => error,
    }
}

/// Error returned when the consumer loop fails.
#[derive(Debug)]
pub struct ConsumerRunError {
    context: tracing_error::SpanTrace,
    kind: ConsumerRunErrorKind,
}

impl ConsumerRunError {
    fn inbox(error: tower::BoxError) -> Self {
        Self::inbox_shared(Arc::from(error))
    }

    fn inbox_shared(error: Arc<dyn std::error::Error + Send + Sync>) -> Self {
        Self {
            context: tracing_error::SpanTrace::capture(),
            kind: ConsumerRunErrorKind::Inbox(error),
        }
    }

    fn service(error: tower::BoxError) -> Self {
        Self {
            context: tracing_error::SpanTrace::capture(),
            kind: ConsumerRunErrorKind::Service(error),
        }
    }

    pub fn kind(&self) -> &ConsumerRunErrorKind {
        &self.kind
    }
}

/// Classification of consumer runtime errors.
#[derive(Debug)]
pub enum ConsumerRunErrorKind {
    /// Errors originating from the inbox.
    Inbox(Arc<dyn std::error::Error + Send + Sync>),
    /// The dispatcher service could not become ready.
    Service(tower::BoxError),
}

impl std::fmt::Display for ConsumerRunError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.kind {
            ConsumerRunErrorKind::Inbox(err) => writeln!(f, "Inbox error: {err}"),
            ConsumerRunErrorKind::Service(err) => writeln!(f, "Dispatcher error: {err}"),
        }?;
        std::fmt::Display::fmt(&self.context, f)
    }
}

impl std::error::Error for ConsumerRunError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match &self.kind {
            ConsumerRunErrorKind::Inbox(err) => Some(err.as_ref()),
            ConsumerRunErrorKind::Service(err) => Some(err.as_ref()),
        }
    }
}

/// Hook trait for observing consumer lifecycle events.
///
/// Hooks are invoked synchronously and should avoid heavy or blocking work.
pub trait ConsumerHook: Send + Sync {
    fn on_startup(&self);
    fn on_shutdown(&self);
    fn on_envelope_received(&self, envelope: &Envelope);
    fn on_receive_error(&self, error: &dyn std::error::Error);
    fn on_envelope_dispatched(&self, envelope: &Envelope);
    fn on_dispatch_error(&self, envelope: &Envelope, error: &dyn std::error::Error);
    fn on_ack_error(&self, error: &dyn std::error::Error);
    fn on_inbox_stream_end(&self);
}

/// Default consumer hook implementation.
///
/// Logs lifecycle events using `tracing`.
pub struct DefaultConsumerHook;

impl ConsumerHook for DefaultConsumerHook {
    fn on_startup(&self) {
        tracing::info!("Consumer is starting up");
    }

    fn on_shutdown(&self) {
        tracing::info!("Consumer is shutting down");
    }

    fn on_envelope_received(&self, envelope: &Envelope) {
        tracing::debug!(envelope_id = envelope.id(), "Envelope received");
    }

    fn on_receive_error(&self, error: &dyn std::error::Error) {
        tracing::error!(?error, "Error receiving envelope");
    }

    fn on_envelope_dispatched(&self, envelope: &Envelope) {
        tracing::debug!(envelope_id = envelope.id(), "Envelope dispatched");
    }

    fn on_dispatch_error(&self, envelope: &Envelope, error: &dyn std::error::Error) {
        tracing::warn!(envelope_id = envelope.id(), %error, "Envelope abandoned");
    }

    fn on_ack_error(&self, error: &dyn std::error::Error) {
        tracing::error!(?error, "Failed to settle envelope");
    }

    fn on_inbox_stream_end(&self) {
        tracing::info!("Inbox stream ended");
    }
}
