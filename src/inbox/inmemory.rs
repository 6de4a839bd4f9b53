use async_trait::async_trait;
use futures_core::stream::BoxStream;
use std::{
    collections::{HashMap, VecDeque},
    sync::Arc,
};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

use crate::{
    envelope::Envelope,
    inbox::{AckEnvelopes, InboxError, ReceiveEnvelopes},
};

/// An in-memory inbox for testing or local usage.
///
/// Delivered envelopes wait in a FIFO queue. Streaming hands out everything
/// pending at that moment; handed out envelopes stay in flight until they are
/// acked or abandoned. Abandoned envelopes are kept aside and never redelivered.
#[derive(Clone)]
pub struct InMemoryInbox {
    name: Arc<str>,
    state: Arc<Mutex<State>>,
}

#[derive(Default)]
struct State {
    pending: VecDeque<Envelope>,
    in_flight: HashMap<String, Envelope>,
    acked: Vec<String>,
    abandoned: Vec<Envelope>,
}

impl InMemoryInbox {
    pub fn new(name: impl Into<Arc<str>>) -> Self {
        Self {
            name: name.into(),
            state: Arc::default(),
        }
    }

    /// Queue `envelope` for processing.
    ///
    /// Envelope ids identify deliveries on ack and abandon, so an id that is
    /// still pending or in flight is rejected.
    pub async fn deliver(&self, envelope: Envelope) -> Result<(), InboxError> {
        let mut state = self.state.lock().await;
        let id = envelope.id();
        if state.in_flight.contains_key(id) || state.pending.iter().any(|e| e.id() == id) {
            return Err(InboxError::duplicate_envelope(id));
        }
        state.pending.push_back(envelope);
        Ok(())
    }

    pub async fn pending(&self) -> usize {
        self.state.lock().await.pending.len()
    }

    pub async fn in_flight(&self) -> usize {
        self.state.lock().await.in_flight.len()
    }

    /// Ids of acknowledged envelopes, in ack order.
    pub async fn acked(&self) -> Vec<String> {
        self.state.lock().await.acked.clone()
    }

    /// Abandoned envelopes, in abandon order.
    pub async fn abandoned(&self) -> Vec<Envelope> {
        self.state.lock().await.abandoned.clone()
    }
}

#[async_trait]
impl ReceiveEnvelopes for InMemoryInbox {
    type Error = InboxError;

    fn name(&self) -> &str {
        &self.name
    }

    /// Stream all envelopes currently pending, in delivery order.
    async fn envelopes(
        &self,
        _cancel: CancellationToken,
    ) -> Result<BoxStream<'_, Result<Envelope, Self::Error>>, Self::Error> {
        let mut state = self.state.lock().await;
        let mut envelopes = Vec::with_capacity(state.pending.len());
        while let Some(envelope) = state.pending.pop_front() {
            state
                .in_flight
                .insert(envelope.id().to_owned(), envelope.clone());
            envelopes.push(Ok(envelope));
        }
        Ok(Box::pin(tokio_stream::iter(envelopes)))
    }
}

#[async_trait]
impl AckEnvelopes for InMemoryInbox {
    type Error = InboxError;

    async fn ack(&self, envelope: &Envelope) -> Result<(), InboxError> {
        let mut state = self.state.lock().await;
        state
            .in_flight
            .remove(envelope.id())
            .ok_or_else(|| InboxError::unknown_envelope(envelope.id()))?;
        state.acked.push(envelope.id().to_owned());
        Ok(())
    }

    async fn abandon(&self, envelope: Envelope) -> Result<(), InboxError> {
        let mut state = self.state.lock().await;
        state
            .in_flight
            .remove(envelope.id())
            .ok_or_else(|| InboxError::unknown_envelope(envelope.id()))?;
        state.abandoned.push(envelope);
        Ok(())
    }
}
