//! Per-item dispatch context.
//!
//! A [`ContextFactory`] turns envelope and item metadata into the value a
//! handler receives alongside its message. The engine creates one context per
//! dispatched item and installs it into the item scope before the handler is
//! resolved, so the handler's own dependencies can resolve it too. It is
//! cleared once the item is done.

use std::marker::PhantomData;

use chrono::{DateTime, Utc};

use crate::envelope::{Envelope, MessageItem};

/// Builds the context exposed to a handler while it processes one item.
pub trait ContextFactory: Send + Sync + 'static {
    /// Context type handed to handlers.
    type Context: Send + Sync + 'static;

    /// Create the context for `item`. Must not have side effects.
    fn create(&self, envelope: &Envelope, item: &MessageItem) -> Self::Context;
}

/// Transport-level information about the message being handled.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageContext {
    pub envelope_id: String,
    pub message_index: usize,
    pub created_at: DateTime<Utc>,
}

/// Factory producing [`MessageContext`].
#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultContextFactory;

impl ContextFactory for DefaultContextFactory {
    type Context = MessageContext;

    fn create(&self, envelope: &Envelope, item: &MessageItem) -> MessageContext {
        MessageContext {
            envelope_id: envelope.id().to_owned(),
            message_index: item.index(),
            created_at: envelope.created_at(),
        }
    }
}

/// Context factory backed by a closure. See [`context_fn`].
pub struct FnContextFactory<F, C> {
    create: F,
    _context: PhantomData<fn() -> C>,
}

/// Use a closure as a [`ContextFactory`].
///
/// ```rust
/// use postmaster::context::{ContextFactory, context_fn};
/// use postmaster::Envelope;
///
/// let factory = context_fn(|envelope: &Envelope, item: &postmaster::MessageItem| {
///     format!("{}#{}", envelope.id(), item.index())
/// });
///
/// let envelope = Envelope::builder("e-7").message(()).build().unwrap();
/// assert_eq!(factory.create(&envelope, &envelope.items()[0]), "e-7#0");
/// ```
pub fn context_fn<F, C>(create: F) -> FnContextFactory<F, C>
where
    F: Fn(&Envelope, &MessageItem) -> C + Send + Sync + 'static,
    C: Send + Sync + 'static,
{
    FnContextFactory {
        create,
        _context: PhantomData,
    }
}

impl<F, C> ContextFactory for FnContextFactory<F, C>
where
    F: Fn(&Envelope, &MessageItem) -> C + Send + Sync + 'static,
    C: Send + Sync + 'static,
{
    type Context = C;

    fn create(&self, envelope: &Envelope, item: &MessageItem) -> C {
        (self.create)(envelope, item)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_context_describes_the_item() {
        let created_at = Utc::now();
        let envelope = Envelope::builder("env-42")
            .created_at(created_at)
            .message("a")
            .message("b")
            .build()
            .unwrap();

        let context = DefaultContextFactory.create(&envelope, &envelope.items()[1]);

        assert_eq!(
            context,
            MessageContext {
                envelope_id: "env-42".into(),
                message_index: 1,
                created_at,
            }
        );
    }
}
