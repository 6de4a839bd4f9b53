//! Handler bindings and method lookup.
//!
//! Discovery of which handler consumes which message happens outside this
//! crate; its result is declared here with [`BindingsBuilder::bind`], which
//! also compiles the typed invocation thunk for the pair. The resulting
//! [`Bindings`] are immutable and shared read-only by every dispatch:
//!
//! - [`HandlerDirectory`]: the set of `(handler, message)` pairs and routing
//!   of envelope items to handler types
//! - [`MethodBinder`]: `(handler, message) → invoker` lookup table
//!
//! The shape every handler must have is the [`Handle`] trait: one message
//! argument, no result besides success or the handler's own error.

use std::{any::TypeId, collections::HashMap, fmt, marker::PhantomData};

use async_trait::async_trait;

use crate::{
    context::MessageContext,
    envelope::{Content, Envelope, MessageItem, MessageType},
    scope::{Instance, ServiceType},
};

/// Handlers are services resolved from an item scope.
pub type HandlerType = ServiceType;

/// Consumes messages of type `M`.
///
/// `T` is the transaction (unit of work) shared by every handler of the
/// envelope, `C` the per-item context produced by the engine's
/// [`ContextFactory`](crate::context::ContextFactory).
///
/// ```rust
/// use postmaster::{Handle, MessageContext};
///
/// struct Deposit { cents: u64 }
/// struct Ledger;
///
/// #[async_trait::async_trait]
/// impl Handle<Deposit, Vec<u64>> for Ledger {
///     type Error = std::convert::Infallible;
///
///     async fn handle(
///         &self,
///         message: &Deposit,
///         _context: &MessageContext,
///         tx: &mut Vec<u64>,
///     ) -> Result<(), Self::Error> {
///         tx.push(message.cents);
///         Ok(())
///     }
/// }
/// ```
#[async_trait]
pub trait Handle<M, T, C = MessageContext>: Send + Sync + 'static {
    /// Error raised by the handler's own logic. It reaches the caller of the
    /// dispatch unchanged.
    type Error: Into<tower::BoxError> + Send;

    async fn handle(&self, message: &M, context: &C, tx: &mut T) -> Result<(), Self::Error>;
}

/// A declared pairing of a handler type and the message type it consumes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HandlerBinding {
    pub handler: HandlerType,
    pub message: MessageType,
}

/// Read-only directory of handler bindings.
#[derive(Debug, Clone, Default)]
pub struct HandlerDirectory {
    bindings: Vec<HandlerBinding>,
    by_message: HashMap<MessageType, Vec<HandlerType>>,
}

impl HandlerDirectory {
    fn insert(&mut self, binding: HandlerBinding) -> bool {
        if self.bindings.contains(&binding) {
            return false;
        }
        self.bindings.push(binding);
        self.by_message
            .entry(binding.message)
            .or_default()
            .push(binding.handler);
        true
    }

    /// All bindings, in declaration order.
    pub fn bindings(&self) -> &[HandlerBinding] {
        &self.bindings
    }

    pub fn is_empty(&self) -> bool {
        self.bindings.is_empty()
    }

    /// Distinct message types with at least one handler.
    pub fn message_types(&self) -> Vec<MessageType> {
        let mut seen = Vec::new();
        for binding in &self.bindings {
            if !seen.contains(&binding.message) {
                seen.push(binding.message);
            }
        }
        seen
    }

    /// Distinct handler types.
    pub fn handler_types(&self) -> Vec<HandlerType> {
        let mut seen = Vec::new();
        for binding in &self.bindings {
            if !seen.contains(&binding.handler) {
                seen.push(binding.handler);
            }
        }
        seen
    }

    /// Handlers bound to `message`, in declaration order.
    pub fn handlers_for(&self, message: MessageType) -> &[HandlerType] {
        self.by_message
            .get(&message)
            .map(Vec::as_slice)
            .unwrap_or_default()
    }

    /// Pair every item of `envelope` with each handler bound to its type.
    ///
    /// Pairs come out in item order, then declaration order. Fails on the
    /// first item nobody handles.
    pub fn route<'e>(
        &self,
        envelope: &'e Envelope,
    ) -> Result<Vec<(HandlerType, &'e MessageItem)>, Unroutable> {
        let mut pairs = Vec::with_capacity(envelope.items().len());
        for item in envelope.items() {
            let handlers = self.handlers_for(item.mapped_type());
            if handlers.is_empty() {
                return Err(Unroutable {
                    message: item.mapped_type(),
                    index: item.index(),
                });
            }
            pairs.extend(handlers.iter().map(|handler| (*handler, item)));
        }
        Ok(pairs)
    }
}

/// An envelope item whose type has no handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Unroutable {
    pub message: MessageType,
    pub index: usize,
}

impl fmt::Display for Unroutable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "No handler bound to {} (item {})", self.message, self.index)
    }
}

impl std::error::Error for Unroutable {}

/// No invocable method for a `(handler, message)` pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BindingNotFound {
    pub handler: HandlerType,
    pub message: MessageType,
}

impl fmt::Display for BindingNotFound {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} has no method consuming {}", self.handler, self.message)
    }
}

impl std::error::Error for BindingNotFound {}

/// Failure of a bound invocation.
#[derive(Debug)]
pub enum InvokeError {
    /// The handler instance or message content is not of the bound types.
    Mismatch,
    /// The handler returned an error.
    Handler(tower::BoxError),
}

#[async_trait]
trait Invoke<T, C>: Send + Sync {
    async fn invoke(
        &self,
        handler: Instance,
        message: &Content,
        context: &C,
        tx: &mut T,
    ) -> Result<(), InvokeError>;
}

struct Thunk<H, M> {
    _marker: PhantomData<fn() -> (H, M)>,
}

#[async_trait]
impl<H, M, T, C> Invoke<T, C> for Thunk<H, M>
where
    H: Handle<M, T, C>,
    M: Send + Sync + 'static,
    T: Send,
    C: Sync,
{
    async fn invoke(
        &self,
        handler: Instance,
        message: &Content,
        context: &C,
        tx: &mut T,
    ) -> Result<(), InvokeError> {
        let handler = handler.downcast::<H>().map_err(|_| InvokeError::Mismatch)?;
        let message = message.downcast_ref::<M>().ok_or(InvokeError::Mismatch)?;
        handler
            .handle(message, context, tx)
            .await
            .map_err(|e| InvokeError::Handler(e.into()))
    }
}

/// Invocable method bound to a `(handler, message)` pair.
pub struct Invoker<'a, T, C> {
    binding: HandlerBinding,
    invoke: &'a dyn Invoke<T, C>,
}

impl<T, C> Invoker<'_, T, C> {
    pub fn binding(&self) -> HandlerBinding {
        self.binding
    }

    /// Call the handler with the item's content as its message.
    pub async fn invoke(
        &self,
        handler: Instance,
        item: &MessageItem,
        context: &C,
        tx: &mut T,
    ) -> Result<(), InvokeError> {
        self.invoke.invoke(handler, item.content(), context, tx).await
    }
}

/// Lookup table from `(handler, message)` to invoker, populated once.
pub struct MethodBinder<T, C = MessageContext> {
    invokers: HashMap<(TypeId, TypeId), Box<dyn Invoke<T, C>>>,
}

impl<T, C> MethodBinder<T, C> {
    pub fn bind(
        &self,
        handler: HandlerType,
        message: MessageType,
    ) -> Result<Invoker<'_, T, C>, BindingNotFound> {
        self.invokers
            .get(&(handler.type_id(), message.type_id()))
            .map(|invoke| Invoker {
                binding: HandlerBinding { handler, message },
                invoke: invoke.as_ref(),
            })
            .ok_or(BindingNotFound { handler, message })
    }

    pub fn len(&self) -> usize {
        self.invokers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.invokers.is_empty()
    }
}

/// Handler directory and method binder built from the same declarations.
pub struct Bindings<T, C = MessageContext> {
    directory: HandlerDirectory,
    binder: MethodBinder<T, C>,
}

impl<T, C> Bindings<T, C> {
    pub fn builder() -> BindingsBuilder<T, C> {
        BindingsBuilder::default()
    }

    pub fn directory(&self) -> &HandlerDirectory {
        &self.directory
    }

    pub fn binder(&self) -> &MethodBinder<T, C> {
        &self.binder
    }
}

impl<T, C> fmt::Debug for Bindings<T, C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Bindings")
            .field("directory", &self.directory)
            .finish_non_exhaustive()
    }
}

/// Declares handler bindings.
pub struct BindingsBuilder<T, C = MessageContext> {
    directory: HandlerDirectory,
    invokers: HashMap<(TypeId, TypeId), Box<dyn Invoke<T, C>>>,
}

impl<T, C> Default for BindingsBuilder<T, C> {
    fn default() -> Self {
        Self {
            directory: HandlerDirectory::default(),
            invokers: HashMap::new(),
        }
    }
}

impl<T, C> BindingsBuilder<T, C>
where
    T: Send + 'static,
    C: Sync + 'static,
{
    /// Declare that handler `H` consumes messages of type `M`.
    ///
    /// Declaring the same pair twice has no effect.
    pub fn bind<H, M>(mut self) -> Self
    where
        H: Handle<M, T, C>,
        M: Send + Sync + 'static,
    {
        let binding = HandlerBinding {
            handler: HandlerType::of::<H>(),
            message: MessageType::of::<M>(),
        };
        if self.directory.insert(binding) {
            self.invokers.insert(
                (binding.handler.type_id(), binding.message.type_id()),
                Box::new(Thunk::<H, M> {
                    _marker: PhantomData,
                }),
            );
        }
        self
    }

    pub fn build(self) -> Bindings<T, C> {
        Bindings {
            directory: self.directory,
            binder: MethodBinder {
                invokers: self.invokers,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;

    struct Ping;
    struct Pong;
    struct Pinger;
    struct Auditor;

    #[derive(Debug)]
    struct Refused;

    impl fmt::Display for Refused {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            f.write_str("refused")
        }
    }

    impl std::error::Error for Refused {}

    #[async_trait]
    impl Handle<Ping, Vec<&'static str>> for Pinger {
        type Error = std::convert::Infallible;

        async fn handle(
            &self,
            _message: &Ping,
            _context: &MessageContext,
            tx: &mut Vec<&'static str>,
        ) -> Result<(), Self::Error> {
            tx.push("pinger");
            Ok(())
        }
    }

    #[async_trait]
    impl Handle<Ping, Vec<&'static str>> for Auditor {
        type Error = Refused;

        async fn handle(
            &self,
            _message: &Ping,
            _context: &MessageContext,
            _tx: &mut Vec<&'static str>,
        ) -> Result<(), Self::Error> {
            Err(Refused)
        }
    }

    fn bindings() -> Bindings<Vec<&'static str>> {
        Bindings::builder()
            .bind::<Pinger, Ping>()
            .bind::<Auditor, Ping>()
            .bind::<Pinger, Ping>()
            .build()
    }

    fn context() -> MessageContext {
        MessageContext {
            envelope_id: "e".into(),
            message_index: 0,
            created_at: chrono::Utc::now(),
        }
    }

    #[test]
    fn directory_keeps_declaration_order_without_duplicates() {
        let bindings = bindings();
        let directory = bindings.directory();

        assert_eq!(directory.bindings().len(), 2);
        assert_eq!(
            directory.handlers_for(MessageType::of::<Ping>()),
            &[HandlerType::of::<Pinger>(), HandlerType::of::<Auditor>()]
        );
        assert_eq!(directory.message_types(), vec![MessageType::of::<Ping>()]);
        assert_eq!(bindings.binder().len(), 2);
    }

    #[test]
    fn routing_fans_out_in_item_order() {
        let bindings = bindings();
        let envelope = Envelope::builder("e").message(Ping).message(Ping).build().unwrap();

        let pairs = bindings.directory().route(&envelope).unwrap();
        let routed: Vec<_> = pairs.iter().map(|(h, i)| (*h, i.index())).collect();
        assert_eq!(
            routed,
            vec![
                (HandlerType::of::<Pinger>(), 0),
                (HandlerType::of::<Auditor>(), 0),
                (HandlerType::of::<Pinger>(), 1),
                (HandlerType::of::<Auditor>(), 1),
            ]
        );
    }

    #[test]
    fn routing_fails_for_unhandled_messages() {
        let bindings = bindings();
        let envelope = Envelope::builder("e").message(Ping).message(Pong).build().unwrap();

        let err = bindings.directory().route(&envelope).unwrap_err();
        assert_eq!(
            err,
            Unroutable {
                message: MessageType::of::<Pong>(),
                index: 1
            }
        );
    }

    #[test]
    fn unbound_pairs_are_reported() {
        let bindings = bindings();
        let err = bindings
            .binder()
            .bind(HandlerType::of::<Pinger>(), MessageType::of::<Pong>())
            .err()
            .unwrap();
        assert_eq!(err.handler, HandlerType::of::<Pinger>());
        assert_eq!(err.message, MessageType::of::<Pong>());
    }

    #[tokio::test]
    async fn invoker_calls_the_handler_with_the_message() {
        let bindings = bindings();
        let item = MessageItem::new(0, Ping);
        let mut tx = Vec::new();

        let invoker = bindings
            .binder()
            .bind(HandlerType::of::<Pinger>(), item.mapped_type())
            .unwrap();
        invoker
            .invoke(Arc::new(Pinger), &item, &context(), &mut tx)
            .await
            .unwrap();

        assert_eq!(tx, vec!["pinger"]);
    }

    #[tokio::test]
    async fn invoker_preserves_the_handler_error() {
        let bindings = bindings();
        let item = MessageItem::new(0, Ping);

        let invoker = bindings
            .binder()
            .bind(HandlerType::of::<Auditor>(), item.mapped_type())
            .unwrap();
        let err = invoker
            .invoke(Arc::new(Auditor), &item, &context(), &mut Vec::new())
            .await
            .unwrap_err();

        match err {
            InvokeError::Handler(err) => assert!(err.downcast_ref::<Refused>().is_some()),
            InvokeError::Mismatch => panic!("expected the handler error"),
        }
    }

    #[tokio::test]
    async fn invoker_rejects_foreign_instances() {
        let bindings = bindings();
        let item = MessageItem::new(0, Ping);

        let invoker = bindings
            .binder()
            .bind(HandlerType::of::<Pinger>(), item.mapped_type())
            .unwrap();
        let err = invoker
            .invoke(Arc::new(Auditor), &item, &context(), &mut Vec::new())
            .await
            .unwrap_err();
        assert!(matches!(err, InvokeError::Mismatch));
    }
}
