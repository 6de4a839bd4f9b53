//! Dispatch of envelopes to their handlers.
//!
//! For one envelope the [`DispatchEngine`]:
//!
//! 1. begins the envelope transaction
//! 2. opens an envelope scope under the root scope
//! 3. for every `(handler, item)` pair, in item order, opens an item scope,
//!    installs the dispatch context, resolves the handler, invokes it, clears
//!    the context and closes the item scope again
//! 4. commits the transaction and closes the envelope scope
//!
//! The first failing item aborts the envelope: later items are not invoked,
//! the envelope scope is released and the transaction is dropped, which rolls
//! it back. The dispatch context is cleared after every item, whether it
//! succeeded or not.
//!
//! The context is resolvable from the item scope while the handler is being
//! resolved, so services registered with [`Lifetime::PerItem`] or
//! [`Lifetime::Transient`] can take it as a dependency.
//!
//! [`Lifetime::PerItem`]: crate::scope::Lifetime::PerItem
//! [`Lifetime::Transient`]: crate::scope::Lifetime::Transient


use std::{
    fmt,
    future::Future,
    pin::Pin,
    sync::Arc,
    task::{Context, Poll},
    time::Duration,
};

use tower::Service;
use tracing_error::SpanTrace;

use crate::{
    binding::{BindingNotFound, Bindings, HandlerType, InvokeError, Unroutable},
    context::{ContextFactory, DefaultContextFactory},
    envelope::{Envelope, MessageItem, MessageType},
    observer::{
        ConfigurationWarning, DispatchingMessage, Observers, SystemEvent, SystemObserver,
        TracingObserver,
    },
    scope::{ResolutionError, Root, Scope, ScopeError, ScopeLevel},
    transaction::{TransactionFactory, TransactionOptions, TransactionScope},
};

/// Transactional, scope-aware dispatcher.
///
/// Cheap to clone; clones share the root scope and the bindings and can
/// dispatch different envelopes concurrently.
pub struct DispatchEngine<F, X = DefaultContextFactory>
where
    F: TransactionFactory,
    X: ContextFactory,
{
    inner: Arc<Inner<F, X>>,
}

struct Inner<F, X>
where
    F: TransactionFactory,
    X: ContextFactory,
{
    root: Arc<Root>,
    transactions: F,
    contexts: X,
    bindings: Bindings<F::Transaction, X::Context>,
    options: TransactionOptions,
    observer: Observers,
    hook: Arc<dyn DispatchHook>,
}

impl<F, X> Clone for DispatchEngine<F, X>
where
    F: TransactionFactory,
    X: ContextFactory,
{
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<F> DispatchEngine<F>
where
    F: TransactionFactory,
{
    /// Start configuring an engine resolving handlers from `root` and running
    /// envelopes in transactions begun by `transactions`.
    pub fn builder(root: Arc<Root>, transactions: F) -> DispatchEngineBuilder<F> {
        DispatchEngineBuilder {
            root,
            transactions,
            contexts: DefaultContextFactory,
            options: TransactionOptions::default(),
            observer: Observers::new(),
            hook: Arc::new(DefaultDispatchHook),
        }
    }
}

/// Builder for [`DispatchEngine`].
pub struct DispatchEngineBuilder<F, X = DefaultContextFactory> {
    root: Arc<Root>,
    transactions: F,
    contexts: X,
    options: TransactionOptions,
    observer: Observers,
    hook: Arc<dyn DispatchHook>,
}

impl<F, X> DispatchEngineBuilder<F, X>
where
    F: TransactionFactory,
    X: ContextFactory,
{
    /// Replace the context factory. Handlers bound afterwards receive the new
    /// context type.
    pub fn with_context_factory<X2: ContextFactory>(self, contexts: X2) -> DispatchEngineBuilder<F, X2> {
        DispatchEngineBuilder {
            root: self.root,
            transactions: self.transactions,
            contexts,
            options: self.options,
            observer: self.observer,
            hook: self.hook,
        }
    }

    pub fn with_options(mut self, options: TransactionOptions) -> Self {
        self.options = options;
        self
    }

    /// Add an observer. Without any, events are logged by [`TracingObserver`].
    pub fn with_observer(mut self, observer: impl SystemObserver + 'static) -> Self {
        self.observer.push(observer);
        self
    }

    pub fn with_hook(mut self, hook: impl DispatchHook + 'static) -> Self {
        self.hook = Arc::new(hook);
        self
    }

    /// Finish the engine with the handler bindings it dispatches to.
    pub fn build(self, bindings: Bindings<F::Transaction, X::Context>) -> DispatchEngine<F, X> {
        let mut observer = self.observer;
        if observer.is_empty() {
            observer.push(TracingObserver);
        }
        if bindings.directory().is_empty() {
            observer.notify(&SystemEvent::ConfigurationWarning(ConfigurationWarning {
                message: "No message contracts provided.".to_owned(),
            }));
        }

        DispatchEngine {
            inner: Arc::new(Inner {
                root: self.root,
                transactions: self.transactions,
                contexts: self.contexts,
                bindings,
                options: self.options,
                observer,
                hook: self.hook,
            }),
        }
    }
}

impl<F, X> DispatchEngine<F, X>
where
    F: TransactionFactory,
    X: ContextFactory,
{
    pub fn bindings(&self) -> &Bindings<F::Transaction, X::Context> {
        &self.inner.bindings
    }

    pub fn options(&self) -> &TransactionOptions {
        &self.inner.options
    }

    /// Dispatch every item of `envelope` to each handler bound to its type,
    /// in a new transaction.
    ///
    /// Fails without beginning a transaction if an item has no handler.
    #[tracing::instrument(skip_all, fields(envelope_id = envelope.id()))]
    pub async fn dispatch(&self, envelope: &Envelope) -> Result<DispatchReport, DispatchError> {
        let pairs = self
            .inner
            .bindings
            .directory()
            .route(envelope)
            .map_err(DispatchError::no_handler)?;
        self.dispatch_in_new_transaction(envelope, pairs).await
    }

    /// Dispatch explicit `(handler, item)` pairs of `envelope` in a new
    /// transaction. Pairs are dispatched in item order; pairs of the same item
    /// keep their relative order.
    #[tracing::instrument(skip_all, fields(envelope_id = envelope.id()))]
    pub async fn dispatch_pairs<'e, I>(
        &self,
        envelope: &'e Envelope,
        pairs: I,
    ) -> Result<DispatchReport, DispatchError>
    where
        I: IntoIterator<Item = (HandlerType, &'e MessageItem)>,
    {
        let mut pairs: Vec<_> = pairs.into_iter().collect();
        pairs.sort_by_key(|(_, item)| item.index());
        self.dispatch_in_new_transaction(envelope, pairs).await
    }

    /// Dispatch `envelope` while the caller holds a transaction of its own.
    ///
    /// With [`TransactionScope::Join`] every handler works in `outer` and
    /// committing is left to the caller. With
    /// [`TransactionScope::RequiresNew`] a separate transaction is begun and
    /// committed, independently of `outer`.
    #[tracing::instrument(skip_all, fields(envelope_id = envelope.id(), scope = ?self.inner.options.scope))]
    pub async fn dispatch_within(
        &self,
        envelope: &Envelope,
        outer: &mut F::Transaction,
    ) -> Result<DispatchReport, DispatchError> {
        let pairs = self
            .inner
            .bindings
            .directory()
            .route(envelope)
            .map_err(DispatchError::no_handler)?;

        match self.inner.options.scope {
            TransactionScope::RequiresNew => self.dispatch_in_new_transaction(envelope, pairs).await,
            TransactionScope::Join => {
                self.inner.hook.on_envelope_received(envelope);
                let result = self
                    .bounded(async {
                        let mut scope = self.open_envelope_scope()?;
                        let result = self.dispatch_items(envelope, &pairs, &mut scope, outer).await;
                        self.close_envelope_scope(scope);
                        result
                    })
                    .await;
                if let Err(err) = &result {
                    self.inner.hook.on_dispatch_failed(envelope, err);
                }
                result
            }
        }
    }

    async fn dispatch_in_new_transaction(
        &self,
        envelope: &Envelope,
        pairs: Vec<(HandlerType, &MessageItem)>,
    ) -> Result<DispatchReport, DispatchError> {
        let inner = &*self.inner;
        inner.hook.on_envelope_received(envelope);

        let result = self
            .bounded(async {
                let mut tx = inner
                    .transactions
                    .begin(envelope, &inner.options)
                    .await
                    .map_err(|e| DispatchError::transaction(e.into()))?;
                inner.hook.on_transaction_begun(envelope);

                let mut scope = self.open_envelope_scope()?;
                match self.dispatch_items(envelope, &pairs, &mut scope, &mut tx).await {
                    Ok(report) => {
                        let committed = inner
                            .transactions
                            .commit(tx)
                            .await
                            .map_err(|e| DispatchError::transaction(e.into()));
                        if committed.is_ok() {
                            inner.hook.on_transaction_completed(envelope);
                        }
                        self.close_envelope_scope(scope);
                        committed.map(|()| report)
                    }
                    Err(err) => {
                        self.close_envelope_scope(scope);
                        drop(tx);
                        Err(err)
                    }
                }
            })
            .await;

        if let Err(err) = &result {
            inner.hook.on_dispatch_failed(envelope, err);
        }
        result
    }

    async fn bounded<T>(
        &self,
        work: impl Future<Output = Result<T, DispatchError>>,
    ) -> Result<T, DispatchError> {
        match self.inner.options.timeout {
            Some(limit) => tokio::time::timeout(limit, work)
                .await
                .map_err(|_| DispatchError::timeout(limit))?,
            None => work.await,
        }
    }

    fn open_envelope_scope(&self) -> Result<Scope<'static>, DispatchError> {
        let scope = self
            .inner
            .root
            .child(ScopeLevel::Envelope)
            .map_err(DispatchError::scope)?;
        self.inner.hook.on_scope_opened(ScopeLevel::Envelope);
        Ok(scope)
    }

    fn close_envelope_scope(&self, scope: Scope<'static>) {
        scope.close();
        self.inner.hook.on_scope_closed(ScopeLevel::Envelope);
    }

    async fn dispatch_items(
        &self,
        envelope: &Envelope,
        pairs: &[(HandlerType, &MessageItem)],
        scope: &mut Scope<'static>,
        tx: &mut F::Transaction,
    ) -> Result<DispatchReport, DispatchError> {
        let mut report = DispatchReport {
            envelope_id: envelope.id().to_owned(),
            dispatched: Vec::with_capacity(pairs.len()),
        };

        for (handler, item) in pairs {
            let mut item_scope = scope.child(ScopeLevel::Item).map_err(DispatchError::scope)?;
            self.inner.hook.on_scope_opened(ScopeLevel::Item);

            let result = self
                .dispatch_item(&mut item_scope, envelope, *handler, item, tx)
                .await;

            item_scope.close();
            self.inner.hook.on_scope_closed(ScopeLevel::Item);
            result?;

            self.inner.hook.on_message_dispatched(*handler, item);
            report.dispatched.push(Dispatched {
                index: item.index(),
                message: item.mapped_type(),
                handler: *handler,
            });
        }

        Ok(report)
    }

    async fn dispatch_item(
        &self,
        scope: &mut Scope<'_>,
        envelope: &Envelope,
        handler: HandlerType,
        item: &MessageItem,
        tx: &mut F::Transaction,
    ) -> Result<(), DispatchError> {
        let inner = &*self.inner;

        // Installed before resolution so the handler's dependencies can
        // resolve the context from the item scope.
        let context = Arc::new(inner.contexts.create(envelope, item));
        scope
            .install_context(Arc::clone(&context))
            .map_err(DispatchError::scope)?;
        inner.hook.on_context_installed(item);

        let result = self
            .resolve_and_invoke(scope, envelope, handler, item, context.as_ref(), tx)
            .await;

        scope.clear_context();
        inner.hook.on_context_cleared(item);
        result
    }

    async fn resolve_and_invoke(
        &self,
        scope: &mut Scope<'_>,
        envelope: &Envelope,
        handler: HandlerType,
        item: &MessageItem,
        context: &X::Context,
        tx: &mut F::Transaction,
    ) -> Result<(), DispatchError> {
        let inner = &*self.inner;

        let instance = scope
            .resolve_instance(handler)
            .map_err(|e| DispatchError::resolution(handler, item.index(), e))?;
        let invoker = inner
            .bindings
            .binder()
            .bind(handler, item.mapped_type())
            .map_err(DispatchError::binding_not_found)?;

        inner
            .observer
            .notify(&SystemEvent::DispatchingMessage(DispatchingMessage {
                envelope_id: envelope.id().to_owned(),
                message_type: item.mapped_type(),
                handler_type: handler,
            }));

        invoker
            .invoke(instance, item, context, tx)
            .await
            .map_err(|e| match e {
                InvokeError::Mismatch => DispatchError::binding_not_found(BindingNotFound {
                    handler,
                    message: item.mapped_type(),
                }),
                InvokeError::Handler(source) => DispatchError::invocation(handler, item, source),
            })
    }
}

impl<F, X> Service<Envelope> for DispatchEngine<F, X>
where
    F: TransactionFactory,
    X: ContextFactory,
{
    type Response = DispatchReport;
    type Error = DispatchError;
    type Future = Pin<Box<dyn Future<Output = Result<DispatchReport, DispatchError>> + Send>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, envelope: Envelope) -> Self::Future {
        let engine = self.clone();
        Box::pin(async move { engine.dispatch(&envelope).await })
    }
}

/// One handler invocation that completed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Dispatched {
    pub index: usize,
    pub message: MessageType,
    pub handler: HandlerType,
}

/// Outcome of a successful envelope dispatch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DispatchReport {
    pub envelope_id: String,
    /// Invocations in the order they happened.
    pub dispatched: Vec<Dispatched>,
}

/// Error returned when an envelope could not be dispatched.
///
/// Handler errors are kept as they were raised; use
/// [`downcast_ref`](DispatchError::downcast_ref) or
/// [`into_handler_error`](DispatchError::into_handler_error) to get them back.
#[derive(Debug)]
pub struct DispatchError {
    context: SpanTrace,
    kind: DispatchErrorKind,
}

/// Dispatch errors kind.
#[derive(Debug)]
pub enum DispatchErrorKind {
    /// An item's message type has no handler bound to it.
    NoHandler { message: MessageType, index: usize },
    /// The handler could not be resolved from the item scope.
    Resolution {
        handler: HandlerType,
        index: usize,
        source: ResolutionError,
    },
    /// No invocable method for the handler and message types.
    BindingNotFound(BindingNotFound),
    /// The handler failed.
    Invocation {
        handler: HandlerType,
        message: MessageType,
        index: usize,
        source: tower::BoxError,
    },
    /// Beginning or committing the transaction failed.
    Transaction(tower::BoxError),
    /// The envelope did not complete within the transaction timeout.
    Timeout(Duration),
    /// The scope tree was misused.
    Scope(ScopeError),
}

impl DispatchError {
    fn new(kind: DispatchErrorKind) -> Self {
        Self {
            context: SpanTrace::capture(),
            kind,
        }
    }

    fn no_handler(unroutable: Unroutable) -> Self {
        Self::new(DispatchErrorKind::NoHandler {
            message: unroutable.message,
            index: unroutable.index,
        })
    }

    fn resolution(handler: HandlerType, index: usize, source: ResolutionError) -> Self {
        Self::new(DispatchErrorKind::Resolution {
            handler,
            index,
            source,
        })
    }

    fn binding_not_found(err: BindingNotFound) -> Self {
        Self::new(DispatchErrorKind::BindingNotFound(err))
    }

    fn invocation(handler: HandlerType, item: &MessageItem, source: tower::BoxError) -> Self {
        Self::new(DispatchErrorKind::Invocation {
            handler,
            message: item.mapped_type(),
            index: item.index(),
            source,
        })
    }

    fn transaction(err: tower::BoxError) -> Self {
        Self::new(DispatchErrorKind::Transaction(err))
    }

    fn timeout(limit: Duration) -> Self {
        Self::new(DispatchErrorKind::Timeout(limit))
    }

    fn scope(err: ScopeError) -> Self {
        Self::new(DispatchErrorKind::Scope(err))
    }

    pub fn kind(&self) -> &DispatchErrorKind {
        &self.kind
    }

    /// The handler's own error, if it is an `E`.
    pub fn downcast_ref<E: std::error::Error + 'static>(&self) -> Option<&E> {
        match &self.kind {
            DispatchErrorKind::Invocation { source, .. } => source.downcast_ref::<E>(),
            _ => None,
        }
    }

    /// Take the handler's own error out of an invocation failure.
    pub fn into_handler_error(self) -> Result<tower::BoxError, Self> {
        match self.kind {
            DispatchErrorKind::Invocation { source, .. } => Ok(source),
            kind => Err(Self {
                context: self.context,
                kind,
            }),
        }
    }
}

impl fmt::Display for DispatchError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.kind {
            DispatchErrorKind::NoHandler { message, index } => {
                writeln!(f, "No handler for message {message} at index {index}")
            }
            DispatchErrorKind::Resolution { handler, index, .. } => {
                writeln!(f, "Failed to resolve handler {handler} from the scope of item {index}.")
            }
            DispatchErrorKind::BindingNotFound(err) => writeln!(f, "Binding not found: {err}"),
            DispatchErrorKind::Invocation {
                handler,
                index,
                source,
                ..
            } => writeln!(f, "Handler {handler} failed on item {index}: {source}"),
            DispatchErrorKind::Transaction(err) => writeln!(f, "Transaction error: {err}"),
            DispatchErrorKind::Timeout(limit) => {
                writeln!(f, "Envelope not completed within {}s", limit.as_secs_f64())
            }
            DispatchErrorKind::Scope(err) => write!(f, "Scope error: {err}"),
        }?;
        fmt::Display::fmt(&self.context, f)
    }
}

impl std::error::Error for DispatchError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match &self.kind {
            DispatchErrorKind::Resolution { source, .. } => Some(source),
            DispatchErrorKind::BindingNotFound(err) => Some(err),
            DispatchErrorKind::Invocation { source, .. } => Some(source.as_ref()),
            DispatchErrorKind::Transaction(err) => Some(err.as_ref()),
            DispatchErrorKind::Scope(err) => Some(err),
            DispatchErrorKind::NoHandler { .. } | DispatchErrorKind::Timeout(_) => None,
        }
    }
}

/// Hook trait for observing the dispatch lifecycle.
///
/// Hooks are invoked synchronously and should avoid heavy or blocking work.
/// Typical use cases include logging, metrics, and tracing integration.
pub trait DispatchHook: Send + Sync {
    fn on_envelope_received(&self, envelope: &Envelope);
    fn on_transaction_begun(&self, envelope: &Envelope);
    fn on_scope_opened(&self, level: ScopeLevel);
    fn on_scope_closed(&self, level: ScopeLevel);
    fn on_context_installed(&self, item: &MessageItem);
    fn on_context_cleared(&self, item: &MessageItem);
    fn on_message_dispatched(&self, handler: HandlerType, item: &MessageItem);
    fn on_transaction_completed(&self, envelope: &Envelope);
    fn on_dispatch_failed(&self, envelope: &Envelope, error: &DispatchError);
}

/// Default dispatch hook implementation.
///
/// Logs lifecycle events using `tracing`.
pub struct DefaultDispatchHook;

impl DispatchHook for DefaultDispatchHook {
    fn on_envelope_received(&self, envelope: &Envelope) {
        tracing::debug!(items = envelope.items().len(), "Envelope received");
    }

    fn on_transaction_begun(&self, _envelope: &Envelope) {
        tracing::trace!("Transaction begun");
    }

    fn on_scope_opened(&self, level: ScopeLevel) {
        tracing::trace!(%level, "Scope opened");
    }

    fn on_scope_closed(&self, level: ScopeLevel) {
        tracing::trace!(%level, "Scope closed");
    }

    fn on_context_installed(&self, item: &MessageItem) {
        tracing::trace!(index = item.index(), "Context installed");
    }

    fn on_context_cleared(&self, item: &MessageItem) {
        tracing::trace!(index = item.index(), "Context cleared");
    }

    fn on_message_dispatched(&self, handler: HandlerType, item: &MessageItem) {
        tracing::debug!(%handler, index = item.index(), "Message dispatched");
    }

    fn on_transaction_completed(&self, _envelope: &Envelope) {
        tracing::info!("Envelope dispatched");
    }

    fn on_dispatch_failed(&self, _envelope: &Envelope, error: &DispatchError) {
        tracing::error!(?error, "Envelope dispatch failed, transaction rolled back");
    }
}
