//! Lifetime scopes for handler instances.
//!
//! Scopes form a tree with exactly three levels:
//!
//! - [`Root`]: process lifetime, read-only, holds singletons
//! - Envelope: one per dispatched envelope, child of the root
//! - Item: one per dispatched message item, child of the envelope scope
//!
//! Every [`Scope`] owns the instances created in it and releases them when it
//! is closed (or dropped), running registered disposers in reverse creation
//! order. An item scope mutably borrows its envelope scope, so siblings can
//! never be alive at the same time.
//!
//! Services are declared up front in a [`Registry`] and frozen into a
//! [`Root`], which can then be shared between concurrently dispatching
//! workers.

use std::{
    any::{Any, TypeId},
    collections::HashMap,
    fmt,
    hash::{Hash, Hasher},
    sync::Arc,
};

use tracing_error::SpanTrace;

/// Type-erased instance held by a scope.
pub type Instance = Arc<dyn Any + Send + Sync>;

type Factory = Arc<dyn Fn(&mut Scope<'_>) -> Result<Instance, tower::BoxError> + Send + Sync>;
type Disposer = Arc<dyn Fn(&(dyn Any + Send + Sync)) + Send + Sync>;

/// Level of a scope in the scope tree.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ScopeLevel {
    Root,
    Envelope,
    Item,
}

impl ScopeLevel {
    /// The only level that may be nested directly under this one.
    pub fn child(self) -> Option<ScopeLevel> {
        match self {
            ScopeLevel::Root => Some(ScopeLevel::Envelope),
            ScopeLevel::Envelope => Some(ScopeLevel::Item),
            ScopeLevel::Item => None,
        }
    }
}

impl fmt::Display for ScopeLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ScopeLevel::Root => f.write_str("root"),
            ScopeLevel::Envelope => f.write_str("envelope"),
            ScopeLevel::Item => f.write_str("item"),
        }
    }
}

/// Identity of a service (handlers included) that can be resolved from a scope.
#[derive(Clone, Copy)]
pub struct ServiceType {
    id: TypeId,
    name: &'static str,
}

impl ServiceType {
    pub fn of<T: Any>() -> Self {
        Self {
            id: TypeId::of::<T>(),
            name: std::any::type_name::<T>(),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub(crate) fn type_id(&self) -> TypeId {
        self.id
    }
}

impl PartialEq for ServiceType {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for ServiceType {}

impl Hash for ServiceType {
    fn hash<S: Hasher>(&self, state: &mut S) {
        self.id.hash(state);
    }
}

impl fmt::Debug for ServiceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name)
    }
}

impl fmt::Display for ServiceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name)
    }
}

/// How long an instance produced by a factory lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lifetime {
    /// One instance per envelope scope, shared by all of its items.
    PerEnvelope,
    /// One instance per item scope.
    PerItem,
    /// A new instance on every resolution, owned by the resolving scope.
    Transient,
}

struct Registration {
    service: ServiceType,
    lifetime: Lifetime,
    factory: Factory,
    disposer: Option<Disposer>,
}

/// Declarations of the services scopes can resolve.
///
/// ```rust
/// use postmaster::scope::{Lifetime, Registry, ScopeLevel};
///
/// struct Clock(u64);
/// struct Greeter { clock: std::sync::Arc<Clock> }
///
/// let root = Registry::new()
///     .singleton(Clock(12))
///     .register(Lifetime::PerItem, |scope| Ok(Greeter { clock: scope.resolve::<Clock>()? }))
///     .into_root();
///
/// let mut envelope = root.child(ScopeLevel::Envelope).unwrap();
/// let mut item = envelope.child(ScopeLevel::Item).unwrap();
/// assert_eq!(item.resolve::<Greeter>().unwrap().clock.0, 12);
/// ```
#[derive(Default)]
pub struct Registry {
    registrations: HashMap<TypeId, Registration>,
    singletons: HashMap<TypeId, Instance>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a process-wide instance held by the root scope.
    pub fn singleton<T: Any + Send + Sync>(self, value: T) -> Self {
        self.singleton_arc(Arc::new(value))
    }

    /// Register an already shared process-wide instance.
    pub fn singleton_arc<T: Any + Send + Sync>(mut self, value: Arc<T>) -> Self {
        let id = TypeId::of::<T>();
        self.registrations.remove(&id);
        self.singletons.insert(id, value);
        self
    }

    /// Register a factory producing `T` with the given lifetime.
    ///
    /// The factory receives the scope the instance will belong to and may
    /// resolve its own dependencies from it.
    pub fn register<T, F>(self, lifetime: Lifetime, factory: F) -> Self
    where
        T: Any + Send + Sync,
        F: Fn(&mut Scope<'_>) -> Result<T, tower::BoxError> + Send + Sync + 'static,
    {
        self.insert::<T>(lifetime, erase(factory), None)
    }

    /// Register a factory together with a disposer run when the owning scope
    /// closes.
    pub fn register_disposable<T, F, D>(self, lifetime: Lifetime, factory: F, dispose: D) -> Self
    where
        T: Any + Send + Sync,
        F: Fn(&mut Scope<'_>) -> Result<T, tower::BoxError> + Send + Sync + 'static,
        D: Fn(&T) + Send + Sync + 'static,
    {
        let disposer: Disposer = Arc::new(move |instance: &(dyn Any + Send + Sync)| {
            if let Some(instance) = instance.downcast_ref::<T>() {
                dispose(instance);
            }
        });
        self.insert::<T>(lifetime, erase(factory), Some(disposer))
    }

    fn insert<T: Any>(mut self, lifetime: Lifetime, factory: Factory, disposer: Option<Disposer>) -> Self {
        let service = ServiceType::of::<T>();
        self.singletons.remove(&service.type_id());
        self.registrations.insert(
            service.type_id(),
            Registration {
                service,
                lifetime,
                factory,
                disposer,
            },
        );
        self
    }

    /// Whether `T` can be resolved at all.
    pub fn contains<T: Any>(&self) -> bool {
        let id = TypeId::of::<T>();
        self.singletons.contains_key(&id) || self.registrations.contains_key(&id)
    }

    /// Freeze the registry into a shareable root scope.
    pub fn into_root(self) -> Arc<Root> {
        Arc::new(Root {
            registrations: self.registrations,
            singletons: self.singletons,
        })
    }
}

fn erase<T, F>(factory: F) -> Factory
where
    T: Any + Send + Sync,
    F: Fn(&mut Scope<'_>) -> Result<T, tower::BoxError> + Send + Sync + 'static,
{
    Arc::new(move |scope: &mut Scope<'_>| factory(scope).map(|value| Arc::new(value) as Instance))
}

/// Process-lifetime root of the scope tree.
///
/// The root is read-only after construction and safe to share between
/// workers; it is never torn down by a dispatch.
pub struct Root {
    registrations: HashMap<TypeId, Registration>,
    singletons: HashMap<TypeId, Instance>,
}

impl Root {
    pub fn level(&self) -> ScopeLevel {
        ScopeLevel::Root
    }

    /// Create a child scope. Only [`ScopeLevel::Envelope`] is valid here.
    pub fn child(self: &Arc<Self>, level: ScopeLevel) -> Result<Scope<'static>, ScopeError> {
        if level != ScopeLevel::Envelope {
            return Err(ScopeError::invalid_nesting(ScopeLevel::Root, level));
        }
        tracing::trace!(%level, "scope opened");
        Ok(Scope::new(level, Arc::clone(self), None))
    }

    /// Fetch a singleton registered on the root.
    pub fn singleton<T: Any + Send + Sync>(&self) -> Option<Arc<T>> {
        self.singletons
            .get(&TypeId::of::<T>())
            .and_then(|instance| Arc::clone(instance).downcast::<T>().ok())
    }
}

impl fmt::Debug for Root {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Root")
            .field("registrations", &self.registrations.len())
            .field("singletons", &self.singletons.len())
            .finish()
    }
}

struct Owned {
    service: ServiceType,
    instance: Instance,
    disposer: Option<Disposer>,
}

/// An envelope or item scope.
///
/// Envelope scopes are `Scope<'static>`; item scopes borrow their envelope
/// scope mutably for `'p`.
pub struct Scope<'p> {
    level: ScopeLevel,
    root: Arc<Root>,
    parent: Option<&'p mut Scope<'static>>,
    cache: HashMap<TypeId, Instance>,
    owned: Vec<Owned>,
    context: Option<(TypeId, Instance)>,
    resolving: Vec<ServiceType>,
    disposed: bool,
}

impl<'p> Scope<'p> {
    fn new(level: ScopeLevel, root: Arc<Root>, parent: Option<&'p mut Scope<'static>>) -> Self {
        Self {
            level,
            root,
            parent,
            cache: HashMap::new(),
            owned: Vec::new(),
            context: None,
            resolving: Vec::new(),
            disposed: false,
        }
    }

    pub fn level(&self) -> ScopeLevel {
        self.level
    }

    /// Resolve a `T` visible from this scope.
    pub fn resolve<T: Any + Send + Sync>(&mut self) -> Result<Arc<T>, ResolutionError> {
        let service = ServiceType::of::<T>();
        self.resolve_instance(service)?
            .downcast::<T>()
            .map_err(|_| ResolutionError::type_mismatch(service))
    }

    /// Resolve a service by its type identity.
    pub fn resolve_instance(&mut self, service: ServiceType) -> Result<Instance, ResolutionError> {
        if let Some((id, context)) = &self.context {
            if *id == service.type_id() {
                return Ok(Arc::clone(context));
            }
        }

        let root = Arc::clone(&self.root);
        if let Some(singleton) = root.singletons.get(&service.type_id()) {
            return Ok(Arc::clone(singleton));
        }

        let registration = root
            .registrations
            .get(&service.type_id())
            .ok_or_else(|| ResolutionError::not_registered(service))?;

        match (registration.lifetime, self.level) {
            (Lifetime::Transient, _) => self.create(registration),
            (Lifetime::PerEnvelope, ScopeLevel::Envelope) | (Lifetime::PerItem, ScopeLevel::Item) => {
                if let Some(instance) = self.cache.get(&service.type_id()) {
                    return Ok(Arc::clone(instance));
                }
                let instance = self.create(registration)?;
                self.cache.insert(service.type_id(), Arc::clone(&instance));
                Ok(instance)
            }
            (Lifetime::PerEnvelope, ScopeLevel::Item) => match self.parent.as_deref_mut() {
                Some(parent) => parent.resolve_instance(service),
                None => Err(ResolutionError::out_of_scope(service, self.level)),
            },
            (_, level) => Err(ResolutionError::out_of_scope(service, level)),
        }
    }

    fn create(&mut self, registration: &Registration) -> Result<Instance, ResolutionError> {
        let service = registration.service;
        if self.resolving.contains(&service) {
            return Err(ResolutionError::cycle(service));
        }

        self.resolving.push(service);
        let created = (registration.factory)(self);
        self.resolving.pop();

        let instance = created.map_err(|e| ResolutionError::factory(service, e))?;
        self.owned.push(Owned {
            service,
            instance: Arc::clone(&instance),
            disposer: registration.disposer.clone(),
        });
        tracing::trace!(level = %self.level, %service, "instance created");
        Ok(instance)
    }

    /// Install the per-item dispatch context, making it resolvable as `C`.
    pub fn install_context<C: Any + Send + Sync>(&mut self, context: Arc<C>) -> Result<(), ScopeError> {
        if self.level != ScopeLevel::Item {
            return Err(ScopeError::context_outside_item(self.level));
        }
        self.context = Some((TypeId::of::<C>(), context));
        Ok(())
    }

    /// The installed context, if any and if it is a `C`.
    pub fn context<C: Any + Send + Sync>(&self) -> Option<Arc<C>> {
        self.context
            .as_ref()
            .and_then(|(_, context)| Arc::clone(context).downcast::<C>().ok())
    }

    /// Remove the installed context. Returns whether one was installed.
    pub fn clear_context(&mut self) -> bool {
        self.context.take().is_some()
    }

    /// Release the scope and everything it owns.
    pub fn close(mut self) {
        self.dispose();
    }

    fn dispose(&mut self) {
        if self.disposed {
            return;
        }
        self.disposed = true;
        self.context = None;
        self.cache.clear();

        while let Some(owned) = self.owned.pop() {
            if let Some(dispose) = &owned.disposer {
                tracing::trace!(level = %self.level, service = %owned.service, "disposing instance");
                dispose(owned.instance.as_ref());
            }
        }
        tracing::trace!(level = %self.level, "scope closed");
    }
}

impl Scope<'static> {
    /// Create a child scope. Only [`ScopeLevel::Item`] is valid under an
    /// envelope scope.
    pub fn child(&mut self, level: ScopeLevel) -> Result<Scope<'_>, ScopeError> {
        if self.level.child() != Some(level) {
            return Err(ScopeError::invalid_nesting(self.level, level));
        }
        if self.disposed {
            return Err(ScopeError::disposed(self.level));
        }
        tracing::trace!(%level, "scope opened");
        let root = Arc::clone(&self.root);
        Ok(Scope::new(level, root, Some(self)))
    }
}

impl Drop for Scope<'_> {
    fn drop(&mut self) {
        self.dispose();
    }
}

impl fmt::Debug for Scope<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Scope")
            .field("level", &self.level)
            .field("owned", &self.owned.len())
            .field("context", &self.context.is_some())
            .finish_non_exhaustive()
    }
}

/// Error returned when a service cannot be produced from a scope.
#[derive(Debug)]
pub struct ResolutionError {
    context: SpanTrace,
    service: ServiceType,
    kind: ResolutionErrorKind,
}

/// Resolution errors kind.
#[derive(Debug)]
pub enum ResolutionErrorKind {
    /// Nothing is registered for the service.
    NotRegistered,
    /// The service lifetime is not available at the requesting level.
    OutOfScope(ScopeLevel),
    /// The service (indirectly) depends on itself.
    Cycle,
    /// The registered factory failed.
    Factory(tower::BoxError),
    /// The resolved instance is not of the requested type.
    TypeMismatch,
}

impl ResolutionError {
    fn new(service: ServiceType, kind: ResolutionErrorKind) -> Self {
        Self {
            context: SpanTrace::capture(),
            service,
            kind,
        }
    }

    fn not_registered(service: ServiceType) -> Self {
        Self::new(service, ResolutionErrorKind::NotRegistered)
    }

    fn out_of_scope(service: ServiceType, level: ScopeLevel) -> Self {
        Self::new(service, ResolutionErrorKind::OutOfScope(level))
    }

    fn cycle(service: ServiceType) -> Self {
        Self::new(service, ResolutionErrorKind::Cycle)
    }

    fn factory(service: ServiceType, err: tower::BoxError) -> Self {
        Self::new(service, ResolutionErrorKind::Factory(err))
    }

    fn type_mismatch(service: ServiceType) -> Self {
        Self::new(service, ResolutionErrorKind::TypeMismatch)
    }

    /// The service that could not be resolved.
    pub fn service(&self) -> ServiceType {
        self.service
    }

    pub fn kind(&self) -> &ResolutionErrorKind {
        &self.kind
    }
}

impl fmt::Display for ResolutionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let service = self.service;
        match &self.kind {
            ResolutionErrorKind::NotRegistered => writeln!(f, "No registration for {service}"),
            ResolutionErrorKind::OutOfScope(level) => {
                writeln!(f, "{service} cannot be resolved from a {level} scope")
            }
            ResolutionErrorKind::Cycle => writeln!(f, "Dependency cycle while resolving {service}"),
            ResolutionErrorKind::Factory(err) => writeln!(f, "Factory for {service} failed: {err}"),
            ResolutionErrorKind::TypeMismatch => writeln!(f, "Instance registered for {service} has another type"),
        }?;
        fmt::Display::fmt(&self.context, f)
    }
}

impl std::error::Error for ResolutionError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match &self.kind {
            ResolutionErrorKind::Factory(err) => Some(err.as_ref()),
            _ => None,
        }
    }
}

/// Error returned for misuse of the scope tree.
#[derive(Debug)]
pub struct ScopeError {
    context: SpanTrace,
    kind: ScopeErrorKind,
}

/// Scope errors kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScopeErrorKind {
    /// A child of the requested level cannot be nested under the parent.
    InvalidNesting { parent: ScopeLevel, requested: ScopeLevel },
    /// Contexts can only be installed into item scopes.
    ContextOutsideItem(ScopeLevel),
    /// The parent scope has already been released.
    Disposed(ScopeLevel),
}

impl ScopeError {
    fn invalid_nesting(parent: ScopeLevel, requested: ScopeLevel) -> Self {
        Self {
            context: SpanTrace::capture(),
            kind: ScopeErrorKind::InvalidNesting { parent, requested },
        }
    }

    fn context_outside_item(level: ScopeLevel) -> Self {
        Self {
            context: SpanTrace::capture(),
            kind: ScopeErrorKind::ContextOutsideItem(level),
        }
    }

    fn disposed(level: ScopeLevel) -> Self {
        Self {
            context: SpanTrace::capture(),
            kind: ScopeErrorKind::Disposed(level),
        }
    }

    pub fn kind(&self) -> ScopeErrorKind {
        self.kind
    }
}

impl fmt::Display for ScopeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.kind {
            ScopeErrorKind::InvalidNesting { parent, requested } => {
                writeln!(f, "A {requested} scope cannot be nested under a {parent} scope")
            }
            ScopeErrorKind::ContextOutsideItem(level) => {
                writeln!(f, "Dispatch context installed into a {level} scope")
            }
            ScopeErrorKind::Disposed(level) => writeln!(f, "The {level} scope is already closed"),
        }?;
        fmt::Display::fmt(&self.context, f)
    }
}

impl std::error::Error for ScopeError {}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use super::*;

    type Journal = Arc<Mutex<Vec<String>>>;

    #[derive(Debug)]
    struct Connection;
    #[derive(Debug)]
    struct Repository {
        _connection: Arc<Connection>,
    }
    struct Tagged(&'static str);

    fn journaled(journal: &Journal) -> Registry {
        let (envelope_journal, item_journal) = (journal.clone(), journal.clone());
        Registry::new()
            .register_disposable(
                Lifetime::PerEnvelope,
                |_| Ok(Connection),
                move |_: &Connection| envelope_journal.lock().unwrap().push("connection".into()),
            )
            .register_disposable(
                Lifetime::PerItem,
                |scope| {
                    Ok(Repository {
                        _connection: scope.resolve::<Connection>()?,
                    })
                },
                move |_: &Repository| item_journal.lock().unwrap().push("repository".into()),
            )
    }

    #[test]
    fn nesting_is_limited_to_three_levels() {
        let root = Registry::new().into_root();
        assert_eq!(
            root.child(ScopeLevel::Item).unwrap_err().kind(),
            ScopeErrorKind::InvalidNesting {
                parent: ScopeLevel::Root,
                requested: ScopeLevel::Item
            }
        );

        let mut envelope = root.child(ScopeLevel::Envelope).unwrap();
        assert!(envelope.child(ScopeLevel::Envelope).is_err());
        let item = envelope.child(ScopeLevel::Item).unwrap();
        assert_eq!(item.level(), ScopeLevel::Item);
    }

    #[test]
    fn per_envelope_instances_are_shared_between_items() {
        let journal = Journal::default();
        let root = journaled(&journal).into_root();
        let mut envelope = root.child(ScopeLevel::Envelope).unwrap();

        let first = {
            let mut item = envelope.child(ScopeLevel::Item).unwrap();
            item.resolve::<Connection>().unwrap()
        };
        let second = {
            let mut item = envelope.child(ScopeLevel::Item).unwrap();
            item.resolve::<Connection>().unwrap()
        };
        assert!(Arc::ptr_eq(&first, &second));
    }

    #[test]
    fn per_item_instances_are_fresh_for_each_item() {
        let journal = Journal::default();
        let root = journaled(&journal).into_root();
        let mut envelope = root.child(ScopeLevel::Envelope).unwrap();

        let mut item = envelope.child(ScopeLevel::Item).unwrap();
        let a = item.resolve::<Repository>().unwrap();
        let b = item.resolve::<Repository>().unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        item.close();

        let mut item = envelope.child(ScopeLevel::Item).unwrap();
        let c = item.resolve::<Repository>().unwrap();
        assert!(!Arc::ptr_eq(&a, &c));
    }

    #[test]
    fn teardown_runs_item_before_envelope_exactly_once() {
        let journal = Journal::default();
        let root = journaled(&journal).into_root();

        let mut envelope = root.child(ScopeLevel::Envelope).unwrap();
        let mut item = envelope.child(ScopeLevel::Item).unwrap();
        item.resolve::<Repository>().unwrap();
        item.close();
        envelope.close();

        assert_eq!(*journal.lock().unwrap(), vec!["repository", "connection"]);
    }

    #[test]
    fn dropping_a_scope_disposes_in_reverse_creation_order() {
        let journal = Journal::default();
        let (first, second) = (journal.clone(), journal.clone());
        let root = Registry::new()
            .register_disposable(
                Lifetime::Transient,
                |_| Ok(Tagged("first")),
                move |t: &Tagged| first.lock().unwrap().push(t.0.into()),
            )
            .register_disposable(
                Lifetime::PerItem,
                |scope| {
                    scope.resolve::<Tagged>()?;
                    Ok(Connection)
                },
                move |_: &Connection| second.lock().unwrap().push("second".into()),
            )
            .into_root();

        let mut envelope = root.child(ScopeLevel::Envelope).unwrap();
        {
            let mut item = envelope.child(ScopeLevel::Item).unwrap();
            item.resolve::<Connection>().unwrap();
        }

        assert_eq!(*journal.lock().unwrap(), vec!["second", "first"]);
    }

    #[test]
    fn item_services_cannot_be_captured_by_envelope_scope() {
        let journal = Journal::default();
        let root = journaled(&journal).into_root();
        let mut envelope = root.child(ScopeLevel::Envelope).unwrap();

        let err = envelope.resolve::<Repository>().unwrap_err();
        assert!(matches!(err.kind(), ResolutionErrorKind::OutOfScope(ScopeLevel::Envelope)));
    }

    #[test]
    fn factory_failures_keep_the_underlying_cause() {
        let root = Registry::new()
            .register(Lifetime::PerItem, |_| -> Result<Connection, tower::BoxError> {
                Err("database is down".into())
            })
            .into_root();
        let mut envelope = root.child(ScopeLevel::Envelope).unwrap();
        let mut item = envelope.child(ScopeLevel::Item).unwrap();

        let err = item.resolve::<Connection>().unwrap_err();
        assert_eq!(err.service(), ServiceType::of::<Connection>());
        let source = std::error::Error::source(&err).unwrap();
        assert_eq!(source.to_string(), "database is down");
    }

    #[test]
    fn cycles_are_detected() {
        #[derive(Debug)]
        struct Chicken;
        struct Egg;
        let root = Registry::new()
            .register(Lifetime::Transient, |scope| {
                scope.resolve::<Egg>()?;
                Ok(Chicken)
            })
            .register(Lifetime::Transient, |scope| {
                scope.resolve::<Chicken>()?;
                Ok(Egg)
            })
            .into_root();
        let mut envelope = root.child(ScopeLevel::Envelope).unwrap();

        let err = envelope.resolve::<Chicken>().unwrap_err();
        assert!(matches!(err.kind(), ResolutionErrorKind::Factory(_)));
        let mut source = std::error::Error::source(&err);
        let mut saw_cycle = false;
        while let Some(cause) = source {
            if let Some(resolution) = cause.downcast_ref::<ResolutionError>() {
                saw_cycle |= matches!(resolution.kind(), ResolutionErrorKind::Cycle);
            }
            source = cause.source();
        }
        assert!(saw_cycle);
    }

    #[test]
    fn unregistered_services_fail() {
        let root = Registry::new().into_root();
        let mut envelope = root.child(ScopeLevel::Envelope).unwrap();
        let err = envelope.resolve::<Connection>().unwrap_err();
        assert!(matches!(err.kind(), ResolutionErrorKind::NotRegistered));
    }

    #[test]
    fn singletons_come_from_the_root() {
        let root = Registry::new().singleton(Tagged("shared")).into_root();
        let mut envelope = root.child(ScopeLevel::Envelope).unwrap();
        let mut item = envelope.child(ScopeLevel::Item).unwrap();

        let resolved = item.resolve::<Tagged>().unwrap();
        assert!(Arc::ptr_eq(&resolved, &root.singleton::<Tagged>().unwrap()));
    }

    #[test]
    fn context_is_resolvable_until_cleared() {
        let root = Registry::new().into_root();
        let mut envelope = root.child(ScopeLevel::Envelope).unwrap();
        assert!(envelope.install_context(Arc::new(5_usize)).is_err());

        let mut item = envelope.child(ScopeLevel::Item).unwrap();
        item.install_context(Arc::new(5_usize)).unwrap();
        assert_eq!(*item.resolve::<usize>().unwrap(), 5);
        assert_eq!(item.context::<usize>().as_deref(), Some(&5));

        assert!(item.clear_context());
        assert!(item.context::<usize>().is_none());
        assert!(!item.clear_context());
    }
}
