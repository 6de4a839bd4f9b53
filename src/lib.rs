#![doc = include_str!("../README.md")]

pub mod binding;
mod consumer;
pub mod context;
pub mod engine;
pub mod envelope;
pub mod inbox;
pub mod observer;
pub mod scope;
pub mod transaction;

#[doc(inline)]
pub use envelope::{Envelope, EnvelopeError, MessageItem, MessageType};

#[doc(inline)]
pub use binding::{Bindings, Handle, HandlerDirectory, HandlerType, MethodBinder};

#[doc(inline)]
pub use context::{ContextFactory, DefaultContextFactory, MessageContext};

#[doc(inline)]
pub use scope::{Lifetime, Registry, ResolutionError, Root, Scope, ScopeError, ScopeLevel};

#[doc(inline)]
pub use transaction::{TransactionFactory, TransactionOptions};

#[doc(inline)]
pub use engine::{
    DefaultDispatchHook, DispatchEngine, DispatchError, DispatchErrorKind, DispatchHook,
    DispatchReport,
};

#[doc(inline)]
pub use observer::{SystemEvent, SystemObserver};

#[doc(inline)]
pub use consumer::{
    Consumer, ConsumerHook, ConsumerRunError, ConsumerRunErrorKind, DefaultConsumerHook,
};
