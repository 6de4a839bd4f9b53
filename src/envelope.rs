//! Envelopes and the message items they carry.
//!
//! An [`Envelope`] is the unit of delivery handed to the dispatch engine by
//! the transport layer. It is immutable once built: items are stored sorted by
//! their index, and that order is the dispatch order.

use std::{
    any::{Any, TypeId},
    collections::BTreeMap,
    fmt,
    hash::{Hash, Hasher},
    sync::Arc,
};

use chrono::{DateTime, Utc};

/// Opaque message payload shared between the envelope and the handler call.
pub type Content = Arc<dyn Any + Send + Sync>;

/// Logical type of a message, used to route it to its handlers.
///
/// Identity is the Rust [`TypeId`]; the type name is kept for diagnostics.
#[derive(Clone, Copy)]
pub struct MessageType {
    id: TypeId,
    name: &'static str,
}

impl MessageType {
    /// The message type of `M`.
    pub fn of<M: Any>() -> Self {
        Self {
            id: TypeId::of::<M>(),
            name: std::any::type_name::<M>(),
        }
    }

    /// Fully qualified type name.
    pub fn name(&self) -> &'static str {
        self.name
    }

    pub(crate) fn type_id(&self) -> TypeId {
        self.id
    }
}

impl PartialEq for MessageType {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for MessageType {}

impl Hash for MessageType {
    fn hash<S: Hasher>(&self, state: &mut S) {
        self.id.hash(state);
    }
}

impl fmt::Debug for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name)
    }
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name)
    }
}

/// One typed payload within an envelope, at a fixed position.
#[derive(Clone)]
pub struct MessageItem {
    index: usize,
    mapped_type: MessageType,
    content: Content,
}

impl MessageItem {
    /// Wrap `message` as the item at `index`.
    pub fn new<M: Any + Send + Sync>(index: usize, message: M) -> Self {
        Self {
            index,
            mapped_type: MessageType::of::<M>(),
            content: Arc::new(message),
        }
    }

    /// Position of the item within its envelope.
    pub fn index(&self) -> usize {
        self.index
    }

    /// Logical type of the payload.
    pub fn mapped_type(&self) -> MessageType {
        self.mapped_type
    }

    /// Type-erased payload.
    pub fn content(&self) -> &Content {
        &self.content
    }

    /// Borrow the payload as `M`, if that is its type.
    pub fn downcast_ref<M: Any>(&self) -> Option<&M> {
        self.content.downcast_ref()
    }
}

impl fmt::Debug for MessageItem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MessageItem")
            .field("index", &self.index)
            .field("mapped_type", &self.mapped_type)
            .finish_non_exhaustive()
    }
}

impl<M: Any + Send + Sync> From<(usize, M)> for MessageItem {
    fn from(value: (usize, M)) -> Self {
        MessageItem::new(value.0, value.1)
    }
}

/// Unit of delivery containing one or more ordered message items.
///
/// ## Example
///
/// ```rust
/// use postmaster::Envelope;
///
/// let envelope = Envelope::builder("env-1")
///     .message("first")
///     .message(42_u32)
///     .attribute("tenant", "acme")
///     .build()
///     .unwrap();
///
/// assert_eq!(envelope.items().len(), 2);
/// assert_eq!(envelope.items()[1].downcast_ref::<u32>(), Some(&42));
/// ```
#[derive(Debug, Clone)]
pub struct Envelope {
    id: String,
    created_at: DateTime<Utc>,
    items: Vec<MessageItem>,
    attributes: BTreeMap<String, String>,
}

impl Envelope {
    /// Start building an envelope with the given id.
    pub fn builder(id: impl Into<String>) -> EnvelopeBuilder {
        EnvelopeBuilder {
            id: id.into(),
            created_at: None,
            items: Vec::new(),
            attributes: BTreeMap::new(),
        }
    }

    /// Assemble an envelope from items produced elsewhere.
    ///
    /// Items are sorted by index. Fails if there are no items or if two
    /// items share an index.
    pub fn from_items(
        id: impl Into<String>,
        created_at: DateTime<Utc>,
        mut items: Vec<MessageItem>,
    ) -> Result<Self, EnvelopeError> {
        if items.is_empty() {
            return Err(EnvelopeError::empty());
        }
        items.sort_by_key(MessageItem::index);
        if let Some(pair) = items.windows(2).find(|w| w[0].index == w[1].index) {
            return Err(EnvelopeError::duplicate_index(pair[0].index));
        }

        Ok(Self {
            id: id.into(),
            created_at,
            items,
            attributes: BTreeMap::new(),
        })
    }

    /// Attach transport attributes.
    pub fn with_attributes(mut self, attributes: BTreeMap<String, String>) -> Self {
        self.attributes = attributes;
        self
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    /// Items in dispatch order.
    pub fn items(&self) -> &[MessageItem] {
        &self.items
    }

    pub fn attributes(&self) -> &BTreeMap<String, String> {
        &self.attributes
    }

    pub fn attribute(&self, key: &str) -> Option<&str> {
        self.attributes.get(key).map(String::as_str)
    }
}

/// Builder for [`Envelope`]; indices are assigned in insertion order.
#[derive(Debug)]
pub struct EnvelopeBuilder {
    id: String,
    created_at: Option<DateTime<Utc>>,
    items: Vec<MessageItem>,
    attributes: BTreeMap<String, String>,
}

impl EnvelopeBuilder {
    /// Override the creation timestamp (defaults to now).
    pub fn created_at(mut self, created_at: DateTime<Utc>) -> Self {
        self.created_at = Some(created_at);
        self
    }

    /// Append a message as the next item.
    pub fn message<M: Any + Send + Sync>(mut self, message: M) -> Self {
        let index = self.items.len();
        self.items.push(MessageItem::new(index, message));
        self
    }

    pub fn attribute(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.attributes.insert(key.into(), value.into());
        self
    }

    pub fn build(self) -> Result<Envelope, EnvelopeError> {
        let created_at = self.created_at.unwrap_or_else(Utc::now);
        Ok(Envelope::from_items(self.id, created_at, self.items)?.with_attributes(self.attributes))
    }
}

/// Error returned when an envelope violates its structural invariants.
#[derive(Debug)]
pub struct EnvelopeError {
    kind: EnvelopeErrorKind,
}

/// Envelope errors kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnvelopeErrorKind {
    /// The envelope carries no items.
    Empty,
    /// Two items claim the same index.
    DuplicateIndex(usize),
}

impl EnvelopeError {
    fn empty() -> Self {
        Self {
            kind: EnvelopeErrorKind::Empty,
        }
    }

    fn duplicate_index(index: usize) -> Self {
        Self {
            kind: EnvelopeErrorKind::DuplicateIndex(index),
        }
    }

    pub fn kind(&self) -> EnvelopeErrorKind {
        self.kind
    }
}

impl fmt::Display for EnvelopeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.kind {
            EnvelopeErrorKind::Empty => write!(f, "Envelope has no message items"),
            EnvelopeErrorKind::DuplicateIndex(index) => {
                write!(f, "Envelope has more than one item at index {index}")
            }
        }
    }
}

impl std::error::Error for EnvelopeError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builder_assigns_sequential_indices() {
        let envelope = Envelope::builder("e1")
            .message("a")
            .message(7_i64)
            .build()
            .unwrap();

        let indices: Vec<_> = envelope.items().iter().map(MessageItem::index).collect();
        assert_eq!(indices, vec![0, 1]);
        assert_eq!(envelope.items()[0].mapped_type(), MessageType::of::<&str>());
        assert_eq!(envelope.items()[1].downcast_ref::<i64>(), Some(&7));
    }

    #[test]
    fn from_items_sorts_by_index() {
        let envelope = Envelope::from_items(
            "e2",
            Utc::now(),
            vec![(2, "c").into(), (0, "a").into(), (1, "b").into()],
        )
        .unwrap();

        let payloads: Vec<_> = envelope
            .items()
            .iter()
            .map(|i| *i.downcast_ref::<&str>().unwrap())
            .collect();
        assert_eq!(payloads, vec!["a", "b", "c"]);
    }

    #[test]
    fn duplicate_indices_are_rejected() {
        let err = Envelope::from_items("e3", Utc::now(), vec![(1, "x").into(), (1, "y").into()])
            .unwrap_err();
        assert_eq!(err.kind(), EnvelopeErrorKind::DuplicateIndex(1));
    }

    #[test]
    fn empty_envelope_is_rejected() {
        let err = Envelope::builder("e4").build().unwrap_err();
        assert_eq!(err.kind(), EnvelopeErrorKind::Empty);
    }

    #[test]
    fn attributes_survive_build() {
        let envelope = Envelope::builder("e5")
            .message(())
            .attribute("queue", "orders")
            .build()
            .unwrap();
        assert_eq!(envelope.attribute("queue"), Some("orders"));
        assert_eq!(envelope.attribute("missing"), None);
    }
}
