//! Transaction boundary around the dispatch of one envelope.
//!
//! A [`TransactionFactory`] begins one transaction per envelope and commits it
//! once every item has been handled. Transactions are plain values: dropping
//! one without passing it to [`TransactionFactory::commit`] rolls it back.
//!
//! Backends:
//!
//! - [`inmemory`]: unit of work over an in-process key/value store
//! - [`sqlx`]: Postgres transactions (feature `sqlx`)
//!
//! [`TransactionOptions`] can be loaded from configuration with any serde
//! format:
//!
//! ```rust
//! use std::time::Duration;
//! use postmaster::transaction::{IsolationLevel, TransactionOptions, TransactionScope};
//!
//! let options: TransactionOptions = serde_json::from_str(
//!     r#"{ "isolation_level": "read_committed", "timeout_seconds": 30 }"#,
//! ).unwrap();
//!
//! assert_eq!(options.scope, TransactionScope::RequiresNew);
//! assert_eq!(options.isolation_level, IsolationLevel::ReadCommitted);
//! assert_eq!(options.timeout, Some(Duration::from_secs(30)));
//! ```

pub mod inmemory;

#[cfg(feature = "sqlx")]
pub mod sqlx;

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Deserializer, de::Error as _};

use crate::envelope::Envelope;

/// Default upper bound for processing one envelope.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10 * 60);

/// Relation between the envelope transaction and one already in progress.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransactionScope {
    /// Always begin a fresh transaction, independent of any ambient one.
    #[default]
    RequiresNew,
    /// Run inside the caller's transaction. The caller commits.
    Join,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IsolationLevel {
    #[default]
    Serializable,
    RepeatableRead,
    ReadCommitted,
    ReadUncommitted,
}

impl IsolationLevel {
    /// SQL spelling, as used in `SET TRANSACTION ISOLATION LEVEL`.
    pub fn as_sql(&self) -> &'static str {
        match self {
            IsolationLevel::Serializable => "SERIALIZABLE",
            IsolationLevel::RepeatableRead => "REPEATABLE READ",
            IsolationLevel::ReadCommitted => "READ COMMITTED",
            IsolationLevel::ReadUncommitted => "READ UNCOMMITTED",
        }
    }
}

/// Options of the envelope transaction.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct TransactionOptions {
    pub scope: TransactionScope,
    pub isolation_level: IsolationLevel,
    /// Upper bound from begin to commit. `None` waits forever.
    #[serde(rename = "timeout_seconds", deserialize_with = "deserialize_timeout")]
    pub timeout: Option<Duration>,
}

impl Default for TransactionOptions {
    fn default() -> Self {
        Self {
            scope: TransactionScope::default(),
            isolation_level: IsolationLevel::default(),
            timeout: Some(DEFAULT_TIMEOUT),
        }
    }
}

impl TransactionOptions {
    pub fn with_scope(mut self, scope: TransactionScope) -> Self {
        self.scope = scope;
        self
    }

    pub fn with_isolation_level(mut self, isolation_level: IsolationLevel) -> Self {
        self.isolation_level = isolation_level;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Disable the timeout, e.g. while stepping through handlers in a
    /// debugger.
    pub fn without_timeout(mut self) -> Self {
        self.timeout = None;
        self
    }
}

fn deserialize_timeout<'de, D>(deserializer: D) -> Result<Option<Duration>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Timeout {
        Seconds(u64),
        Named(String),
    }

    match Timeout::deserialize(deserializer)? {
        Timeout::Seconds(seconds) => Ok(Some(Duration::from_secs(seconds))),
        Timeout::Named(name) if name == "infinite" => Ok(None),
        Timeout::Named(other) => Err(D::Error::custom(format!(
            "invalid timeout `{other}`, expected a number of seconds or \"infinite\""
        ))),
    }
}

/// Source of envelope transactions.
///
/// Dropping a [`Transaction`](TransactionFactory::Transaction) that was never
/// committed must roll it back.
#[async_trait]
pub trait TransactionFactory: Send + Sync + 'static {
    /// Unit of work handed to every handler of the envelope.
    type Transaction: Send;
    /// Backend-specific error type.
    type Error: Into<tower::BoxError> + Send;

    /// Begin the transaction for `envelope`.
    async fn begin(
        &self,
        envelope: &Envelope,
        options: &TransactionOptions,
    ) -> Result<Self::Transaction, Self::Error>;

    /// Make every change of `tx` durable.
    async fn commit(&self, tx: Self::Transaction) -> Result<(), Self::Error>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_serializable_requires_new_ten_minutes() {
        let options = TransactionOptions::default();
        assert_eq!(options.scope, TransactionScope::RequiresNew);
        assert_eq!(options.isolation_level, IsolationLevel::Serializable);
        assert_eq!(options.timeout, Some(Duration::from_secs(600)));
    }

    #[test]
    fn empty_configuration_falls_back_to_defaults() {
        let options: TransactionOptions = serde_json::from_str("{}").unwrap();
        assert_eq!(options, TransactionOptions::default());
    }

    #[test]
    fn infinite_timeout_disables_the_bound() {
        let options: TransactionOptions =
            serde_json::from_str(r#"{ "scope": "join", "timeout_seconds": "infinite" }"#).unwrap();
        assert_eq!(options.scope, TransactionScope::Join);
        assert_eq!(options.timeout, None);
    }

    #[test]
    fn unknown_timeout_names_are_rejected() {
        let err = serde_json::from_str::<TransactionOptions>(r#"{ "timeout_seconds": "soon" }"#)
            .unwrap_err();
        assert!(err.to_string().contains("soon"));
    }

    #[test]
    fn builders_override_single_fields() {
        let options = TransactionOptions::default()
            .with_isolation_level(IsolationLevel::RepeatableRead)
            .with_timeout(Duration::from_secs(5))
            .without_timeout();
        assert_eq!(options.isolation_level.as_sql(), "REPEATABLE READ");
        assert_eq!(options.timeout, None);
    }
}
