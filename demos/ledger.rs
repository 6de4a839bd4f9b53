use std::{fmt, sync::Arc};

use postmaster::inbox::inmemory::InMemoryInbox;
use postmaster::transaction::inmemory::{InMemoryStore, UnitOfWork};
use postmaster::{
    Bindings, Consumer, DispatchEngine, Envelope, Handle, Lifetime, MessageContext, Registry,
};
use tokio_util::sync::CancellationToken;
use tracing_error::ErrorLayer;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::prelude::*;

#[derive(Debug)]
struct AccountOpened {
    account: String,
}

#[derive(Debug)]
struct MoneyDeposited {
    account: String,
    cents: i64,
}

#[derive(Debug)]
struct MoneyWithdrawn {
    account: String,
    cents: i64,
}

#[derive(Debug)]
enum LedgerError {
    InsufficientFunds { account: String, balance: i64 },
    Serde(serde_json::Error),
}

impl fmt::Display for LedgerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LedgerError::InsufficientFunds { account, balance } => {
                write!(f, "insufficient funds on {account} (balance {balance})")
            }
            LedgerError::Serde(err) => write!(f, "serde error: {err}"),
        }
    }
}

impl std::error::Error for LedgerError {}

impl From<serde_json::Error> for LedgerError {
    fn from(err: serde_json::Error) -> Self {
        LedgerError::Serde(err)
    }
}

/// Keeps one balance per account.
struct Accounts {
    store: Arc<InMemoryStore>,
}

impl Accounts {
    async fn balance(&self, account: &str, tx: &UnitOfWork) -> i64 {
        let value = match tx.staged(account) {
            Some(value) => Some(value.clone()),
            None => self.store.get(account).await,
        };
        value.and_then(|v| v.as_i64()).unwrap_or(0)
    }
}

#[async_trait::async_trait]
impl Handle<AccountOpened, UnitOfWork> for Accounts {
    type Error = LedgerError;

    async fn handle(
        &self,
        message: &AccountOpened,
        _context: &MessageContext,
        tx: &mut UnitOfWork,
    ) -> Result<(), Self::Error> {
        Ok(tx.put(&message.account, 0)?)
    }
}

#[async_trait::async_trait]
impl Handle<MoneyDeposited, UnitOfWork> for Accounts {
    type Error = LedgerError;

    async fn handle(
        &self,
        message: &MoneyDeposited,
        _context: &MessageContext,
        tx: &mut UnitOfWork,
    ) -> Result<(), Self::Error> {
        let balance = self.balance(&message.account, tx).await;
        Ok(tx.put(&message.account, balance + message.cents)?)
    }
}

#[async_trait::async_trait]
impl Handle<MoneyWithdrawn, UnitOfWork> for Accounts {
    type Error = LedgerError;

    async fn handle(
        &self,
        message: &MoneyWithdrawn,
        _context: &MessageContext,
        tx: &mut UnitOfWork,
    ) -> Result<(), Self::Error> {
        let balance = self.balance(&message.account, tx).await;
        if balance < message.cents {
            return Err(LedgerError::InsufficientFunds {
                account: message.account.clone(),
                balance,
            });
        }
        Ok(tx.put(&message.account, balance - message.cents)?)
    }
}

#[tokio::main]
async fn main() {
    let fmt_layer = tracing_subscriber::fmt::layer().with_target(false);
    tracing_subscriber::registry()
        .with(fmt_layer)
        .with(EnvFilter::from_default_env())
        .with(ErrorLayer::default())
        .init();

    let store = InMemoryStore::new();
    let root = Registry::new()
        .singleton(store.clone())
        .register(Lifetime::PerEnvelope, |scope| {
            Ok(Accounts {
                store: scope.resolve::<InMemoryStore>()?,
            })
        })
        .into_root();

    let engine = DispatchEngine::builder(root, store.clone()).build(
        Bindings::builder()
            .bind::<Accounts, AccountOpened>()
            .bind::<Accounts, MoneyDeposited>()
            .bind::<Accounts, MoneyWithdrawn>()
            .build(),
    );

    let inbox = InMemoryInbox::new("ledger");
    let envelopes = [
        Envelope::builder("open-acme")
            .message(AccountOpened {
                account: "acme".into(),
            })
            .message(MoneyDeposited {
                account: "acme".into(),
                cents: 100,
            })
            .build(),
        Envelope::builder("withdraw-30")
            .message(MoneyWithdrawn {
                account: "acme".into(),
                cents: 30,
            })
            .build(),
        Envelope::builder("overdraw")
            .message(MoneyDeposited {
                account: "acme".into(),
                cents: 5,
            })
            .message(MoneyWithdrawn {
                account: "acme".into(),
                cents: 500,
            })
            .build(),
    ];
    for envelope in envelopes {
        inbox.deliver(envelope.unwrap()).await.unwrap();
    }

    Consumer::new(inbox.clone(), engine)
        .run(CancellationToken::new())
        .await
        .unwrap();

    let balance = store.get("acme").await;
    let acked = inbox.acked().await;
    let abandoned = inbox.abandoned().await.len();
    tracing::info!(
        ?balance,
        ?acked,
        abandoned,
        committed = store.committed(),
        rolled_back = store.rolled_back(),
        "Ledger settled"
    );
}
