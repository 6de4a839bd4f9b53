use std::time::Duration;

use postmaster::inbox::inmemory::InMemoryInbox;
use postmaster::transaction::sqlx::{PgTransaction, PgTransactions};
use postmaster::transaction::{IsolationLevel, TransactionOptions};
use postmaster::{Bindings, Consumer, DispatchEngine, Envelope, Handle, Lifetime, MessageContext, Registry};
use sqlx::PgPool;
use sqlx::postgres::PgConnectOptions;
use tokio_util::sync::CancellationToken;
use tracing_error::ErrorLayer;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::prelude::*;

#[derive(Debug)]
struct MoneyDeposited {
    account: String,
    cents: i64,
}

struct Balances;

#[async_trait::async_trait]
impl Handle<MoneyDeposited, PgTransaction> for Balances {
    type Error = sqlx::Error;

    async fn handle(
        &self,
        message: &MoneyDeposited,
        context: &MessageContext,
        tx: &mut PgTransaction,
    ) -> Result<(), Self::Error> {
        sqlx::query(
            "INSERT INTO balances (account, cents) VALUES ($1, $2)
             ON CONFLICT (account) DO UPDATE SET cents = balances.cents + EXCLUDED.cents",
        )
        .bind(&message.account)
        .bind(message.cents)
        .execute(&mut **tx)
        .await?;

        sqlx::query("INSERT INTO deposits (envelope_id, message_index, cents) VALUES ($1, $2, $3)")
            .bind(&context.envelope_id)
            .bind(context.message_index as i32)
            .bind(message.cents)
            .execute(&mut **tx)
            .await?;
        Ok(())
    }
}

#[tokio::main]
async fn main() {
    dotenv::dotenv().unwrap();

    let fmt_layer = tracing_subscriber::fmt::layer().with_target(false);
    tracing_subscriber::registry()
        .with(fmt_layer)
        .with(EnvFilter::from_default_env())
        .with(ErrorLayer::default())
        .init();

    // Postgres connection
    let pool = PgPool::connect_with(PgConnectOptions::new()).await.unwrap();
    sqlx::query("CREATE TABLE IF NOT EXISTS balances (account TEXT PRIMARY KEY, cents BIGINT NOT NULL)")
        .execute(&pool)
        .await
        .unwrap();
    sqlx::query(
        "CREATE TABLE IF NOT EXISTS deposits (
            envelope_id TEXT NOT NULL,
            message_index INT NOT NULL,
            cents BIGINT NOT NULL,
            PRIMARY KEY (envelope_id, message_index)
        )",
    )
    .execute(&pool)
    .await
    .unwrap();

    let root = Registry::new()
        .register(Lifetime::PerItem, |_| Ok(Balances))
        .into_root();
    let engine = DispatchEngine::builder(root, PgTransactions::new(pool))
        .with_options(TransactionOptions::default().with_isolation_level(IsolationLevel::ReadCommitted))
        .build(Bindings::builder().bind::<Balances, MoneyDeposited>().build());

    let cancel = CancellationToken::new();
    let cancel_signal = cancel.clone();
    tokio::spawn(async move {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
        cancel_signal.cancel();
    });

    let inbox = InMemoryInbox::new("deposits");
    let mut id = 0;
    while !cancel.is_cancelled() {
        let envelope = Envelope::builder(format!("deposit-{id}"))
            .message(MoneyDeposited {
                account: format!("account-{}", id % 3),
                cents: 100,
            })
            .build()
            .unwrap();
        inbox.deliver(envelope).await.unwrap();

        Consumer::new(inbox.clone(), engine.clone())
            .run(cancel.clone())
            .await
            .unwrap();

        id += 1;
        tokio::time::sleep(Duration::from_millis(200)).await;
    }
}
