use async_trait::async_trait;
use sqlx::{PgPool, Postgres};

use crate::{
    envelope::Envelope,
    transaction::{TransactionFactory, TransactionOptions},
};

/// Postgres transaction handed to handlers.
pub type PgTransaction = sqlx::Transaction<'static, Postgres>;

/// SQLx-based Postgres transaction factory.
///
/// Every envelope runs in its own database transaction at the configured
/// isolation level. Handlers use `&mut **tx` as their executor.
#[derive(Clone)]
pub struct PgTransactions {
    pool: PgPool,
}

impl PgTransactions {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

#[async_trait]
impl TransactionFactory for PgTransactions {
    type Transaction = PgTransaction;
    type Error = sqlx::Error;

    #[tracing::instrument(skip_all, fields(envelope_id = envelope.id()))]
    async fn begin(
        &self,
        envelope: &Envelope,
        options: &TransactionOptions,
    ) -> Result<PgTransaction, sqlx::Error> {
        let mut tx = self.pool.begin().await?;
        let statement = format!(
            "SET TRANSACTION ISOLATION LEVEL {}",
            options.isolation_level.as_sql()
        );
        sqlx::query(&statement).execute(&mut *tx).await?;
        Ok(tx)
    }

    #[tracing::instrument(skip_all)]
    async fn commit(&self, tx: PgTransaction) -> Result<(), sqlx::Error> {
        tx.commit().await
    }
}
