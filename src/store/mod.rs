//! Postgres-backed wallet ledger.
//!
//! Every operation goes through [`TxRunner`]: one Read-Committed transaction
//! per attempt, bounded retries for transient failures, immediate return for
//! business errors. Balance guards are single conditional `UPDATE`s, so row
//! locks taken by Postgres are the only serialization between callers.

mod report;
mod runner;
mod wallets;

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use rust_decimal::{Decimal, RoundingStrategy};
use sqlx::PgPool;
use tracing::info;

use crate::error::LedgerResult;
use crate::metrics::Recorder;

pub use runner::{RetryPolicy, TxRunner};

/// Scope of the uniqueness constraint behind idempotency keys
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum KeyScope {
    /// A key may be committed once across all wallets
    #[default]
    Global,
    /// A key may be committed once per source wallet
    PerWallet,
}

impl KeyScope {
    const GLOBAL_INDEX: &'static str = "transaction_key_uidx";
    const PER_WALLET_INDEX: &'static str = "transaction_wallet_key_uidx";

    fn index_ddl(self) -> &'static str {
        match self {
            KeyScope::Global => {
                "CREATE UNIQUE INDEX IF NOT EXISTS transaction_key_uidx ON transaction (key)"
            }
            KeyScope::PerWallet => {
                "CREATE UNIQUE INDEX IF NOT EXISTS transaction_wallet_key_uidx ON transaction (wallet, key)"
            }
        }
    }

    fn other_index(self) -> &'static str {
        match self {
            KeyScope::Global => Self::PER_WALLET_INDEX,
            KeyScope::PerWallet => Self::GLOBAL_INDEX,
        }
    }
}

impl FromStr for KeyScope {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "global" => Ok(KeyScope::Global),
            "wallet" | "per_wallet" => Ok(KeyScope::PerWallet),
            other => Err(format!("unknown key scope {other:?}")),
        }
    }
}

impl fmt::Display for KeyScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            KeyScope::Global => f.write_str("global"),
            KeyScope::PerWallet => f.write_str("wallet"),
        }
    }
}

/// Round to the storage scale the way `numeric(12, 2)` does.
pub(crate) fn to_storage_scale(amount: Decimal) -> Decimal {
    amount.round_dp_with_strategy(2, RoundingStrategy::MidpointAwayFromZero)
}

/// The ledger engine
#[derive(Clone)]
pub struct LedgerStore {
    runner: TxRunner,
    key_scope: KeyScope,
}

impl LedgerStore {
    pub fn new(
        pool: PgPool,
        policy: RetryPolicy,
        recorder: Arc<dyn Recorder>,
        key_scope: KeyScope,
    ) -> Self {
        Self {
            runner: TxRunner::new(pool, policy, recorder),
            key_scope,
        }
    }

    pub fn pool(&self) -> &PgPool {
        self.runner.pool()
    }

    /// Apply pending migrations, then the idempotency index for the configured scope.
    ///
    /// The index switch is one transaction: if the new index cannot be built
    /// (existing duplicates under the new scope) the old one stays.
    pub async fn migrate(&self) -> LedgerResult<()> {
        sqlx::migrate!("./migrations").run(self.pool()).await?;

        let mut tx = self.pool().begin().await?;
        sqlx::query(&format!(
            "DROP INDEX IF EXISTS {}",
            self.key_scope.other_index()
        ))
        .execute(&mut *tx)
        .await?;
        sqlx::query(self.key_scope.index_ddl())
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;

        info!(key_scope = %self.key_scope, "ledger schema up to date");
        Ok(())
    }
}
