use sqlx::types::chrono::{DateTime, Utc};
use sqlx::{PgConnection, Postgres, QueryBuilder};
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument};

use super::LedgerStore;
use crate::error::LedgerResult;
use crate::models::{LedgerEntry, ReportKind};

const SELECT_ENTRIES: &str = r#"
SELECT id, type, wallet, wallet_receiver, key, amount, ts
FROM transaction
WHERE "#;

impl LedgerStore {
    /// Ledger entries of `wallet` matching `kind`, optionally bounded to
    /// `[from, to]` (both inclusive), oldest first.
    ///
    /// `TransferReceived` selects on the receiving wallet; `All` selects
    /// entries where the wallet is either side. Every row carries its view
    /// from `wallet`, so incoming transfers read as `TransferIn`.
    #[instrument(skip(self, cancel))]
    pub async fn report(
        &self,
        wallet: &str,
        from: Option<DateTime<Utc>>,
        to: Option<DateTime<Utc>>,
        kind: ReportKind,
        cancel: &CancellationToken,
    ) -> LedgerResult<Vec<LedgerEntry>> {
        let owned = wallet.to_string();
        let mut entries = self
            .runner
            .run("Report", cancel, move |conn| {
                Box::pin(select_entries(conn, owned.clone(), from, to, kind))
            })
            .await?;
        for entry in &mut entries {
            entry.view = entry.view_from(wallet);
        }
        debug!(count = entries.len(), "report built");
        Ok(entries)
    }
}

async fn select_entries(
    conn: &mut PgConnection,
    wallet: String,
    from: Option<DateTime<Utc>>,
    to: Option<DateTime<Utc>>,
    kind: ReportKind,
) -> LedgerResult<Vec<LedgerEntry>> {
    let mut query: QueryBuilder<'_, Postgres> = QueryBuilder::new(SELECT_ENTRIES);

    if let Some(stored) = kind.source_kind() {
        query.push("wallet = ");
        query.push_bind(wallet.as_str());
        query.push(" AND type = ");
        query.push_bind(stored);
    } else if kind == ReportKind::TransferReceived {
        query.push("wallet_receiver = ");
        query.push_bind(wallet.as_str());
    } else {
        query.push("(wallet = ");
        query.push_bind(wallet.as_str());
        query.push(" OR wallet_receiver = ");
        query.push_bind(wallet.as_str());
        query.push(")");
    }

    if let Some(from) = from {
        query.push(" AND ts >= ");
        query.push_bind(from);
    }
    if let Some(to) = to {
        query.push(" AND ts <= ");
        query.push_bind(to);
    }

    query.push(" ORDER BY ts, id");

    let entries = query
        .build_query_as::<LedgerEntry>()
        .fetch_all(&mut *conn)
        .await?;
    Ok(entries)
}
