use rust_decimal::Decimal;
use sqlx::PgConnection;
use tokio_util::sync::CancellationToken;
use tracing::{info, instrument};

use super::{to_storage_scale, LedgerStore};
use crate::error::{LedgerError, LedgerResult};
use crate::models::{EntryKind, Wallet};

const GET_WALLET: &str = r#"
SELECT wallet, owner, amount, status, updated, created
FROM wallet
WHERE wallet = $1
"#;

const CREATE_WALLET: &str = r#"
INSERT INTO wallet (wallet, owner)
VALUES ($1, $2)
ON CONFLICT (wallet) DO NOTHING
"#;

const OWNER_OF_WALLET: &str = "SELECT owner FROM wallet WHERE wallet = $1";

const WALLET_EXISTS: &str = "SELECT EXISTS(SELECT 1 FROM wallet WHERE wallet = $1)";

// The guard is evaluated by the UPDATE itself, under the row lock.
const CHANGE_BALANCE_GUARDED: &str = r#"
UPDATE wallet SET amount = amount + $1, updated = now()
WHERE wallet = $2 AND amount + $1 >= 0
"#;

const CHANGE_BALANCE: &str = r#"
UPDATE wallet SET amount = amount + $1, updated = now()
WHERE wallet = $2
"#;

const INSERT_ENTRY: &str = r#"
INSERT INTO transaction (type, wallet, wallet_receiver, key, amount)
VALUES ($1, $2, $3, $4, $5)
"#;

impl LedgerStore {
    /// Create a wallet with a zero balance. Recreating one is `DuplicateWallet`.
    #[instrument(skip(self, cancel))]
    pub async fn create_wallet(
        &self,
        wallet: &str,
        owner: i64,
        cancel: &CancellationToken,
    ) -> LedgerResult<()> {
        let wallet = wallet.to_string();
        self.runner
            .run("CreateWallet", cancel, move |conn| {
                Box::pin(insert_wallet(conn, wallet.clone(), owner))
            })
            .await?;
        info!("wallet created");
        Ok(())
    }

    #[instrument(skip(self, cancel))]
    pub async fn get_wallet(&self, wallet: &str, cancel: &CancellationToken) -> LedgerResult<Wallet> {
        let wallet = wallet.to_string();
        self.runner
            .run("GetWallet", cancel, move |conn| {
                Box::pin(fetch_wallet(conn, wallet.clone()))
            })
            .await
    }

    /// `Ok(false)` when the wallet exists but belongs to someone else.
    #[instrument(skip(self, cancel))]
    pub async fn check_owner_wallet(
        &self,
        wallet: &str,
        owner: i64,
        cancel: &CancellationToken,
    ) -> LedgerResult<bool> {
        let wallet = wallet.to_string();
        let actual = self
            .runner
            .run("CheckOwnerWallet", cancel, move |conn| {
                Box::pin(fetch_owner(conn, wallet.clone()))
            })
            .await?;
        Ok(actual == owner)
    }

    /// Apply a signed amount: positive deposits, negative withdraws.
    ///
    /// The balance change and its ledger entry commit together or not at all,
    /// so a replayed `key` never changes the balance twice. An amount that is
    /// zero at storage scale is `InvalidAmount` and consumes no key.
    #[instrument(skip(self, cancel))]
    pub async fn deposit_withdraw(
        &self,
        wallet: &str,
        amount: Decimal,
        key: &str,
        cancel: &CancellationToken,
    ) -> LedgerResult<()> {
        let scaled = to_storage_scale(amount);
        let kind = EntryKind::for_amount(scaled).ok_or(LedgerError::InvalidAmount(amount))?;
        let wallet = wallet.to_string();
        let key = key.to_string();
        self.runner
            .run("DepositWithdraw", cancel, move |conn| {
                Box::pin(deposit_withdraw_tx(conn, wallet.clone(), kind, scaled, key.clone()))
            })
            .await?;
        info!("balance changed");
        Ok(())
    }

    /// Move `amount` from `from` to `to`, recording a single `TransferOut` entry.
    #[instrument(skip(self, cancel))]
    pub async fn transfer_funds(
        &self,
        from: &str,
        to: &str,
        amount: Decimal,
        key: &str,
        cancel: &CancellationToken,
    ) -> LedgerResult<()> {
        let scaled = to_storage_scale(amount);
        if scaled <= Decimal::ZERO {
            return Err(LedgerError::InvalidAmount(amount));
        }
        let amount = scaled;
        let from = from.to_string();
        let to = to.to_string();
        let key = key.to_string();
        self.runner
            .run("TransferFunds", cancel, move |conn| {
                Box::pin(transfer_tx(conn, from.clone(), to.clone(), amount, key.clone()))
            })
            .await?;
        info!("funds transferred");
        Ok(())
    }
}

async fn insert_wallet(conn: &mut PgConnection, wallet: String, owner: i64) -> LedgerResult<()> {
    let result = sqlx::query(CREATE_WALLET)
        .bind(&wallet)
        .bind(owner)
        .execute(&mut *conn)
        .await?;
    if result.rows_affected() == 0 {
        return Err(LedgerError::DuplicateWallet(wallet));
    }
    Ok(())
}

async fn fetch_wallet(conn: &mut PgConnection, wallet: String) -> LedgerResult<Wallet> {
    sqlx::query_as::<_, Wallet>(GET_WALLET)
        .bind(&wallet)
        .fetch_optional(&mut *conn)
        .await?
        .ok_or_else(|| LedgerError::WalletNotFound(wallet))
}

async fn fetch_owner(conn: &mut PgConnection, wallet: String) -> LedgerResult<i64> {
    sqlx::query_scalar::<_, i64>(OWNER_OF_WALLET)
        .bind(&wallet)
        .fetch_optional(&mut *conn)
        .await?
        .ok_or_else(|| LedgerError::WalletNotFound(wallet))
}

async fn deposit_withdraw_tx(
    conn: &mut PgConnection,
    wallet: String,
    kind: EntryKind,
    amount: Decimal,
    key: String,
) -> LedgerResult<()> {
    change_balance_guarded(conn, &wallet, amount).await?;
    insert_entry(conn, kind, &wallet, None, &key, amount).await
}

async fn transfer_tx(
    conn: &mut PgConnection,
    from: String,
    to: String,
    amount: Decimal,
    key: String,
) -> LedgerResult<()> {
    change_balance_guarded(conn, &from, -amount).await?;
    insert_entry(conn, EntryKind::TransferOut, &from, Some(&to), &key, amount).await?;
    credit(conn, &to, amount).await
}

/// Add `delta` to the balance only if the result stays non-negative.
async fn change_balance_guarded(
    conn: &mut PgConnection,
    wallet: &str,
    delta: Decimal,
) -> LedgerResult<()> {
    let result = sqlx::query(CHANGE_BALANCE_GUARDED)
        .bind(delta)
        .bind(wallet)
        .execute(&mut *conn)
        .await
        .map_err(|err| LedgerError::from_balance_update(err, wallet))?;
    if result.rows_affected() > 0 {
        return Ok(());
    }

    let exists = sqlx::query_scalar::<_, bool>(WALLET_EXISTS)
        .bind(wallet)
        .fetch_one(&mut *conn)
        .await?;
    if exists {
        Err(LedgerError::InsufficientFunds)
    } else {
        Err(LedgerError::WalletNotFound(wallet.to_string()))
    }
}

/// Unconditional credit; fails only for a missing wallet or an overflowing balance.
async fn credit(conn: &mut PgConnection, wallet: &str, amount: Decimal) -> LedgerResult<()> {
    let result = sqlx::query(CHANGE_BALANCE)
        .bind(amount)
        .bind(wallet)
        .execute(&mut *conn)
        .await
        .map_err(|err| LedgerError::from_balance_update(err, wallet))?;
    if result.rows_affected() == 0 {
        return Err(LedgerError::WalletNotFound(wallet.to_string()));
    }
    Ok(())
}

async fn insert_entry(
    conn: &mut PgConnection,
    kind: EntryKind,
    wallet: &str,
    receiver: Option<&str>,
    key: &str,
    amount: Decimal,
) -> LedgerResult<()> {
    sqlx::query(INSERT_ENTRY)
        .bind(kind)
        .bind(wallet)
        .bind(receiver)
        .bind(key)
        .bind(amount)
        .execute(&mut *conn)
        .await
        .map_err(|err| LedgerError::from_entry_insert(err, key))?;
    Ok(())
}
