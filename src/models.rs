use std::str::FromStr;

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use sqlx::types::chrono::{DateTime, Utc};
use utoipa::ToSchema;

use crate::error::LedgerError;

/// A wallet and its current balance
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow, ToSchema)]
pub struct Wallet {
    /// Caller-supplied wallet identifier (UUID)
    #[schema(example = "7b1e1a9e-2a3f-4d0c-9a55-1f0f5b0c6f11")]
    pub wallet: String,

    /// Client that owns the wallet
    #[schema(example = 0)]
    pub owner: i64,

    /// Current balance, never negative
    #[schema(value_type = String, example = "1000.57")]
    pub amount: Decimal,

    /// Status flag, stored but not interpreted
    pub status: i16,

    /// Last balance change
    #[schema(example = "2025-07-19T17:00:00Z")]
    pub updated: DateTime<Utc>,

    /// When the wallet was created
    #[schema(example = "2025-07-19T17:00:00Z")]
    pub created: DateTime<Utc>,
}

/// Kind of a stored ledger entry.
///
/// Transfers are recorded once, as `TransferOut` on the paying wallet; the
/// receiving side is derived at query time (see [`EntryView`]).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[repr(i16)]
#[serde(rename_all = "snake_case")]
pub enum EntryKind {
    Deposit = 0,
    Withdrawal = 1,
    TransferOut = 2,
}

impl EntryKind {
    /// Kind recorded for a signed deposit/withdraw amount; zero has none.
    pub fn for_amount(amount: Decimal) -> Option<Self> {
        if amount > Decimal::ZERO {
            Some(EntryKind::Deposit)
        } else if amount < Decimal::ZERO {
            Some(EntryKind::Withdrawal)
        } else {
            None
        }
    }
}

/// An entry as seen from the wallet a report was built for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntryView {
    Deposit,
    Withdrawal,
    TransferOut,
    TransferIn,
}

/// A committed, immutable balance-changing event
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow, ToSchema)]
pub struct LedgerEntry {
    /// Storage-assigned, monotonically increasing
    pub id: i64,

    #[sqlx(rename = "type")]
    #[serde(rename = "type")]
    #[schema(value_type = String, example = "transfer_out")]
    pub kind: EntryKind,

    /// Source wallet
    pub wallet: String,

    /// Receiving wallet, transfers only
    pub wallet_receiver: Option<String>,

    /// Idempotency key supplied by the client
    pub key: String,

    /// Signed for deposits and withdrawals, the moved amount for transfers
    #[schema(value_type = String, example = "-20.10")]
    pub amount: Decimal,

    pub ts: DateTime<Utc>,

    /// Set on report rows: what the entry means for the reported wallet
    #[sqlx(skip)]
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[schema(value_type = Option<String>, example = "transfer_in")]
    pub view: Option<EntryView>,
}

impl LedgerEntry {
    /// `None` when `wallet` is neither source nor receiver.
    pub fn view_from(&self, wallet: &str) -> Option<EntryView> {
        if self.wallet == wallet {
            Some(match self.kind {
                EntryKind::Deposit => EntryView::Deposit,
                EntryKind::Withdrawal => EntryView::Withdrawal,
                EntryKind::TransferOut => EntryView::TransferOut,
            })
        } else if self.wallet_receiver.as_deref() == Some(wallet) {
            Some(EntryView::TransferIn)
        } else {
            None
        }
    }

    /// Signed change this entry made to `wallet`'s balance.
    ///
    /// Summing this over every entry of a wallet yields its balance.
    pub fn effect_on(&self, wallet: &str) -> Decimal {
        let mut effect = Decimal::ZERO;
        if self.wallet == wallet {
            effect += match self.kind {
                EntryKind::Deposit | EntryKind::Withdrawal => self.amount,
                EntryKind::TransferOut => -self.amount,
            };
        }
        if self.kind == EntryKind::TransferOut && self.wallet_receiver.as_deref() == Some(wallet) {
            effect += self.amount;
        }
        effect
    }
}

/// Transaction-type filter for reports
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReportKind {
    Deposit,
    Withdrawal,
    TransferOut,
    TransferReceived,
    All,
}

impl ReportKind {
    /// Stored entry kind matched on the source column, if this filter has one.
    pub fn source_kind(self) -> Option<EntryKind> {
        match self {
            ReportKind::Deposit => Some(EntryKind::Deposit),
            ReportKind::Withdrawal => Some(EntryKind::Withdrawal),
            ReportKind::TransferOut => Some(EntryKind::TransferOut),
            ReportKind::TransferReceived | ReportKind::All => None,
        }
    }
}

impl FromStr for ReportKind {
    type Err = LedgerError;

    /// Accepts names or the legacy numeric codes; an empty value means `All`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "0" | "deposit" => Ok(ReportKind::Deposit),
            "1" | "withdrawal" | "withdraw" => Ok(ReportKind::Withdrawal),
            "2" | "transfer" | "transferfrom" | "transfer_out" => Ok(ReportKind::TransferOut),
            "3" | "transferto" | "transfer_received" => Ok(ReportKind::TransferReceived),
            "" | "-1" | "all" => Ok(ReportKind::All),
            _ => Err(LedgerError::InvalidTransactionType(s.to_string())),
        }
    }
}
