use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use rust_decimal::Decimal;
use serde::Serialize;
use thiserror::Error;
use tracing::{error, instrument};

/// SQLSTATE `numeric_value_out_of_range`
const NUMERIC_OUT_OF_RANGE: &str = "22003";
/// SQLSTATE `check_violation`
const CHECK_VIOLATION: &str = "23514";

/// Failures of ledger operations.
///
/// Everything except [`LedgerError::Storage`] fails fast: the transaction is
/// rolled back and the error returned without another attempt.
#[derive(Debug, Error)]
pub enum LedgerError {
    /// The conditional debit matched no row: the balance would go negative
    #[error("insufficient funds")]
    InsufficientFunds,

    /// The new balance does not fit the stored precision
    #[error("balance limit exceeded for wallet {0}")]
    BalanceLimit(String),

    /// Amount is zero at storage scale, or negative where only positive is allowed
    #[error("invalid amount {0}")]
    InvalidAmount(Decimal),

    #[error("wallet {0} not found")]
    WalletNotFound(String),

    #[error("wallet {0} already exists")]
    DuplicateWallet(String),

    /// The idempotency key was already committed
    #[error("duplicate action: key {0} already used")]
    DuplicateKey(String),

    #[error("invalid transaction type: {0:?}")]
    InvalidTransactionType(String),

    /// The caller cancelled or the deadline passed before commit; nothing was persisted
    #[error("operation cancelled")]
    Cancelled,

    /// Connectivity, contention or any unclassified database failure
    #[error("storage error: {0}")]
    Storage(#[from] sqlx::Error),

    #[error("migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),
}

pub type LedgerResult<T> = Result<T, LedgerError>;

impl LedgerError {
    /// Business errors and cancellation are never retried.
    pub fn is_fail_fast(&self) -> bool {
        !matches!(self, Self::Storage(_) | Self::Migration(_))
    }

    /// Convert a failed ledger insert, mapping unique violations to `DuplicateKey`.
    pub(crate) fn from_entry_insert(err: sqlx::Error, key: &str) -> Self {
        match &err {
            sqlx::Error::Database(db_err) if db_err.is_unique_violation() => {
                Self::DuplicateKey(key.to_string())
            }
            _ => Self::Storage(err),
        }
    }

    /// Convert a failed balance update. Overflowing `numeric(12, 2)` or the
    /// non-negative check fails the same way on every attempt.
    pub(crate) fn from_balance_update(err: sqlx::Error, wallet: &str) -> Self {
        let code = match &err {
            sqlx::Error::Database(db_err) => db_err.code(),
            _ => None,
        };
        match code.as_deref() {
            Some(NUMERIC_OUT_OF_RANGE) | Some(CHECK_VIOLATION) => {
                Self::BalanceLimit(wallet.to_string())
            }
            _ => Self::Storage(err),
        }
    }
}

/// HTTP-facing error, rendered as `{error, code}`
#[derive(Debug, Error)]
pub enum AppError {
    #[error("Bad request: {0}")]
    BadRequest(String),

    /// Wallet belongs to another client
    #[error("Forbidden: {0}")]
    Forbidden(String),

    #[error("Not found: {0}")]
    NotFound(String),

    /// Duplicate wallet or replayed key
    #[error("Conflict: {0}")]
    Conflict(String),

    /// Insufficient funds or balance limit
    #[error("Unprocessable entity: {0}")]
    UnprocessableEntity(String),

    #[error("Too many requests")]
    TooManyRequests,

    #[error("Internal server error: {0}")]
    InternalServerError(String),

    /// Cancelled by shutdown or request deadline
    #[error("Service unavailable: {0}")]
    ServiceUnavailable(String),
}

#[derive(Serialize)]
pub struct ErrorResponse {
    pub error: String,
    pub code: &'static str,
}

impl AppError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::BadRequest(_) => StatusCode::BAD_REQUEST,
            Self::Forbidden(_) => StatusCode::FORBIDDEN,
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::Conflict(_) => StatusCode::CONFLICT,
            Self::UnprocessableEntity(_) => StatusCode::UNPROCESSABLE_ENTITY,
            Self::TooManyRequests => StatusCode::TOO_MANY_REQUESTS,
            Self::InternalServerError(_) => StatusCode::INTERNAL_SERVER_ERROR,
            Self::ServiceUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
        }
    }

    pub fn code(&self) -> &'static str {
        match self {
            Self::BadRequest(_) => "bad_request",
            Self::Forbidden(_) => "forbidden",
            Self::NotFound(_) => "not_found",
            Self::Conflict(_) => "conflict",
            Self::UnprocessableEntity(_) => "unprocessable_entity",
            Self::TooManyRequests => "too_many_requests",
            Self::InternalServerError(_) => "internal_server_error",
            Self::ServiceUnavailable(_) => "service_unavailable",
        }
    }
}

impl IntoResponse for AppError {
    #[instrument]
    fn into_response(self) -> Response {
        let status = self.status_code();
        let code = self.code();

        // storage details stay in the log
        let message = match &self {
            Self::InternalServerError(detail) => {
                error!(error = %detail, error_code = code, "request failed with server error");
                "internal server error".to_string()
            }
            _ => self.to_string(),
        };

        (status, Json(ErrorResponse { error: message, code })).into_response()
    }
}

impl From<LedgerError> for AppError {
    fn from(err: LedgerError) -> Self {
        let message = err.to_string();
        match err {
            LedgerError::DuplicateWallet(_) | LedgerError::DuplicateKey(_) => Self::Conflict(message),
            LedgerError::InsufficientFunds | LedgerError::BalanceLimit(_) => {
                Self::UnprocessableEntity(message)
            }
            LedgerError::WalletNotFound(_) => Self::NotFound(message),
            LedgerError::InvalidTransactionType(_) | LedgerError::InvalidAmount(_) => {
                Self::BadRequest(message)
            }
            LedgerError::Cancelled => Self::ServiceUnavailable(message),
            LedgerError::Storage(_) | LedgerError::Migration(_) => Self::InternalServerError(message),
        }
    }
}

pub fn validation_error(message: &str) -> AppError {
    AppError::BadRequest(message.to_string())
}
