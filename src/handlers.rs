use std::str::FromStr;
use std::sync::Arc;

use axum::{
    async_trait,
    extract::{FromRequestParts, Query, State},
    http::{header, request::Parts},
    response::IntoResponse,
    Json,
};
use chrono::{DateTime, NaiveDate, NaiveTime, TimeZone, Utc};
use prometheus::{Encoder, Registry, TextEncoder};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use utoipa::ToSchema;
use uuid::Uuid;

use crate::error::{validation_error, AppError};
use crate::limits::{RequestDeadline, RequestLimits};
use crate::models::{LedgerEntry, ReportKind, Wallet};
use crate::store::LedgerStore;

/// Date format of report bounds
pub const DATE_FMT: &str = "%Y-%m-%d";

/// Header carrying the calling client's id
pub const CLIENT_ID_HEADER: &str = "x-client-id";

/// Shared state of the HTTP layer
#[derive(Clone)]
pub struct AppState {
    pub store: Arc<LedgerStore>,
    pub registry: Registry,
    /// Cancelled once shutdown has drained; every request works under a child token
    pub shutdown: CancellationToken,
    pub limits: RequestLimits,
    pub version: String,
}

impl AppState {
    fn deadline(&self) -> RequestDeadline {
        RequestDeadline::new(&self.shutdown, self.limits.timeout)
    }
}

/// Calling client, from the `x-client-id` header (0 when absent)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Client(pub i64);

#[async_trait]
impl<S> FromRequestParts<S> for Client
where
    S: Send + Sync,
{
    type Rejection = AppError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        match parts.headers.get(CLIENT_ID_HEADER) {
            None => Ok(Client(0)),
            Some(value) => value
                .to_str()
                .ok()
                .and_then(|v| v.trim().parse().ok())
                .map(Client)
                .ok_or_else(|| validation_error("invalid client id")),
        }
    }
}

/// Acknowledgement body of mutating endpoints
#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct Ack {
    #[schema(example = "ok")]
    pub status: String,
}

impl Ack {
    fn ok() -> Json<Self> {
        Json(Self {
            status: "ok".to_string(),
        })
    }
}

#[derive(Debug, Deserialize)]
pub struct WalletParams {
    pub wallet: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct AmountParams {
    pub wallet: Option<String>,
    pub amount: Option<String>,
    pub key: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct TransferParams {
    pub from: Option<String>,
    pub to: Option<String>,
    pub amount: Option<String>,
    pub key: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct ReportParams {
    pub wallet: Option<String>,
    pub from: Option<String>,
    pub to: Option<String>,
    #[serde(rename = "type")]
    pub kind: Option<String>,
}

/// Liveness check
pub async fn ping() -> &'static str {
    "pong"
}

pub async fn version(State(state): State<AppState>) -> String {
    state.version.clone()
}

/// Prometheus text exposition of the store metrics
pub async fn metrics(State(state): State<AppState>) -> Result<impl IntoResponse, AppError> {
    let encoder = TextEncoder::new();
    let mut buffer = Vec::new();
    encoder
        .encode(&state.registry.gather(), &mut buffer)
        .map_err(|e| AppError::InternalServerError(e.to_string()))?;
    Ok((
        [(header::CONTENT_TYPE, encoder.format_type().to_string())],
        buffer,
    ))
}

/// Create a new wallet
///
/// The wallet belongs to the calling client and starts with a zero balance.
#[utoipa::path(
    get,
    path = "/v1/createWallet",
    params(("wallet" = String, Query, description = "Wallet id (UUID)")),
    responses(
        (status = 200, description = "Wallet created", body = Ack),
        (status = 400, description = "Invalid input"),
        (status = 409, description = "Wallet already exists"),
        (status = 429, description = "Rate limit exceeded"),
        (status = 500, description = "Internal server error"),
        (status = 503, description = "Deadline passed or server shutting down")
    )
)]
pub async fn create_wallet(
    State(state): State<AppState>,
    client: Client,
    Query(params): Query<WalletParams>,
) -> Result<Json<Ack>, AppError> {
    let wallet = parse_wallet(params.wallet.as_deref(), "wallet")?;
    let deadline = state.deadline();
    let cancel = deadline.token();

    state.store.create_wallet(&wallet, client.0, cancel).await?;

    info!(%wallet, owner = client.0, "created wallet");
    Ok(Ack::ok())
}

/// Get a wallet and its balance
#[utoipa::path(
    get,
    path = "/v1/getWallet",
    params(("wallet" = String, Query, description = "Wallet id (UUID)")),
    responses(
        (status = 200, description = "Wallet found", body = Wallet),
        (status = 403, description = "Wallet belongs to another client"),
        (status = 404, description = "Wallet not found"),
        (status = 429, description = "Rate limit exceeded"),
        (status = 500, description = "Internal server error"),
        (status = 503, description = "Deadline passed or server shutting down")
    )
)]
pub async fn get_wallet(
    State(state): State<AppState>,
    client: Client,
    Query(params): Query<WalletParams>,
) -> Result<Json<Wallet>, AppError> {
    let wallet = parse_wallet(params.wallet.as_deref(), "wallet")?;
    let deadline = state.deadline();
    let cancel = deadline.token();

    let found = state.store.get_wallet(&wallet, cancel).await?;
    if found.owner != client.0 {
        warn!(%wallet, client = client.0, "wallet read by non-owner");
        return Err(AppError::Forbidden(format!("wallet {wallet}")));
    }
    Ok(Json(found))
}

/// Deposit to a wallet
///
/// Any client may deposit to an existing wallet.
#[utoipa::path(
    get,
    path = "/v1/deposit",
    params(
        ("wallet" = String, Query, description = "Wallet id (UUID)"),
        ("amount" = String, Query, description = "Positive amount, at most two decimals"),
        ("key" = String, Query, description = "Idempotency key")
    ),
    responses(
        (status = 200, description = "Deposited", body = Ack),
        (status = 400, description = "Invalid input"),
        (status = 404, description = "Wallet not found"),
        (status = 409, description = "Key already used"),
        (status = 422, description = "Balance limit exceeded"),
        (status = 429, description = "Rate limit exceeded"),
        (status = 500, description = "Internal server error"),
        (status = 503, description = "Deadline passed or server shutting down")
    )
)]
pub async fn deposit(
    State(state): State<AppState>,
    Query(params): Query<AmountParams>,
) -> Result<Json<Ack>, AppError> {
    let wallet = parse_wallet(params.wallet.as_deref(), "wallet")?;
    let amount = parse_amount(params.amount.as_deref())?;
    let key = parse_key(params.key.as_deref())?;
    let deadline = state.deadline();
    let cancel = deadline.token();

    state
        .store
        .deposit_withdraw(&wallet, amount, &key, cancel)
        .await?;
    Ok(Ack::ok())
}

/// Withdraw from an owned wallet
#[utoipa::path(
    get,
    path = "/v1/withdraw",
    params(
        ("wallet" = String, Query, description = "Wallet id (UUID)"),
        ("amount" = String, Query, description = "Positive amount, at most two decimals"),
        ("key" = String, Query, description = "Idempotency key")
    ),
    responses(
        (status = 200, description = "Withdrawn", body = Ack),
        (status = 400, description = "Invalid input"),
        (status = 403, description = "Wallet belongs to another client"),
        (status = 404, description = "Wallet not found"),
        (status = 409, description = "Key already used"),
        (status = 422, description = "Insufficient funds or balance limit exceeded"),
        (status = 429, description = "Rate limit exceeded"),
        (status = 500, description = "Internal server error"),
        (status = 503, description = "Deadline passed or server shutting down")
    )
)]
pub async fn withdraw(
    State(state): State<AppState>,
    client: Client,
    Query(params): Query<AmountParams>,
) -> Result<Json<Ack>, AppError> {
    let wallet = parse_wallet(params.wallet.as_deref(), "wallet")?;
    let amount = parse_amount(params.amount.as_deref())?;
    let key = parse_key(params.key.as_deref())?;
    let deadline = state.deadline();
    let cancel = deadline.token();

    ensure_owner(&state, &wallet, client, cancel).await?;
    state
        .store
        .deposit_withdraw(&wallet, -amount, &key, cancel)
        .await?;
    Ok(Ack::ok())
}

/// Transfer funds between wallets
#[utoipa::path(
    get,
    path = "/v1/transferFunds",
    params(
        ("from" = String, Query, description = "Paying wallet id, owned by the caller"),
        ("to" = String, Query, description = "Receiving wallet id"),
        ("amount" = String, Query, description = "Positive amount, at most two decimals"),
        ("key" = String, Query, description = "Idempotency key")
    ),
    responses(
        (status = 200, description = "Transferred", body = Ack),
        (status = 400, description = "Invalid input"),
        (status = 403, description = "Paying wallet belongs to another client"),
        (status = 404, description = "Wallet not found"),
        (status = 409, description = "Key already used"),
        (status = 422, description = "Insufficient funds or balance limit exceeded"),
        (status = 429, description = "Rate limit exceeded"),
        (status = 500, description = "Internal server error"),
        (status = 503, description = "Deadline passed or server shutting down")
    )
)]
pub async fn transfer_funds(
    State(state): State<AppState>,
    client: Client,
    Query(params): Query<TransferParams>,
) -> Result<Json<Ack>, AppError> {
    let from = parse_wallet(params.from.as_deref(), "from")?;
    let to = parse_wallet(params.to.as_deref(), "to")?;
    if from == to {
        return Err(validation_error("cannot transfer to the same wallet"));
    }
    let amount = parse_amount(params.amount.as_deref())?;
    let key = parse_key(params.key.as_deref())?;
    let deadline = state.deadline();
    let cancel = deadline.token();

    ensure_owner(&state, &from, client, cancel).await?;
    state
        .store
        .transfer_funds(&from, &to, amount, &key, cancel)
        .await?;
    Ok(Ack::ok())
}

/// Ledger entries of an owned wallet
#[utoipa::path(
    get,
    path = "/v1/report",
    params(
        ("wallet" = String, Query, description = "Wallet id (UUID)"),
        ("from" = Option<String>, Query, description = "First day included, YYYY-MM-DD"),
        ("to" = Option<String>, Query, description = "Last day included, YYYY-MM-DD"),
        ("type" = Option<String>, Query, description = "deposit, withdrawal, transfer, transferto or all (default)")
    ),
    responses(
        (status = 200, description = "Matching entries, oldest first", body = [LedgerEntry]),
        (status = 400, description = "Invalid input"),
        (status = 403, description = "Wallet belongs to another client"),
        (status = 404, description = "Wallet not found"),
        (status = 429, description = "Rate limit exceeded"),
        (status = 500, description = "Internal server error"),
        (status = 503, description = "Deadline passed or server shutting down")
    )
)]
pub async fn report(
    State(state): State<AppState>,
    client: Client,
    Query(params): Query<ReportParams>,
) -> Result<Json<Vec<LedgerEntry>>, AppError> {
    let wallet = parse_wallet(params.wallet.as_deref(), "wallet")?;
    let from = parse_day(params.from.as_deref(), "from", start_of_day())?;
    let to = parse_day(params.to.as_deref(), "to", end_of_day())?;
    if let (Some(from), Some(to)) = (from, to) {
        if from > to {
            return Err(validation_error("from must not be after to"));
        }
    }
    let kind = ReportKind::from_str(params.kind.as_deref().unwrap_or(""))?;
    let deadline = state.deadline();
    let cancel = deadline.token();

    ensure_owner(&state, &wallet, client, cancel).await?;
    let entries = state
        .store
        .report(&wallet, from, to, kind, cancel)
        .await?;
    Ok(Json(entries))
}

async fn ensure_owner(
    state: &AppState,
    wallet: &str,
    client: Client,
    cancel: &CancellationToken,
) -> Result<(), AppError> {
    if state.store.check_owner_wallet(wallet, client.0, cancel).await? {
        return Ok(());
    }
    warn!(%wallet, client = client.0, "wallet used by non-owner");
    Err(AppError::Forbidden(format!("wallet {wallet}")))
}

fn parse_wallet(value: Option<&str>, name: &str) -> Result<String, AppError> {
    let value = value
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .ok_or_else(|| validation_error(&format!("{name} not specified in the query")))?;
    let id = Uuid::parse_str(value)
        .map_err(|_| validation_error(&format!("{name}: invalid uuid format")))?;
    Ok(id.hyphenated().to_string())
}

fn parse_amount(value: Option<&str>) -> Result<Decimal, AppError> {
    let value = value
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .ok_or_else(|| validation_error("amount not specified in the query"))?;
    let amount = Decimal::from_str(value).map_err(|_| validation_error("invalid amount"))?;
    if amount <= Decimal::ZERO {
        return Err(validation_error("amount must be positive"));
    }
    if amount.normalize().scale() > 2 {
        return Err(validation_error("amount must have at most two decimal places"));
    }
    if amount > max_amount() {
        return Err(validation_error("amount is too large"));
    }
    Ok(amount)
}

fn parse_key(value: Option<&str>) -> Result<String, AppError> {
    value
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_string)
        .ok_or_else(|| validation_error("transaction key not specified"))
}

/// Largest amount that fits `numeric(12, 2)`
fn max_amount() -> Decimal {
    Decimal::new(999_999_999_999, 2)
}

fn start_of_day() -> NaiveTime {
    NaiveTime::default()
}

fn end_of_day() -> NaiveTime {
    NaiveTime::from_hms_micro_opt(23, 59, 59, 999_999).unwrap_or_default()
}

fn parse_day(
    value: Option<&str>,
    name: &str,
    time: NaiveTime,
) -> Result<Option<DateTime<Utc>>, AppError> {
    let Some(value) = value.map(str::trim).filter(|v| !v.is_empty()) else {
        return Ok(None);
    };
    let day = NaiveDate::parse_from_str(value, DATE_FMT)
        .map_err(|_| validation_error(&format!("{name}: expected date as YYYY-MM-DD")))?;
    Ok(Some(Utc.from_utc_datetime(&day.and_time(time))))
}
