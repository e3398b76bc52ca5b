use crate::{
    auth::AuthUser,
    entities::coin_transaction,
    errors::ServiceError,
    services::coins::CoinBalance,
    ApiResponse, AppState,
};
use axum::{
    extract::{Query, State},
    routing::get,
    Json, Router,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use utoipa::{IntoParams, ToSchema};
use uuid::Uuid;

const MAX_HISTORY: u64 = 100;

pub fn coin_routes() -> Router<AppState> {
    Router::new().route("/", get(get_coins))
}

#[derive(Debug, Deserialize, IntoParams)]
#[into_params(parameter_in = Query)]
pub struct CoinHistoryQuery {
    /// Number of ledger entries to return (default 20, max 100)
    #[serde(default = "default_limit")]
    pub limit: u64,
}

fn default_limit() -> u64 {
    20
}

#[derive(Debug, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct CoinTransactionView {
    pub id: Uuid,
    #[serde(rename = "type")]
    pub transaction_type: String,
    pub amount: i64,
    pub source: String,
    pub description: String,
    pub reference_id: Option<Uuid>,
    pub reference_model: Option<String>,
    pub balance_after: i64,
    pub created_at: DateTime<Utc>,
}

impl From<coin_transaction::Model> for CoinTransactionView {
    fn from(model: coin_transaction::Model) -> Self {
        Self {
            id: model.id,
            transaction_type: model.transaction_type.to_string(),
            amount: model.amount,
            source: model.source,
            description: model.description,
            reference_id: model.reference_id,
            reference_model: model.reference_model,
            balance_after: model.balance_after,
            created_at: model.created_at,
        }
    }
}

#[derive(Debug, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct CoinSummary {
    #[serde(flatten)]
    pub balance: CoinBalance,
    pub transactions: Vec<CoinTransactionView>,
}

/// Coin balance, lifetime totals and recent ledger entries
#[utoipa::path(
    get,
    path = "/api/v1/coins",
    summary = "Get my coins",
    params(CoinHistoryQuery),
    responses(
        (status = 200, description = "Balance and history", body = ApiResponse<CoinSummary>),
        (status = 401, description = "Unauthorized", body = crate::errors::ErrorResponse),
        (status = 404, description = "User not found", body = crate::errors::ErrorResponse),
    ),
    security(("bearer_auth" = [])),
    tag = "Coins"
)]
pub async fn get_coins(
    State(state): State<AppState>,
    auth_user: AuthUser,
    Query(query): Query<CoinHistoryQuery>,
) -> Result<Json<ApiResponse<CoinSummary>>, ServiceError> {
    let coins = &state.services.coins;
    let balance = coins.balance(auth_user.user_id).await?;
    let transactions = coins
        .history(auth_user.user_id, query.limit.clamp(1, MAX_HISTORY))
        .await?
        .into_iter()
        .map(CoinTransactionView::from)
        .collect();

    Ok(Json(ApiResponse::success(CoinSummary {
        balance,
        transactions,
    })))
}
