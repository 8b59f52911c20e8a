use axum::extract::{Query, State};
use axum::Json;
use chrono::{NaiveDate, Utc};
use serde::Deserialize;

use super::{ApiError, Caller};
use crate::db;
use crate::gateway::Gateway;
use crate::usage::{self, UsageReport};

#[derive(Debug, Default, Deserialize)]
pub struct UsageQuery {
    /// Inclusive, `YYYY-MM-DD`. Defaults to 30 days before `end_date`.
    pub start_date: Option<NaiveDate>,
    /// Inclusive, `YYYY-MM-DD`. Defaults to today (UTC).
    pub end_date: Option<NaiveDate>,
    pub user_id: Option<String>,
}

pub async fn usage(
    State(gateway): State<Gateway>,
    caller: Caller,
    Query(q): Query<UsageQuery>,
) -> Result<Json<UsageReport>, ApiError> {
    caller.check_user(q.user_id.as_deref())?;
    let account = caller.0;
    let billing = gateway.config().billing.clone();
    let report = db::run(gateway.db(), move |conn| {
        usage::usage_report(conn, &account, &billing, q.start_date, q.end_date, Utc::now())
    })
    .await?;
    Ok(Json(report))
}
