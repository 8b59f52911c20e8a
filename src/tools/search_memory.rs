use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::error::{GatewayError, Result};

pub const DEFAULT_SEARCH_LIMIT: usize = 5;
pub const MAX_SEARCH_LIMIT: usize = 100;

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct SearchMemoryParams {
    #[schemars(description = "Natural language query")]
    pub query: String,

    /// Maximum number of results (1–100). Defaults to 5.
    #[schemars(description = "Maximum number of results to return (1-100). Defaults to 5.")]
    pub limit: Option<usize>,
}

impl SearchMemoryParams {
    pub fn validate(&self) -> Result<()> {
        if self.query.trim().is_empty() {
            return Err(GatewayError::Validation("query must not be empty".into()));
        }
        if !(1..=MAX_SEARCH_LIMIT).contains(&self.effective_limit()) {
            return Err(GatewayError::Validation(format!(
                "limit must be between 1 and {MAX_SEARCH_LIMIT}"
            )));
        }
        Ok(())
    }

    pub fn effective_limit(&self) -> usize {
        self.limit.unwrap_or(DEFAULT_SEARCH_LIMIT)
    }
}
