use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::error::{GatewayError, Result};

/// Upper bound on a single memory's text, in characters.
pub const MAX_MEMORY_TEXT: usize = 16_384;

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct AddMemoryParams {
    #[schemars(description = "The text to remember")]
    pub text: String,

    #[schemars(description = "Optional JSON object stored alongside the memory")]
    pub metadata: Option<serde_json::Value>,
}

impl AddMemoryParams {
    pub fn validate(&self) -> Result<()> {
        if self.text.trim().is_empty() {
            return Err(GatewayError::Validation("text must not be empty".into()));
        }
        if self.text.chars().count() > MAX_MEMORY_TEXT {
            return Err(GatewayError::Validation(format!(
                "text must be at most {MAX_MEMORY_TEXT} characters"
            )));
        }
        match &self.metadata {
            None | Some(serde_json::Value::Object(_)) | Some(serde_json::Value::Null) => Ok(()),
            Some(_) => Err(GatewayError::Validation("metadata must be a JSON object".into())),
        }
    }
}
