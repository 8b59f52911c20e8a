use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// `list_devices` takes no arguments.
#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
pub struct ListDevicesParams {}
