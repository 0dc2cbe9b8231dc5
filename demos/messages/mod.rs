use serde::{Deserialize, Serialize};
use std::{path::PathBuf, time::Duration};

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct PredictRequest {
    pub image_path: PathBuf,
    pub task: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub question: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct PredictResponse {
    pub id: u64,
    pub task: String,
    pub question: Option<String>,
    pub start_time: u128,
    pub duration: Duration,
    pub output: Option<String>,
    pub error: Option<String>,
}
