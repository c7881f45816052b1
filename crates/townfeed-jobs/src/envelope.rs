//! Invocation envelope: timing, START/END/FAIL logging and the success/failure body.

use std::future::Future;
use std::time::Instant;

use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use tracing::{error, info, info_span, Instrument};
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InvocationBody {
    pub success: bool,
    pub function: String,
    pub elapsed_seconds: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<JsonValue>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InvocationResponse {
    pub status_code: u16,
    pub body: InvocationBody,
}

impl InvocationResponse {
    pub fn is_success(&self) -> bool {
        self.body.success
    }
}

/// Run `job` and map its outcome to a response. Errors never escape.
pub async fn invoke<F>(function: &str, job: F) -> InvocationResponse
where
    F: Future<Output = anyhow::Result<JsonValue>>,
{
    let run_id = Uuid::new_v4();
    let span = info_span!("invocation", function, %run_id);
    async {
        let started = Instant::now();
        info!("START {function}");
        let outcome = job.await;
        let elapsed = started.elapsed().as_secs_f64();
        let elapsed_seconds = townfeed_core::coerce::round1(elapsed);

        match outcome {
            Ok(result) => {
                info!("END {function} ({elapsed:.1}s)");
                InvocationResponse {
                    status_code: 200,
                    body: InvocationBody {
                        success: true,
                        function: function.to_string(),
                        elapsed_seconds,
                        result: Some(result),
                        error: None,
                    },
                }
            }
            Err(err) => {
                let message = format!("{err:#}");
                error!(error = ?err, "FAIL {function} ({elapsed:.1}s): {message}");
                InvocationResponse {
                    status_code: 500,
                    body: InvocationBody {
                        success: false,
                        function: function.to_string(),
                        elapsed_seconds,
                        result: None,
                        error: Some(message),
                    },
                }
            }
        }
    }
    .instrument(span)
    .await
}
