// Best-effort completion notification

use arbiter_common::types::JobResult;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{info, warn};

const CALLBACK_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Clone)]
pub struct CallbackNotifier {
    client: reqwest::Client,
}

impl CallbackNotifier {
    pub fn new() -> Self {
        let client = reqwest::Client::builder()
            .timeout(CALLBACK_TIMEOUT)
            .build()
            .unwrap_or_else(|e| {
                warn!(error = %e, "Failed to build callback client, using defaults");
                reqwest::Client::new()
            });
        CallbackNotifier { client }
    }

    /// POST `result` to `url` on a detached task.
    ///
    /// Delivery is never retried and never affects the job record.
    pub fn notify(&self, url: String, result: JobResult) -> JoinHandle<()> {
        let client = self.client.clone();

        tokio::spawn(async move {
            let response = client
                .post(&url)
                .json(&result)
                .send()
                .await
                .and_then(|resp| resp.error_for_status());

            match response {
                Ok(resp) => info!(
                    job_id = %result.id,
                    url = %url,
                    status = resp.status().as_u16(),
                    "Callback delivered"
                ),
                Err(e) => warn!(job_id = %result.id, url = %url, error = %e, "Callback failed"),
            }
        })
    }
}

impl Default for CallbackNotifier {
    fn default() -> Self {
        Self::new()
    }
}
