use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;

use tokio::sync::Mutex;

use super::client::{
    BoxFuture, DeliveryClient, DeliveryError, DeliveryReceipt, DeliveryRequest, DeliveryResult,
    FailureCategory, TutorReply, current_unix_millis,
};

pub const SCRIPTED_PROVIDER_ID: &str = "scripted";

/// One queued answer for [`ScriptedDeliveryClient`].
#[derive(Debug, Clone, PartialEq)]
pub enum ScriptedOutcome {
    Confirm,
    ConfirmWithReply(TutorReply),
    Fail {
        category: FailureCategory,
        message: String,
    },
}

impl ScriptedOutcome {
    pub fn network_failure(message: impl Into<String>) -> Self {
        Self::Fail {
            category: FailureCategory::Network,
            message: message.into(),
        }
    }

    pub fn failure(category: FailureCategory, message: impl Into<String>) -> Self {
        Self::Fail {
            category,
            message: message.into(),
        }
    }
}

/// In-memory client that answers from a script.
///
/// Once the script runs dry every send is confirmed. Requests are recorded in call order.
pub struct ScriptedDeliveryClient {
    script: Mutex<VecDeque<ScriptedOutcome>>,
    requests: Mutex<Vec<DeliveryRequest>>,
    calls: AtomicUsize,
    next_confirmation: AtomicU64,
    latency: Duration,
    echo_replies: bool,
}

impl Default for ScriptedDeliveryClient {
    fn default() -> Self {
        Self::new(Vec::new())
    }
}

impl ScriptedDeliveryClient {
    pub fn new(script: impl IntoIterator<Item = ScriptedOutcome>) -> Self {
        Self {
            script: Mutex::new(script.into_iter().collect()),
            requests: Mutex::new(Vec::new()),
            calls: AtomicUsize::new(0),
            next_confirmation: AtomicU64::new(1),
            latency: Duration::ZERO,
            echo_replies: false,
        }
    }

    /// Offline stand-in for the tutor: confirms everything and echoes it back.
    pub fn echo() -> Self {
        Self::new(Vec::new()).with_echo_replies()
    }

    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    pub fn with_echo_replies(mut self) -> Self {
        self.echo_replies = true;
        self
    }

    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub async fn requests(&self) -> Vec<DeliveryRequest> {
        self.requests.lock().await.clone()
    }

    fn receipt(&self, request: &DeliveryRequest, reply: Option<TutorReply>) -> DeliveryReceipt {
        let sequence = self.next_confirmation.fetch_add(1, Ordering::SeqCst);
        DeliveryReceipt {
            confirmed_id: format!("{SCRIPTED_PROVIDER_ID}-{sequence}"),
            content: request.content.clone(),
            timestamp_unix_ms: current_unix_millis(),
            reply,
        }
    }
}

impl DeliveryClient for ScriptedDeliveryClient {
    fn id(&self) -> &str {
        SCRIPTED_PROVIDER_ID
    }

    fn send<'a>(
        &'a self,
        request: DeliveryRequest,
    ) -> BoxFuture<'a, DeliveryResult<DeliveryReceipt>> {
        Box::pin(async move {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.requests.lock().await.push(request.clone());
            let outcome = self
                .script
                .lock()
                .await
                .pop_front()
                .unwrap_or(ScriptedOutcome::Confirm);

            if !self.latency.is_zero() {
                tokio::time::sleep(self.latency).await;
            }

            tracing::debug!(tab = %request.tab_id, outcome = ?outcome, "scripted delivery");

            match outcome {
                ScriptedOutcome::Confirm => {
                    let reply = self
                        .echo_replies
                        .then(|| TutorReply::text(format!("(offline) received: {}", request.content)));
                    Ok(self.receipt(&request, reply))
                }
                ScriptedOutcome::ConfirmWithReply(reply) => Ok(self.receipt(&request, Some(reply))),
                ScriptedOutcome::Fail { category, message } => {
                    Err(DeliveryError::rejected(category, message))
                }
            }
        })
    }
}
