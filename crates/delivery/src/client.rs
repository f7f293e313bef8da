use std::future::Future;
use std::pin::Pin;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use snafu::Snafu;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientConfig {
    pub provider_id: String,
    pub api_key: String,
    pub endpoint: String,
    pub model: String,
    pub preamble: Option<String>,
}

impl ClientConfig {
    pub fn new(
        provider_id: impl Into<String>,
        api_key: impl Into<String>,
        endpoint: impl Into<String>,
        model: impl Into<String>,
    ) -> Self {
        Self {
            provider_id: provider_id.into().trim().to_string(),
            api_key: api_key.into().trim().to_string(),
            endpoint: endpoint.into().trim().to_string(),
            model: model.into().trim().to_string(),
            preamble: None,
        }
    }

    pub fn with_preamble(mut self, preamble: impl Into<String>) -> Self {
        let preamble = preamble.into();
        self.preamble = if preamble.trim().is_empty() {
            None
        } else {
            Some(preamble)
        };
        self
    }
}

/// One outbound chat message as the backing service sees it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeliveryRequest {
    pub tab_id: String,
    pub content: String,
}

impl DeliveryRequest {
    pub fn new(tab_id: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            tab_id: tab_id.into(),
            content: content.into(),
        }
    }
}

/// Interactive content attached to a message.
///
/// `kind` is the only field the chat core looks at; `payload` is handed to the
/// render surface untouched.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EmbeddedPayload {
    pub kind: String,
    pub payload: serde_json::Value,
}

impl EmbeddedPayload {
    pub fn new(kind: impl Into<String>, payload: serde_json::Value) -> Self {
        Self {
            kind: kind.into(),
            payload,
        }
    }
}

/// Tutor response produced alongside a confirmation.
#[derive(Debug, Clone, PartialEq)]
pub struct TutorReply {
    pub content: String,
    pub embedded: Option<EmbeddedPayload>,
}

impl TutorReply {
    pub fn text(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            embedded: None,
        }
    }

    pub fn with_embedded(mut self, embedded: EmbeddedPayload) -> Self {
        self.embedded = Some(embedded);
        self
    }
}

/// Successful delivery outcome.
#[derive(Debug, Clone, PartialEq)]
pub struct DeliveryReceipt {
    pub confirmed_id: String,
    pub content: String,
    pub timestamp_unix_ms: u64,
    pub reply: Option<TutorReply>,
}

/// Informal failure category reported by a client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FailureCategory {
    Network,
    Validation,
    Other,
}

pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;
pub type DeliveryResult<T> = Result<T, DeliveryError>;

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum DeliveryError {
    #[snafu(display("missing API key for provider '{provider_id}'"))]
    MissingApiKey {
        stage: &'static str,
        provider_id: String,
    },
    #[snafu(display("provider '{provider_id}' is not supported"))]
    UnsupportedProvider {
        stage: &'static str,
        provider_id: String,
    },
    #[snafu(display("message content is empty"))]
    EmptyContent { stage: &'static str },
    #[snafu(display("http client failed on `{stage}`, {source}"))]
    HttpClient {
        stage: &'static str,
        source: rig::http_client::Error,
    },
    #[snafu(display("completions failed on `{stage}`, {source}"))]
    CompletionsFailed {
        stage: &'static str,
        source: rig::completion::CompletionError,
    },
    #[snafu(display("tutor returned an empty reply"))]
    EmptyReply { stage: &'static str },
    #[snafu(display("{message}"))]
    Rejected {
        stage: &'static str,
        category: FailureCategory,
        message: String,
    },
}

impl DeliveryError {
    /// Builds a failure for clients outside this crate that only know a category and copy.
    pub fn rejected(category: FailureCategory, message: impl Into<String>) -> Self {
        Self::Rejected {
            stage: "client-rejected",
            category,
            message: message.into(),
        }
    }

    pub fn category(&self) -> FailureCategory {
        match self {
            Self::HttpClient { .. } | Self::CompletionsFailed { .. } => FailureCategory::Network,
            Self::EmptyContent { .. } => FailureCategory::Validation,
            Self::MissingApiKey { .. } | Self::UnsupportedProvider { .. } | Self::EmptyReply { .. } => {
                FailureCategory::Other
            }
            Self::Rejected { category, .. } => *category,
        }
    }
}

pub trait DeliveryClient: Send + Sync {
    fn id(&self) -> &str;
    fn send<'a>(&'a self, request: DeliveryRequest)
    -> BoxFuture<'a, DeliveryResult<DeliveryReceipt>>;
}

pub(crate) fn current_unix_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_millis() as u64)
        .unwrap_or_default()
}
