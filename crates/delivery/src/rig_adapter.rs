use futures::StreamExt;
use rig::completion::{CompletionModel, Message as RigMessage};
use rig::prelude::CompletionClient;
use rig::providers::openai;
use rig::streaming::StreamedAssistantContent;
use snafu::{ResultExt, ensure};
use uuid::Uuid;

use super::assessment::assessment_payload;
use super::client::{
    BoxFuture, ClientConfig, CompletionsFailedSnafu, DeliveryClient, DeliveryReceipt,
    DeliveryRequest, DeliveryResult, EmptyContentSnafu, EmptyReplySnafu, HttpClientSnafu,
    MissingApiKeySnafu, TutorReply, current_unix_millis,
};

pub const RIG_OPENAI_PROVIDER_ID: &str = "openai";
pub const DEFAULT_TUTOR_MODEL: &str = "gpt-4o-mini";

pub const DEFAULT_TUTOR_PREAMBLE: &str = "You are an expert tutor who helps students learn. \
When a student describes something they want to learn, reply with 4-5 short assessment \
questions, one per line, each ending with a question mark and without numbering. \
Otherwise answer clearly and encourage the next step.";

type RigStreamingResponse = rig::streaming::StreamingCompletionResponse<
    rig::providers::openai::responses_api::streaming::StreamingCompletionResponse,
>;

/// Delivery client backed by an OpenAI-compatible tutor model.
///
/// A message counts as delivered once the tutor has produced a complete reply; the
/// reply travels back on the receipt.
pub struct RigTutorClient {
    config: ClientConfig,
}

impl RigTutorClient {
    pub fn new(config: ClientConfig) -> DeliveryResult<Self> {
        ensure!(
            !config.api_key.is_empty(),
            MissingApiKeySnafu {
                stage: "rig-tutor-new",
                provider_id: config.provider_id.clone(),
            }
        );

        Ok(Self { config })
    }

    fn build_client(config: &ClientConfig) -> DeliveryResult<openai::Client> {
        let mut builder = openai::Client::builder().api_key(config.api_key.as_str());
        if !config.endpoint.is_empty() {
            builder = builder.base_url(config.endpoint.as_str());
        }
        builder.build().context(HttpClientSnafu {
            stage: "build-client",
        })
    }

    fn model_id(config: &ClientConfig) -> String {
        if config.model.is_empty() {
            DEFAULT_TUTOR_MODEL.to_string()
        } else {
            config.model.clone()
        }
    }

    fn preamble(config: &ClientConfig, request: &DeliveryRequest) -> String {
        let base = config
            .preamble
            .as_deref()
            .unwrap_or(DEFAULT_TUTOR_PREAMBLE);
        format!("{base}\n\nThe student is writing from the '{}' tab.", request.tab_id)
    }

    async fn open_stream(
        config: &ClientConfig,
        request: &DeliveryRequest,
    ) -> DeliveryResult<RigStreamingResponse> {
        let client = Self::build_client(config)?;
        let model = client.completion_model(Self::model_id(config));
        let prompt = RigMessage::user(request.content.clone());

        model
            .completion_request(prompt)
            .preamble(Self::preamble(config, request))
            .stream()
            .await
            .context(CompletionsFailedSnafu {
                stage: "open-stream",
            })
    }

    async fn collect_reply(
        config: &ClientConfig,
        request: &DeliveryRequest,
    ) -> DeliveryResult<String> {
        let mut stream = Self::open_stream(config, request).await?;
        let mut reply = String::new();

        while let Some(item) = stream.next().await {
            let item = item.context(CompletionsFailedSnafu {
                stage: "stream-chunk",
            })?;
            // Reasoning and tool traffic never reaches the transcript.
            if let StreamedAssistantContent::Text(text) = item {
                reply.push_str(&text.text);
            }
        }

        Ok(reply)
    }
}

impl DeliveryClient for RigTutorClient {
    fn id(&self) -> &str {
        &self.config.provider_id
    }

    fn send<'a>(
        &'a self,
        request: DeliveryRequest,
    ) -> BoxFuture<'a, DeliveryResult<DeliveryReceipt>> {
        Box::pin(async move {
            ensure!(
                !request.content.trim().is_empty(),
                EmptyContentSnafu { stage: "rig-send" }
            );

            let reply = match Self::collect_reply(&self.config, &request).await {
                Ok(reply) => reply,
                Err(error) => {
                    tracing::warn!(
                        provider_id = %self.config.provider_id,
                        tab = %request.tab_id,
                        error = %error,
                        "tutor delivery failed"
                    );
                    return Err(error);
                }
            };

            let reply = reply.trim().to_string();
            ensure!(
                !reply.is_empty(),
                EmptyReplySnafu {
                    stage: "rig-collect-reply",
                }
            );

            let embedded = assessment_payload(&reply);
            let mut tutor_reply = TutorReply::text(reply);
            if let Some(embedded) = embedded {
                tutor_reply = tutor_reply.with_embedded(embedded);
            }

            Ok(DeliveryReceipt {
                confirmed_id: Uuid::now_v7().to_string(),
                content: request.content,
                timestamp_unix_ms: current_unix_millis(),
                reply: Some(tutor_reply),
            })
        })
    }
}
