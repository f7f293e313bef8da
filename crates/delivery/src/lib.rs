use std::sync::Arc;

mod assessment;
mod client;
mod rig_adapter;
mod scripted;

pub use assessment::{
    ASSESSMENT_PAYLOAD_KIND, COMMON_ASSESSMENT_QUESTIONS, MIN_ASSESSMENT_QUESTIONS,
    assessment_payload, parse_questions,
};
pub use client::{
    BoxFuture, ClientConfig, DeliveryClient, DeliveryError, DeliveryReceipt, DeliveryRequest,
    DeliveryResult, EmbeddedPayload, FailureCategory, TutorReply,
};
pub use rig_adapter::{
    DEFAULT_TUTOR_MODEL, DEFAULT_TUTOR_PREAMBLE, RIG_OPENAI_PROVIDER_ID, RigTutorClient,
};
pub use scripted::{SCRIPTED_PROVIDER_ID, ScriptedDeliveryClient, ScriptedOutcome};

pub fn create_client(mut config: ClientConfig) -> DeliveryResult<Arc<dyn DeliveryClient>> {
    if config.provider_id.trim().is_empty() {
        config.provider_id = RIG_OPENAI_PROVIDER_ID.to_string();
    }

    match config.provider_id.as_str() {
        "openai" | "rig-openai" => {
            config.provider_id = RIG_OPENAI_PROVIDER_ID.to_string();
            Ok(Arc::new(RigTutorClient::new(config)?))
        }
        SCRIPTED_PROVIDER_ID => Ok(Arc::new(ScriptedDeliveryClient::echo())),
        _ => Err(DeliveryError::UnsupportedProvider {
            stage: "create-client",
            provider_id: config.provider_id,
        }),
    }
}
