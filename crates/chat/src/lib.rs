pub mod error;
pub mod events;
pub mod ids;
pub mod inserter;
pub mod message;
pub mod reconciler;
pub mod retry;
pub mod session;
pub mod settings;
pub mod store;
pub mod tab;

pub use error::{ChatError, ChatResult};
pub use events::SessionEvent;
pub use ids::{MessageId, TempId};
pub use inserter::OptimisticInserter;
pub use message::{
    Author, ConnectionStatus, DeliveryFailure, FailureKind, Message, MessageStatus,
};
pub use reconciler::{INTERRUPTED_DELIVERY_MESSAGE, StatusReconciler};
pub use retry::{
    DEFAULT_MAX_RETRY_ATTEMPTS, DEFAULT_RETRY_BASE_DELAY, DEFAULT_RETRY_MULTIPLIER,
    RetryCoordinator, RetryDecision, RetryPhase, RetryPolicy, RetryState,
};
pub use session::ChatSession;
pub use settings::{ChatSettings, RetrySettings, SettingsError, TutorSettings};
pub use store::ConversationStore;
pub use tab::{Tab, TabRouter, TranscriptHandle};
pub use tutor_delivery::EmbeddedPayload;
