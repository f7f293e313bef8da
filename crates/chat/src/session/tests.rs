use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tokio::time::Instant;
use tutor_delivery::{
    DeliveryClient, EmbeddedPayload, FailureCategory, ScriptedDeliveryClient, ScriptedOutcome,
    TutorReply,
};

use super::ChatSession;
use crate::error::ChatError;
use crate::events::SessionEvent;
use crate::message::{Author, ConnectionStatus, FailureKind, MessageStatus};
use crate::reconciler::INTERRUPTED_DELIVERY_MESSAGE;
use crate::retry::{RetryDecision, RetryPhase, RetryPolicy};
use crate::tab::Tab;

fn session_with(
    script: impl IntoIterator<Item = ScriptedOutcome>,
    policy: RetryPolicy,
) -> (ChatSession, Arc<ScriptedDeliveryClient>) {
    let client = Arc::new(ScriptedDeliveryClient::new(script));
    let session = ChatSession::new(client.clone() as Arc<dyn DeliveryClient>, policy);
    (session, client)
}

fn manual_policy() -> RetryPolicy {
    RetryPolicy {
        auto_retry: false,
        ..RetryPolicy::default()
    }
}

fn scheduled_delays(events: &[SessionEvent]) -> Vec<Duration> {
    events
        .iter()
        .filter_map(|event| match event {
            SessionEvent::RetryScheduled { delay, .. } => Some(*delay),
            _ => None,
        })
        .collect()
}

#[tokio::test(start_paused = true)]
async fn transient_failures_recover_in_place() {
    let (mut session, client) = session_with(
        [
            ScriptedOutcome::network_failure("connection reset"),
            ScriptedOutcome::network_failure("connection reset"),
        ],
        RetryPolicy::default(),
    );
    let started = Instant::now();

    let temp_id = session.insert(Tab::Home, "Hello").expect("insert");
    let pending = session.find_by_temp_id(&temp_id).expect("visible immediately");
    assert_eq!(pending.status, MessageStatus::Pending);
    assert_eq!(session.messages(Tab::Home).len(), 1);

    let events = session.run_until_idle().await;

    let messages = session.messages(Tab::Home);
    assert_eq!(messages.len(), 1);
    let delivered = &messages[0];
    assert_eq!(delivered.id, pending.id);
    assert_eq!(delivered.status, MessageStatus::Sent);
    assert_eq!(delivered.retry_attempt, 2);
    assert_eq!(delivered.content, "Hello");
    assert_eq!(delivered.confirmed_id.as_deref(), Some("scripted-1"));
    assert!(delivered.error.is_none());
    assert!(!delivered.retrying);

    assert_eq!(client.call_count(), 3);
    assert_eq!(
        scheduled_delays(&events),
        vec![Duration::from_millis(1_000), Duration::from_millis(2_000)]
    );
    assert!(started.elapsed() >= Duration::from_millis(3_000));
    assert_eq!(session.connection_status(), ConnectionStatus::Online);
    assert_eq!(session.retry_phase(pending.id), RetryPhase::Idle);
}

#[tokio::test(start_paused = true)]
async fn exhausted_retries_leave_a_terminal_failure_until_the_next_success() {
    let (mut session, client) = session_with(
        [
            ScriptedOutcome::network_failure("offline"),
            ScriptedOutcome::network_failure("offline"),
            ScriptedOutcome::network_failure("offline"),
        ],
        RetryPolicy::default(),
    );

    let temp_id = session.insert(Tab::Learn, "X").expect("insert");
    let events = session.run_until_idle().await;
    let failed = session.find_by_temp_id(&temp_id).expect("still listed");

    assert_eq!(failed.status, MessageStatus::Failed { terminal: true });
    assert_eq!(failed.retry_attempt, 3);
    assert!(!failed.can_retry());
    assert_eq!(client.call_count(), 3);
    assert!(events.contains(&SessionEvent::RetryExhausted {
        message_id: failed.id,
        tab: Tab::Learn,
    }));
    assert_eq!(session.connection_status().label(), "Reconnecting…");
    assert_eq!(session.retry_phase(failed.id), RetryPhase::Terminal);

    assert!(matches!(
        session.retry(failed.id),
        Err(ChatError::RetryExhausted {
            attempts: 3,
            max_attempts: 3,
            ..
        })
    ));
    assert_eq!(client.call_count(), 3);

    session.insert(Tab::Learn, "Y").expect("insert");
    let events = session.run_until_idle().await;
    assert!(events.contains(&SessionEvent::ConnectionChanged(ConnectionStatus::Online)));
    assert_eq!(session.connection_status(), ConnectionStatus::Online);
}

#[tokio::test(start_paused = true)]
async fn switching_tabs_leaves_each_transcript_intact() {
    let (mut session, _client) = session_with([], RetryPolicy::default());

    session.submit("first question").expect("home insert");
    let home_before = session.messages(Tab::Home);

    session.switch_tab(Tab::Explore);
    session.submit("something else").expect("explore insert");
    session.switch_tab(Tab::Home);

    assert_eq!(session.active_tab(), Tab::Home);
    assert_eq!(session.messages(Tab::Home), home_before);
    assert_eq!(session.messages(Tab::Explore).len(), 1);
    assert!(session.messages(Tab::Learn).is_empty());

    let events = session.run_until_idle().await;
    assert!(events.contains(&SessionEvent::TabSwitched {
        from: Tab::Home,
        to: Tab::Explore,
    }));
    assert_eq!(session.messages(Tab::Home)[0].content, "first question");
    assert_eq!(session.messages(Tab::Explore)[0].content, "something else");
    assert!(
        Tab::ALL
            .into_iter()
            .flat_map(|tab| session.messages(tab).iter().cloned().collect::<Vec<_>>())
            .all(|message| message.status == MessageStatus::Sent)
    );
}

#[tokio::test(start_paused = true)]
async fn settlement_order_never_reorders_the_transcript() {
    let (mut session, _client) = session_with(
        [ScriptedOutcome::network_failure("timeout")],
        RetryPolicy::default(),
    );
    let transcript = session.transcript(Tab::Home);

    let temp_ids = ["one", "two", "three"]
        .into_iter()
        .map(|content| session.insert(Tab::Home, content).expect("insert"))
        .collect::<Vec<_>>();
    let ids = temp_ids
        .iter()
        .map(|temp_id| session.find_by_temp_id(temp_id).expect("listed").id)
        .collect::<Vec<_>>();
    session.run_until_idle().await;

    let snapshot = transcript.snapshot();
    assert_eq!(
        snapshot.iter().map(|message| message.id).collect::<Vec<_>>(),
        ids
    );
    assert_eq!(
        snapshot
            .iter()
            .map(|message| message.content.as_str())
            .collect::<Vec<_>>(),
        vec!["one", "two", "three"]
    );
    assert_eq!(snapshot[0].retry_attempt, 1);
    assert!(snapshot.iter().all(|message| message.status == MessageStatus::Sent));

    let unique = temp_ids
        .iter()
        .collect::<std::collections::HashSet<_>>();
    assert_eq!(unique.len(), temp_ids.len());
}

#[tokio::test(start_paused = true)]
async fn manual_retries_are_single_flight() {
    let (mut session, client) = session_with(
        [ScriptedOutcome::network_failure("offline")],
        manual_policy(),
    );

    let temp_id = session.insert(Tab::Home, "hi").expect("insert");
    session.run_until_idle().await;
    let failed = session.find_by_temp_id(&temp_id).expect("listed");
    assert_eq!(failed.status, MessageStatus::Failed { terminal: false });
    assert!(failed.can_retry());

    assert_eq!(
        session.retry(failed.id).expect("first retry"),
        RetryDecision::Scheduled {
            delay: Duration::from_millis(1_000)
        }
    );
    assert!(session.message(failed.id).is_some_and(|message| message.retrying));
    assert_eq!(
        session.retry(failed.id).expect("second retry"),
        RetryDecision::Ignored
    );
    assert_eq!(
        session.retry(failed.id).expect("third retry"),
        RetryDecision::Ignored
    );

    session.run_until_idle().await;
    assert_eq!(client.call_count(), 2);
    assert_eq!(
        session.message(failed.id).map(|message| message.status),
        Some(MessageStatus::Sent)
    );
    assert!(matches!(
        session.retry(failed.id),
        Err(ChatError::AlreadySent { .. })
    ));
}

#[tokio::test(start_paused = true)]
async fn manual_retry_waits_only_the_remaining_delay() {
    let (mut session, _client) = session_with(
        [ScriptedOutcome::network_failure("offline")],
        manual_policy(),
    );

    let temp_id = session.insert(Tab::Progress, "hi").expect("insert");
    session.run_until_idle().await;
    let message_id = session.find_by_temp_id(&temp_id).expect("listed").id;

    tokio::time::advance(Duration::from_millis(600)).await;
    assert_eq!(
        session.retry(message_id).expect("retry"),
        RetryDecision::Scheduled {
            delay: Duration::from_millis(400)
        }
    );
}

#[tokio::test(start_paused = true)]
async fn pending_messages_ignore_retry_requests() {
    let client = Arc::new(ScriptedDeliveryClient::default().with_latency(Duration::from_millis(500)));
    let mut session = ChatSession::new(client.clone(), RetryPolicy::default());

    let temp_id = session.insert(Tab::Home, "hi").expect("insert");
    let message_id = session.find_by_temp_id(&temp_id).expect("listed").id;

    assert_eq!(
        session.retry(message_id).expect("retry"),
        RetryDecision::Ignored
    );
    session.run_until_idle().await;
    assert_eq!(client.call_count(), 1);
}

#[tokio::test(start_paused = true)]
async fn validation_failures_are_final_and_cost_nothing() {
    let (mut session, client) = session_with(
        [ScriptedOutcome::failure(
            FailureCategory::Validation,
            "message is too long",
        )],
        RetryPolicy::default(),
    );

    let temp_id = session.insert(Tab::Explore, "??").expect("insert");
    let events = session.run_until_idle().await;
    let failed = session.find_by_temp_id(&temp_id).expect("listed");

    assert_eq!(failed.status, MessageStatus::Failed { terminal: true });
    assert_eq!(failed.retry_attempt, 0);
    assert_eq!(
        failed.error.as_ref().map(|error| error.kind),
        Some(FailureKind::Validation)
    );
    assert!(scheduled_delays(&events).is_empty());
    assert_eq!(client.call_count(), 1);
    assert_eq!(session.connection_status(), ConnectionStatus::Online);
    assert!(matches!(
        session.retry(failed.id),
        Err(ChatError::NotRetryable { .. })
    ));
}

#[tokio::test(start_paused = true)]
async fn blank_input_is_rejected_without_side_effects() {
    let (mut session, client) = session_with([], RetryPolicy::default());

    assert!(matches!(
        session.insert(Tab::Home, "   "),
        Err(ChatError::EmptyContent { .. })
    ));
    assert!(session.messages(Tab::Home).is_empty());
    assert!(!session.has_pending_work());
    assert!(session.run_until_idle().await.is_empty());
    assert_eq!(client.call_count(), 0);
}

#[tokio::test(start_paused = true)]
async fn dismissing_cancels_outstanding_work() {
    let client = Arc::new(ScriptedDeliveryClient::default().with_latency(Duration::from_millis(500)));
    let mut session = ChatSession::new(client.clone(), RetryPolicy::default());

    let temp_id = session.insert(Tab::Home, "never mind").expect("insert");
    let message_id = session.find_by_temp_id(&temp_id).expect("listed").id;
    let dismissed = session.dismiss(message_id).expect("dismiss");
    assert_eq!(dismissed.content, "never mind");

    let events = session.run_until_idle().await;
    assert_eq!(
        events,
        vec![
            SessionEvent::MessageInserted {
                message_id,
                tab: Tab::Home,
                temp_id,
            },
            SessionEvent::MessageDismissed {
                message_id,
                tab: Tab::Home,
            },
        ]
    );
    assert!(session.messages(Tab::Home).is_empty());
    assert!(session.find_by_temp_id(&temp_id).is_none());
    assert_eq!(client.call_count(), 0);
    assert!(matches!(
        session.dismiss(message_id),
        Err(ChatError::UnknownMessage { .. })
    ));
}

#[tokio::test(start_paused = true)]
async fn dismissing_a_scheduled_retry_stops_the_timer() {
    let (mut session, client) = session_with(
        [ScriptedOutcome::network_failure("offline")],
        RetryPolicy::default(),
    );

    let temp_id = session.insert(Tab::Home, "hi").expect("insert");
    while let Some(event) = session.next_event().await {
        if matches!(event, SessionEvent::RetryScheduled { .. }) {
            break;
        }
    }
    let message_id = session.find_by_temp_id(&temp_id).expect("listed").id;
    assert!(matches!(
        session.retry_phase(message_id),
        RetryPhase::Scheduled { .. }
    ));

    session.dismiss(message_id).expect("dismiss");
    session.run_until_idle().await;
    tokio::time::sleep(Duration::from_secs(10)).await;

    assert!(!session.has_pending_work());
    assert_eq!(client.call_count(), 1);
}

#[tokio::test(start_paused = true)]
async fn tutor_replies_land_after_the_question() {
    let reply = TutorReply::text("What is a variable?\nWhat is a loop?\nWhat is a function?")
        .with_embedded(EmbeddedPayload::new(
            "assessment",
            json!({ "questions": ["What is a variable?", "What is a loop?", "What is a function?"] }),
        ));
    let (mut session, _client) = session_with(
        [ScriptedOutcome::ConfirmWithReply(reply)],
        RetryPolicy::default(),
    );

    session.insert(Tab::Learn, "Teach me Python").expect("insert");
    let events = session.run_until_idle().await;

    let messages = session.messages(Tab::Learn);
    assert_eq!(messages.len(), 2);
    assert_eq!(messages[0].author, Author::User);
    assert_eq!(messages[0].status, MessageStatus::Sent);
    assert_eq!(messages[1].author, Author::Assistant);
    assert_eq!(messages[1].status, MessageStatus::Sent);
    assert_eq!(
        messages[1].embedded.as_ref().map(|payload| payload.kind.as_str()),
        Some("assessment")
    );
    assert!(events.contains(&SessionEvent::ReplyAppended {
        message_id: messages[1].id,
        tab: Tab::Learn,
    }));
}

#[tokio::test(start_paused = true)]
async fn teardown_leaves_unconfirmed_messages_retryable() {
    let client = Arc::new(ScriptedDeliveryClient::default().with_latency(Duration::from_millis(500)));
    let mut session = ChatSession::new(client.clone(), RetryPolicy::default());

    let temp_id = session.insert(Tab::Home, "hi").expect("insert");
    session.teardown();

    let interrupted = session.find_by_temp_id(&temp_id).expect("still listed");
    assert_eq!(interrupted.status, MessageStatus::Failed { terminal: false });
    assert_eq!(
        interrupted.error.as_ref().map(|error| error.message.as_str()),
        Some(INTERRUPTED_DELIVERY_MESSAGE)
    );
    assert!(interrupted.can_retry());
    session.run_until_idle().await;
    assert_eq!(client.call_count(), 0);

    assert_eq!(
        session.retry(interrupted.id).expect("retry"),
        RetryDecision::Scheduled {
            delay: Duration::from_millis(1_000)
        }
    );
    session.run_until_idle().await;
    assert_eq!(
        session.message(interrupted.id).map(|message| message.status),
        Some(MessageStatus::Sent)
    );
    assert_eq!(client.call_count(), 1);
}

#[tokio::test(start_paused = true)]
async fn resetting_one_tab_spares_the_others() {
    let client = Arc::new(ScriptedDeliveryClient::default().with_latency(Duration::from_millis(100)));
    let mut session = ChatSession::new(client.clone(), RetryPolicy::default());

    session.insert(Tab::Home, "home").expect("insert");
    session.insert(Tab::Explore, "explore").expect("insert");
    session.reset_tab(Tab::Home);

    let events = session.run_until_idle().await;
    assert!(session.messages(Tab::Home).is_empty());
    assert_eq!(session.messages(Tab::Explore).len(), 1);
    assert_eq!(
        session.messages(Tab::Explore)[0].status,
        MessageStatus::Sent
    );
    assert!(events.contains(&SessionEvent::TabReset { tab: Tab::Home }));
    assert!(
        events
            .iter()
            .filter(|event| !matches!(event, SessionEvent::TabReset { .. }))
            .all(|event| event.tab() == Some(Tab::Explore))
    );
    assert_eq!(client.call_count(), 1);
}

#[tokio::test(start_paused = true)]
async fn full_reset_clears_everything() {
    let client = Arc::new(ScriptedDeliveryClient::default().with_latency(Duration::from_millis(100)));
    let mut session = ChatSession::new(client.clone(), RetryPolicy::default());

    session.insert(Tab::Home, "a").expect("insert");
    session.insert(Tab::Progress, "b").expect("insert");
    session.reset();

    let events = session.run_until_idle().await;
    assert_eq!(
        events,
        Tab::ALL
            .into_iter()
            .map(|tab| SessionEvent::TabReset { tab })
            .collect::<Vec<_>>()
    );
    assert!(
        Tab::ALL
            .into_iter()
            .all(|tab| session.messages(tab).is_empty())
    );
    assert_eq!(client.call_count(), 0);
    assert_eq!(session.connection_status(), ConnectionStatus::Online);
}

#[tokio::test(start_paused = true)]
async fn clearing_retry_state_restores_the_full_budget() {
    let (mut session, client) = session_with(
        std::iter::repeat_with(|| ScriptedOutcome::network_failure("offline")).take(4),
        manual_policy(),
    );

    let temp_id = session.insert(Tab::Home, "hi").expect("insert");
    session.run_until_idle().await;
    let message_id = session.find_by_temp_id(&temp_id).expect("listed").id;
    session.retry(message_id).expect("retry");
    session.run_until_idle().await;

    let worn = session.message(message_id).expect("listed");
    assert_eq!(worn.retry_attempt, 2);
    assert_eq!(worn.status, MessageStatus::Failed { terminal: false });

    session.clear_retry_state(message_id);
    let cleared = session.message(message_id).expect("listed");
    assert_eq!(cleared.retry_attempt, 0);
    assert!(cleared.can_retry());

    assert_eq!(
        session.retry(message_id).expect("retry after clear"),
        RetryDecision::Scheduled {
            delay: Duration::from_millis(1_000)
        }
    );
    session.run_until_idle().await;
    session.retry(message_id).expect("second retry after clear");
    session.run_until_idle().await;

    let message = session.message(message_id).expect("listed");
    assert_eq!(message.retry_attempt, 2);
    assert_eq!(message.status, MessageStatus::Failed { terminal: false });
    assert!(message.can_retry());
    assert_eq!(client.call_count(), 4);
}

#[tokio::test(start_paused = true)]
async fn retry_and_dismiss_never_touch_other_tabs() {
    let (mut session, _client) = session_with(
        [ScriptedOutcome::network_failure("offline")],
        manual_policy(),
    );

    let home_temp_id = session.insert(Tab::Home, "home").expect("insert");
    session.insert(Tab::Explore, "explore").expect("insert");
    session.run_until_idle().await;
    let home_id = session.find_by_temp_id(&home_temp_id).expect("listed").id;
    let explore = session.messages(Tab::Explore);
    assert_eq!(explore[0].status, MessageStatus::Sent);

    session.retry(home_id).expect("retry");
    assert!(Arc::ptr_eq(&explore, &session.messages(Tab::Explore)));
    session.run_until_idle().await;
    assert_eq!(
        session.message(home_id).map(|message| message.status),
        Some(MessageStatus::Sent)
    );
    assert!(Arc::ptr_eq(&explore, &session.messages(Tab::Explore)));

    session.dismiss(home_id).expect("dismiss");
    assert!(session.messages(Tab::Home).is_empty());
    assert!(Arc::ptr_eq(&explore, &session.messages(Tab::Explore)));
}
