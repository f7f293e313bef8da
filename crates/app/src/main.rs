use std::sync::Arc;
use std::time::Duration;

use snafu::{ResultExt, Snafu};
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing_subscriber::EnvFilter;
use tutor_chat::{
    Author, ChatSession, ChatSettings, Message, MessageId, MessageStatus, RetryDecision,
    SessionEvent, Tab,
};
use tutor_delivery::{
    ASSESSMENT_PAYLOAD_KIND, DeliveryClient, ScriptedDeliveryClient, create_client,
};

const OFFLINE_LATENCY: Duration = Duration::from_millis(300);

const HELP: &str = "\
commands:
  <text>          send a message to the active tab
  /tab <name>     switch to home, explore, learn or progress
  /retry <id>     retry a failed message
  /dismiss <id>   remove a message
  /reset          clear every tab
  /help           show this help
  /quit           exit";

#[derive(Debug, Snafu)]
enum AppError {
    #[snafu(display("failed to read input on `{stage}`: {source}"))]
    ReadInput {
        stage: &'static str,
        source: std::io::Error,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Command {
    Submit(String),
    SwitchTab(Tab),
    Retry(MessageId),
    Dismiss(MessageId),
    Reset,
    Help,
    Quit,
    Invalid(String),
}

fn parse_command(line: &str) -> Option<Command> {
    let trimmed = line.trim();
    if trimmed.is_empty() {
        return None;
    }
    let Some(rest) = trimmed.strip_prefix('/') else {
        return Some(Command::Submit(line.trim_end_matches(['\r', '\n']).to_string()));
    };

    let (name, argument) = rest
        .split_once(char::is_whitespace)
        .map(|(name, argument)| (name, argument.trim()))
        .unwrap_or((rest, ""));

    let command = match name {
        "tab" => match argument.parse::<Tab>() {
            Ok(tab) => Command::SwitchTab(tab),
            Err(error) => Command::Invalid(error.to_string()),
        },
        "retry" => parse_message_id(argument).map_or_else(Command::Invalid, Command::Retry),
        "dismiss" => parse_message_id(argument).map_or_else(Command::Invalid, Command::Dismiss),
        "reset" => Command::Reset,
        "help" => Command::Help,
        "quit" | "exit" => Command::Quit,
        other => Command::Invalid(format!("unknown command '/{other}', try /help")),
    };
    Some(command)
}

fn parse_message_id(raw: &str) -> Result<MessageId, String> {
    raw.trim_start_matches('#')
        .parse::<u64>()
        .map(MessageId::new)
        .map_err(|_| format!("'{raw}' is not a message id"))
}

fn build_client(settings: &ChatSettings) -> Arc<dyn DeliveryClient> {
    let offline = || -> Arc<dyn DeliveryClient> {
        Arc::new(ScriptedDeliveryClient::echo().with_latency(OFFLINE_LATENCY))
    };

    let Some(config) = settings.tutor.to_client_config() else {
        tracing::info!("no tutor api key configured, running offline");
        return offline();
    };
    match create_client(config) {
        Ok(client) => client,
        Err(error) => {
            tracing::warn!("{error}. running offline");
            offline()
        }
    }
}

fn render_message(message: &Message) -> String {
    let author = match message.author {
        Author::User => "you",
        Author::Assistant => "tutor",
    };
    let mut rendered = format!("  #{} {author}: {}", message.id, message.content);

    if message.author == Author::User {
        let status = match (&message.status, &message.error) {
            (MessageStatus::Failed { .. }, Some(error)) if message.can_retry() => format!(
                "{}: {} (/retry {})",
                error.kind.headline(),
                error.message,
                message.id
            ),
            (MessageStatus::Failed { .. }, Some(error)) => {
                format!("{}: {}", error.kind.headline(), error.message)
            }
            _ if message.retrying => "retrying".to_string(),
            _ => message.status_label().to_string(),
        };
        rendered.push_str(&format!("  [{status}]"));
    }

    if let Some(payload) = message
        .embedded
        .as_ref()
        .filter(|payload| payload.kind == ASSESSMENT_PAYLOAD_KIND)
    {
        let questions = payload.payload["questions"]
            .as_array()
            .map(Vec::len)
            .unwrap_or_default();
        rendered.push_str(&format!("\n    (assessment with {questions} questions)"));
    }
    rendered
}

fn render(session: &ChatSession) {
    let tab = session.active_tab();
    println!("── {} · {} ──", tab.title(), session.connection_status().label());
    for message in session.messages(tab).iter() {
        println!("{}", render_message(message));
    }
}

fn should_render(session: &ChatSession, event: &SessionEvent) -> bool {
    match event {
        SessionEvent::TabSwitched { .. } | SessionEvent::ConnectionChanged(_) => true,
        other => other.tab() == Some(session.active_tab()),
    }
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<(), AppError> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .init();

    let settings = ChatSettings::load();
    let client = build_client(&settings);
    let mut session = ChatSession::with_settings(client, &settings);
    tracing::info!(
        client = session.client_id(),
        tab = %session.active_tab(),
        "tutor chat started"
    );

    println!("{HELP}");
    render(&session);

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            biased;
            Some(event) = session.next_event(), if session.has_pending_work() => {
                tracing::debug!(event = ?event, "session event");
                if should_render(&session, &event) {
                    render(&session);
                }
            }
            line = lines.next_line() => {
                let Some(line) = line.context(ReadInputSnafu { stage: "read-stdin" })? else {
                    break;
                };
                let Some(command) = parse_command(&line) else {
                    continue;
                };

                match command {
                    Command::Submit(content) => {
                        if let Err(error) = session.submit(&content) {
                            println!("{error}");
                        }
                    }
                    Command::SwitchTab(tab) => session.switch_tab(tab),
                    Command::Retry(message_id) => match session.retry(message_id) {
                        Ok(RetryDecision::Scheduled { delay }) => {
                            println!("retrying #{message_id} in {}ms", delay.as_millis());
                        }
                        Ok(RetryDecision::Ignored) => {
                            println!("#{message_id} is already being delivered");
                        }
                        Err(error) => println!("{error}"),
                    },
                    Command::Dismiss(message_id) => {
                        if let Err(error) = session.dismiss(message_id) {
                            println!("{error}");
                        }
                    }
                    Command::Reset => session.reset(),
                    Command::Help => println!("{HELP}"),
                    Command::Quit => break,
                    Command::Invalid(reason) => println!("{reason}"),
                }
            }
        }
    }

    session.teardown();
    Ok(())
}
