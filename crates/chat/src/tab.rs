use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use arc_swap::ArcSwap;
use serde::{Deserialize, Serialize};

use super::error::{ChatError, ChatResult};
use super::message::Message;

/// Fixed set of independent conversation contexts.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum Tab {
    #[default]
    Home,
    Explore,
    Learn,
    Progress,
}

impl Tab {
    pub const COUNT: usize = 4;
    pub const ALL: [Tab; Tab::COUNT] = [Tab::Home, Tab::Explore, Tab::Learn, Tab::Progress];

    pub const fn index(self) -> usize {
        match self {
            Self::Home => 0,
            Self::Explore => 1,
            Self::Learn => 2,
            Self::Progress => 3,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Home => "home",
            Self::Explore => "explore",
            Self::Learn => "learn",
            Self::Progress => "progress",
        }
    }

    pub fn title(self) -> &'static str {
        match self {
            Self::Home => "Home",
            Self::Explore => "Explore",
            Self::Learn => "Learn",
            Self::Progress => "Progress",
        }
    }
}

impl fmt::Display for Tab {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter.write_str(self.as_str())
    }
}

impl FromStr for Tab {
    type Err = ChatError;

    fn from_str(raw: &str) -> ChatResult<Self> {
        let normalized = raw.trim();
        Tab::ALL
            .into_iter()
            .find(|tab| tab.as_str().eq_ignore_ascii_case(normalized))
            .ok_or_else(|| ChatError::UnknownTab {
                stage: "parse-tab",
                raw: raw.to_string(),
            })
    }
}

/// Read handle on one tab's transcript.
///
/// Cheap to clone and safe to hold on another thread; every `snapshot` is an immutable
/// sequence, so a render pass never observes a half-applied update.
#[derive(Clone)]
pub struct TranscriptHandle {
    tab: Tab,
    messages: Arc<ArcSwap<Vec<Message>>>,
}

impl TranscriptHandle {
    pub fn tab(&self) -> Tab {
        self.tab
    }

    pub fn snapshot(&self) -> Arc<Vec<Message>> {
        self.messages.load_full()
    }

    pub fn len(&self) -> usize {
        self.messages.load().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Maps each tab to its transcript and tracks which tab is active.
pub struct TabRouter {
    transcripts: [Arc<ArcSwap<Vec<Message>>>; Tab::COUNT],
    active: Tab,
}

impl TabRouter {
    pub fn new(active: Tab) -> Self {
        Self {
            transcripts: std::array::from_fn(|_| Arc::new(ArcSwap::from_pointee(Vec::new()))),
            active,
        }
    }

    pub fn active(&self) -> Tab {
        self.active
    }

    pub fn is_active(&self, tab: Tab) -> bool {
        self.active == tab
    }

    /// Switches the active tab, returning the previous one when it changed.
    pub fn activate(&mut self, tab: Tab) -> Option<Tab> {
        if self.active == tab {
            return None;
        }

        let previous = self.active;
        self.active = tab;
        Some(previous)
    }

    pub fn snapshot(&self, tab: Tab) -> Arc<Vec<Message>> {
        self.transcripts[tab.index()].load_full()
    }

    pub fn handle(&self, tab: Tab) -> TranscriptHandle {
        TranscriptHandle {
            tab,
            messages: Arc::clone(&self.transcripts[tab.index()]),
        }
    }

    /// Publishes a new sequence for exactly one tab.
    pub(crate) fn publish(&self, tab: Tab, messages: Vec<Message>) {
        self.transcripts[tab.index()].store(Arc::new(messages));
    }
}

impl Default for TabRouter {
    fn default() -> Self {
        Self::new(Tab::default())
    }
}
