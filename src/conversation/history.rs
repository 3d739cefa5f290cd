//! Per-session conversation history (in memory).

use std::collections::{HashMap, VecDeque};
use tokio::sync::RwLock;

/// One completed exchange: what the user said and what the assistant replied.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Exchange {
    pub user: String,
    pub assistant: String,
    pub created_at: chrono::DateTime<chrono::Utc>,
}

/// Keeps the most recent exchanges of every session.
///
/// Only the last `max_turns` exchanges per session are retained; older ones
/// are dropped as new ones arrive. Nothing is persisted.
#[derive(Debug)]
pub struct ConversationHistory {
    max_turns: usize,
    sessions: RwLock<HashMap<String, VecDeque<Exchange>>>,
}

impl ConversationHistory {
    pub fn new(max_turns: usize) -> Self {
        Self {
            max_turns,
            sessions: RwLock::new(HashMap::new()),
        }
    }

    /// Recent exchanges for a session, oldest first.
    pub async fn recent(&self, session_id: &str) -> Vec<Exchange> {
        self.sessions
            .read()
            .await
            .get(session_id)
            .map(|exchanges| exchanges.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Record a completed exchange.
    pub async fn record(
        &self,
        session_id: &str,
        user: impl Into<String>,
        assistant: impl Into<String>,
    ) {
        if self.max_turns == 0 {
            return;
        }

        let mut sessions = self.sessions.write().await;
        let exchanges = sessions.entry(session_id.to_string()).or_default();
        exchanges.push_back(Exchange {
            user: user.into(),
            assistant: assistant.into(),
            created_at: chrono::Utc::now(),
        });
        while exchanges.len() > self.max_turns {
            exchanges.pop_front();
        }
    }

    /// Forget a session entirely.
    pub async fn clear(&self, session_id: &str) {
        self.sessions.write().await.remove(session_id);
    }
}
