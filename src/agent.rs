//! The assistant: persona prompt, short-term history and the model call.

pub mod channel;

pub use channel::Channel;

use crate::coalesce::Turn;
use crate::config::Config;
use crate::conversation::ConversationHistory;
use crate::error::Result;
use crate::llm::{CompletionRequest, GeminiClient};

use std::future::Future;

/// Produces a reply for one combined user turn.
pub trait Agent: Send + Sync + 'static {
    fn reply(&self, turn: &Turn) -> impl Future<Output = Result<String>> + Send;
}

/// Gemini-backed agent speaking with the configured persona.
pub struct PersonaAgent {
    persona: String,
    history: ConversationHistory,
    client: GeminiClient,
}

impl PersonaAgent {
    pub fn new(config: &Config) -> Result<Self> {
        Ok(Self {
            persona: config.agent.persona.clone(),
            history: ConversationHistory::new(config.agent.history_turns),
            client: GeminiClient::new(&config.llm)?,
        })
    }

    fn system_instruction(&self, now: chrono::DateTime<chrono::Local>) -> String {
        format!(
            "{}\n\nCurrent date and time: {}",
            self.persona.trim_end(),
            now.format("%A, %d %B %Y %H:%M (UTC%:z)")
        )
    }
}

impl Agent for PersonaAgent {
    async fn reply(&self, turn: &Turn) -> Result<String> {
        let request = CompletionRequest {
            system_instruction: self.system_instruction(chrono::Local::now()),
            history: self.history.recent(&turn.user_id).await,
            prompt: turn.text.clone(),
            attachments: turn.attachments.clone(),
        };

        tracing::debug!(
            user_id = %turn.user_id,
            model = self.client.model(),
            history = request.history.len(),
            attachments = request.attachments.len(),
            "requesting completion"
        );

        let reply = self.client.complete(&request).await?;

        self.history.record(&turn.user_id, &turn.text, &reply).await;

        Ok(reply)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone as _;

    #[test]
    fn system_instruction_carries_persona_and_clock() {
        let _ = rustls::crypto::ring::default_provider().install_default();
        let config = Config::from_toml_str(
            indoc::indoc! {r#"
                [llm]
                api_key = "test-key"

                [agent]
                persona = "You are Tara.\n"
            "#},
            std::path::Path::new("/tmp/tara-test"),
        )
        .unwrap();
        let agent = PersonaAgent::new(&config).unwrap();

        let now = chrono::Local
            .with_ymd_and_hms(2024, 3, 15, 9, 30, 0)
            .single()
            .unwrap();
        let instruction = agent.system_instruction(now);

        assert!(instruction.starts_with("You are Tara.\n\nCurrent date and time: "));
        assert!(instruction.contains("Friday, 15 March 2024 09:30"));
    }
}
