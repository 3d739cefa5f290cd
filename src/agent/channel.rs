//! Channel: turns a coalesced user turn into a paced, chunked reply.

use crate::agent::Agent;
use crate::chunk;
use crate::coalesce::{Turn, TurnHandler};
use crate::config::RuntimeConfig;
use crate::error::Result;
use crate::messaging::MessagingManager;
use crate::{InboundMessage, OutboundResponse, StatusUpdate};

use std::sync::Arc;

/// Sent once when the agent fails to produce a reply.
pub const APOLOGY: &str = "Sorry, I ran into a problem answering that. Please try again in a moment.";

/// User-facing conversation glue between the coalescer, the agent and the adapters.
pub struct Channel<A: Agent> {
    agent: Arc<A>,
    messaging: Arc<MessagingManager>,
    runtime_config: Arc<RuntimeConfig>,
}

impl<A: Agent> Channel<A> {
    pub fn new(
        agent: Arc<A>,
        messaging: Arc<MessagingManager>,
        runtime_config: Arc<RuntimeConfig>,
    ) -> Self {
        Self {
            agent,
            messaging,
            runtime_config,
        }
    }

    async fn set_status(&self, target: &InboundMessage, status: StatusUpdate) {
        if let Err(error) = self.messaging.send_status(target, status).await {
            tracing::debug!(%error, source = %target.source, ?status, "failed to send status");
        }
    }

    async fn deliver_reply(&self, target: &InboundMessage, reply: &str) -> Result<()> {
        if reply.trim().is_empty() {
            tracing::debug!(source = %target.source, "reply is blank, nothing to deliver");
            return Ok(());
        }

        let max_length = self.messaging.max_message_length(&target.source).await?;
        let fragments = chunk::chunk(reply, max_length);

        let pacing = self.runtime_config.delivery.load().pacing();
        let messaging = &self.messaging;
        let delivered = chunk::deliver(
            &fragments,
            |text| async move {
                messaging
                    .respond(target, OutboundResponse::Text(text))
                    .await
            },
            pacing,
        )
        .await?;

        tracing::info!(
            source = %target.source,
            conversation_id = %target.conversation_id,
            fragments = delivered,
            "reply delivered"
        );
        Ok(())
    }
}

impl<A: Agent> TurnHandler for Channel<A> {
    async fn handle(&self, turn: Turn) -> Result<()> {
        let Some(target) = turn.reply_target().cloned() else {
            return Ok(());
        };

        self.set_status(&target, StatusUpdate::Thinking).await;

        let reply = match self.agent.reply(&turn).await {
            Ok(reply) => reply,
            Err(error) => {
                self.set_status(&target, StatusUpdate::StopTyping).await;
                if let Err(send_error) = self
                    .messaging
                    .respond(&target, OutboundResponse::Text(APOLOGY.into()))
                    .await
                {
                    tracing::warn!(%send_error, user_id = %turn.user_id, "failed to send apology");
                }
                return Err(error);
            }
        };

        let result = self.deliver_reply(&target, &reply).await;
        self.set_status(&target, StatusUpdate::StopTyping).await;
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DeliveryConfig;
    use crate::error::{Error, LlmError, MessagingError};
    use crate::messaging::Messaging;
    use crate::messaging::traits::InboundStream;
    use std::sync::Mutex;
    use std::time::Duration;
    use tokio::time::Instant;

    #[derive(Debug, Clone, PartialEq)]
    enum Sent {
        Text(String, Instant),
        Status(StatusUpdate),
    }

    struct RecordingAdapter {
        max_length: usize,
        fail_after: Option<usize>,
        log: Arc<Mutex<Vec<Sent>>>,
    }

    impl Messaging for RecordingAdapter {
        fn name(&self) -> &str {
            "test"
        }

        async fn start(&self) -> Result<InboundStream> {
            Ok(Box::pin(futures::stream::empty()))
        }

        fn max_message_length(&self) -> usize {
            self.max_length
        }

        async fn respond(&self, _message: &InboundMessage, response: OutboundResponse) -> Result<()> {
            let mut log = self.log.lock().unwrap();
            let texts = log.iter().filter(|s| matches!(s, Sent::Text(..))).count();
            if self.fail_after.is_some_and(|limit| texts >= limit) {
                return Err(anyhow::anyhow!("platform rejected message").into());
            }
            let OutboundResponse::Text(text) = response;
            log.push(Sent::Text(text, Instant::now()));
            Ok(())
        }

        async fn send_status(&self, _message: &InboundMessage, status: StatusUpdate) -> Result<()> {
            self.log.lock().unwrap().push(Sent::Status(status));
            Ok(())
        }

        async fn health_check(&self) -> Result<()> {
            Ok(())
        }
    }

    struct FixedAgent(std::result::Result<String, &'static str>);

    impl Agent for FixedAgent {
        async fn reply(&self, _turn: &Turn) -> Result<String> {
            match &self.0 {
                Ok(reply) => Ok(reply.clone()),
                Err(reason) => Err(LlmError::CompletionFailed(reason.to_string()).into()),
            }
        }
    }

    async fn channel(
        agent: FixedAgent,
        max_length: usize,
        fail_after: Option<usize>,
    ) -> (Channel<FixedAgent>, Arc<Mutex<Vec<Sent>>>) {
        let log = Arc::new(Mutex::new(Vec::new()));
        let messaging = Arc::new(MessagingManager::new());
        messaging
            .register(RecordingAdapter {
                max_length,
                fail_after,
                log: log.clone(),
            })
            .await;
        let runtime_config = Arc::new(RuntimeConfig::default());
        runtime_config
            .delivery
            .store(Arc::new(DeliveryConfig { pacing_ms: 300 }));
        (
            Channel::new(Arc::new(agent), messaging, runtime_config),
            log,
        )
    }

    fn turn(text: &str) -> Turn {
        let message = InboundMessage::text("test", "u1", text);
        Turn::combine(message.user_key(), vec![message])
    }

    fn texts(log: &[Sent]) -> Vec<String> {
        log.iter()
            .filter_map(|sent| match sent {
                Sent::Text(text, _) => Some(text.clone()),
                Sent::Status(_) => None,
            })
            .collect()
    }

    #[tokio::test(start_paused = true)]
    async fn delivers_paragraphs_with_pacing_after_thinking() {
        let (channel, log) = channel(FixedAgent(Ok("One.\n\nTwo.".into())), 5, None).await;

        tokio_test::assert_ok!(channel.handle(turn("hi")).await);

        let log = log.lock().unwrap();
        assert_eq!(log.first(), Some(&Sent::Status(StatusUpdate::Thinking)));
        assert_eq!(log.last(), Some(&Sent::Status(StatusUpdate::StopTyping)));
        assert_eq!(texts(&log), vec!["One.", "Two."]);

        let instants: Vec<Instant> = log
            .iter()
            .filter_map(|sent| match sent {
                Sent::Text(_, at) => Some(*at),
                Sent::Status(_) => None,
            })
            .collect();
        assert!(instants[1] - instants[0] >= Duration::from_millis(300));
    }

    #[tokio::test(start_paused = true)]
    async fn short_reply_is_sent_whole() {
        let (channel, log) = channel(FixedAgent(Ok("One.\n\nTwo.".into())), 4096, None).await;

        tokio_test::assert_ok!(channel.handle(turn("hi")).await);

        assert_eq!(texts(&log.lock().unwrap()), vec!["One.\n\nTwo."]);
    }

    #[tokio::test(start_paused = true)]
    async fn agent_failure_sends_one_apology() {
        let (channel, log) = channel(FixedAgent(Err("boom")), 4096, None).await;

        let result = channel.handle(turn("hi")).await;

        assert!(matches!(result, Err(Error::Llm(LlmError::CompletionFailed(_)))));
        assert_eq!(texts(&log.lock().unwrap()), vec![APOLOGY.to_string()]);
    }

    #[tokio::test(start_paused = true)]
    async fn blank_reply_is_not_delivered() {
        let (channel, log) = channel(FixedAgent(Ok(" \n\n ".into())), 4096, None).await;

        tokio_test::assert_ok!(channel.handle(turn("hi")).await);

        assert!(texts(&log.lock().unwrap()).is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn delivery_failure_stops_remaining_fragments() {
        let reply = "First.\n\nSecond.\n\nThird.";
        let (channel, log) = channel(FixedAgent(Ok(reply.into())), 8, Some(1)).await;

        let result = channel.handle(turn("hi")).await;

        assert!(matches!(
            result,
            Err(Error::Messaging(MessagingError::DeliveryFailed {
                delivered: 1,
                total: 3,
                ..
            }))
        ));
        assert_eq!(texts(&log.lock().unwrap()), vec!["First."]);
    }
}
