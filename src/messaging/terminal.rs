//! Terminal adapter: one local user chatting over stdin/stdout.

use crate::config::TerminalConfig;
use crate::error::Result;
use crate::messaging::traits::{InboundStream, Messaging};
use crate::{InboundMessage, OutboundResponse, StatusUpdate};

use anyhow::Context as _;
use std::sync::Arc;
use tokio::io::{AsyncBufRead, AsyncBufReadExt as _, AsyncWrite, AsyncWriteExt as _};
use tokio::sync::{Mutex, mpsc};

type Input = Box<dyn AsyncBufRead + Send + Unpin>;
type Output = Box<dyn AsyncWrite + Send + Unpin>;

const SENDER_ID: &str = "local";

/// Reads user lines from an input and prints replies as `Name: text`.
///
/// `exit` or `quit` (any case) or end of input ends the inbound stream.
pub struct TerminalAdapter {
    agent_name: String,
    max_message_length: usize,
    input: std::sync::Mutex<Option<Input>>,
    output: Arc<Mutex<Output>>,
}

impl TerminalAdapter {
    /// Adapter over the process's stdin and stdout.
    pub fn new(config: &TerminalConfig, agent_name: impl Into<String>) -> Self {
        Self::with_io(
            config,
            agent_name,
            Box::new(tokio::io::BufReader::new(tokio::io::stdin())),
            Box::new(tokio::io::stdout()),
        )
    }

    pub fn with_io(
        config: &TerminalConfig,
        agent_name: impl Into<String>,
        input: Input,
        output: Output,
    ) -> Self {
        Self {
            agent_name: agent_name.into(),
            max_message_length: config.max_message_length,
            input: std::sync::Mutex::new(Some(input)),
            output: Arc::new(Mutex::new(output)),
        }
    }

    /// Print the greeting line.
    pub async fn greet(&self, greeting: &str) -> Result<()> {
        self.write_line(&format!("{}: {greeting}", self.agent_name))
            .await
    }

    async fn write_line(&self, line: &str) -> Result<()> {
        let mut output = self.output.lock().await;
        output.write_all(line.as_bytes()).await?;
        output.write_all(b"\n").await?;
        output.flush().await?;
        Ok(())
    }
}

impl Messaging for TerminalAdapter {
    fn name(&self) -> &str {
        "terminal"
    }

    async fn start(&self) -> Result<InboundStream> {
        let mut input = self
            .input
            .lock()
            .map_err(|_| anyhow::anyhow!("terminal input lock poisoned"))?
            .take()
            .context("terminal adapter already started")?;

        let (inbound_tx, inbound_rx) = mpsc::channel(64);

        tokio::spawn(async move {
            let mut line = String::new();
            loop {
                line.clear();
                match input.read_line(&mut line).await {
                    Ok(0) => break,
                    Ok(_) => {}
                    Err(error) => {
                        tracing::warn!(%error, "failed to read terminal input");
                        break;
                    }
                }

                let text = line.trim();
                if text.is_empty() {
                    continue;
                }
                if text.eq_ignore_ascii_case("exit") || text.eq_ignore_ascii_case("quit") {
                    break;
                }

                let message = InboundMessage::text("terminal", SENDER_ID, text);
                if inbound_tx.send(message).await.is_err() {
                    break;
                }
            }
            tracing::info!("terminal input closed");
        });

        Ok(Box::pin(tokio_stream::wrappers::ReceiverStream::new(
            inbound_rx,
        )))
    }

    fn max_message_length(&self) -> usize {
        self.max_message_length
    }

    async fn respond(&self, _message: &InboundMessage, response: OutboundResponse) -> Result<()> {
        match response {
            OutboundResponse::Text(text) => {
                self.write_line(&format!("{}: {text}", self.agent_name))
                    .await
            }
        }
    }

    async fn send_status(&self, _message: &InboundMessage, status: StatusUpdate) -> Result<()> {
        if status == StatusUpdate::Thinking {
            tracing::debug!("thinking");
        }
        Ok(())
    }

    async fn health_check(&self) -> Result<()> {
        Ok(())
    }
}
