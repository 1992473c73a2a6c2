//! Line-oriented console transport.
//!
//! Each input line is `name: text`; replies are written as `@name reply`.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use tokio::{
    io::{self, AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt, BufReader},
    sync::{Mutex, mpsc},
};
use tracing::{debug, info, instrument, warn};

use crate::base::types::{Message, Void};

use super::{ChatClient, GenericChatClient};

type Input = Box<dyn AsyncBufRead + Send + Unpin>;
type Output = Box<dyn AsyncWrite + Send + Unpin>;

// Extra methods on `ChatClient` applied by the console implementation.

impl ChatClient {
    pub fn console() -> Self {
        Self::new(Arc::new(ConsoleChatClient::stdio()))
    }
}

// Specific implementations.

pub struct ConsoleChatClient {
    input: Mutex<Option<Input>>,
    output: Mutex<Output>,
}

impl ConsoleChatClient {
    pub fn new(input: impl AsyncBufRead + Send + Unpin + 'static, output: impl AsyncWrite + Send + Unpin + 'static) -> Self {
        Self {
            input: Mutex::new(Some(Box::new(input))),
            output: Mutex::new(Box::new(output)),
        }
    }

    pub fn stdio() -> Self {
        Self::new(BufReader::new(io::stdin()), io::stdout())
    }
}

/// Split a `name: text` line. Lines without a sender or text are ignored.
fn parse_line(line: &str) -> Option<(&str, &str)> {
    let (name, text) = line.split_once(':')?;
    let (name, text) = (name.trim(), text.trim());

    if name.is_empty() || name.contains(char::is_whitespace) || text.is_empty() {
        return None;
    }

    Some((name, text))
}

#[async_trait]
impl GenericChatClient for ConsoleChatClient {
    fn name(&self) -> &str {
        "console"
    }

    #[instrument(name = "ConsoleChatClient::start", skip_all)]
    async fn start(&self, intake: mpsc::Sender<Message>) -> Void {
        let Some(input) = self.input.lock().await.take() else {
            anyhow::bail!("Console transport was already started");
        };

        info!("Reading `name: text` lines from the console ...");

        let mut lines = input.lines();
        while let Some(line) = lines.next_line().await? {
            let Some((name, text)) = parse_line(&line) else {
                if !line.trim().is_empty() {
                    warn!("Ignoring line without a `name: text` shape: {line:?}");
                }
                continue;
            };

            if intake.send(Message::new(name, text, Utc::now())).await.is_err() {
                debug!("Intake closed, stopping console reader");
                break;
            }
        }

        info!("Console input closed");

        Ok(())
    }

    async fn send_message(&self, participant_id: &str, text: &str) -> Void {
        let mut output = self.output.lock().await;

        output.write_all(format!("@{participant_id} {text}\n").as_bytes()).await?;
        output.flush().await?;

        Ok(())
    }
}
