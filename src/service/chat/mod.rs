pub mod console;

use std::{ops::Deref, sync::Arc};

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::base::types::{Message, Void};

// Traits.

/// Generic "chat" trait that transports must implement.
///
/// A transport feeds incoming lines into the intake queue and delivers
/// replies back to participants. Implementing this trait allows different
/// chat services to be driven by the same orchestrator.
#[async_trait]
pub trait GenericChatClient: Send + Sync + 'static {
    /// A short name for logs.
    fn name(&self) -> &str;

    /// Start the chat client listener.
    ///
    /// Pushes every incoming message into `intake` until the transport closes
    /// or the receiving side goes away.
    async fn start(&self, intake: mpsc::Sender<Message>) -> Void;

    /// Deliver a reply to a participant.
    async fn send_message(&self, participant_id: &str, text: &str) -> Void;
}

// Structs.

/// Chat client for the application.
///
/// It is designed to be trivially cloneable, allowing it to be passed around
/// without the need for `Arc` or `Mutex`.
#[derive(Clone)]
pub struct ChatClient {
    inner: Arc<dyn GenericChatClient>,
}

impl Deref for ChatClient {
    type Target = dyn GenericChatClient;

    fn deref(&self) -> &Self::Target {
        &*self.inner
    }
}

impl ChatClient {
    pub fn new(inner: Arc<dyn GenericChatClient>) -> Self {
        Self { inner }
    }
}
