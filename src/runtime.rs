//! Runtime services and shared state for relay-bot.

use tokio::sync::mpsc;
use tracing::{Instrument, error, info, instrument};

use crate::{
    base::{
        config::Config,
        events::{EventBus, log_events},
        types::{Res, Void},
    },
    interaction::orchestrator::ConversationOrchestrator,
    service::{
        chat::ChatClient,
        llm::LlmClient,
        store::{ConversationStore, StoreSettings},
    },
};

const INTAKE_CAPACITY: usize = 64;

/// Startup switches that are not part of the configuration file.
#[derive(Debug, Clone, Copy, Default)]
pub struct RuntimeOptions {
    /// Keep conversations in memory instead of on disk.
    pub ephemeral: bool,
}

/// Runtime service context that can be shared across the application.
///
/// This struct holds the configuration, the event bus, every service client,
/// and the orchestrator wired to them. It is designed to be trivially
/// cloneable, allowing it to be passed around without the need for `Arc` or
/// `Mutex`.
#[derive(Clone)]
pub struct Runtime {
    /// The configuration for the application.
    pub config: Config,
    /// Pipeline events.
    pub events: EventBus,
    /// Per-participant conversation history.
    pub store: ConversationStore,
    /// The LLM client instance.
    pub llm: LlmClient,
    /// The chat transport.
    pub chat: ChatClient,
    /// Turn handling.
    pub orchestrator: ConversationOrchestrator,
}

impl Runtime {
    /// Create a runtime with the HTTP model client and the console transport.
    #[instrument(skip_all)]
    pub fn new(config: Config, options: RuntimeOptions) -> Res<Self> {
        let events = EventBus::new(config.event_capacity);

        // Initialize the store.
        let store = if options.ephemeral {
            info!("Keeping conversations in memory only");
            ConversationStore::memory(StoreSettings::from_config(&config), events.clone())
        } else {
            info!("Persisting conversations under `{}`", config.data_dir.display());
            ConversationStore::file(&config, events.clone())
        };

        // Initialize the LLM client.
        let llm = LlmClient::http(&config, events.clone())?;

        // Initialize the chat client.
        let chat = ChatClient::console();

        Self::with_services(config, events, store, llm, chat)
    }

    /// Create a runtime around already-constructed services.
    pub fn with_services(config: Config, events: EventBus, store: ConversationStore, llm: LlmClient, chat: ChatClient) -> Res<Self> {
        let orchestrator = ConversationOrchestrator::new(&config, store.clone(), llm.clone(), chat.clone(), events.clone())?;

        Ok(Self {
            config,
            events,
            store,
            llm,
            chat,
            orchestrator,
        })
    }

    /// Feed transport messages to the orchestrator until the transport closes
    /// (queued turns finish) or Ctrl-C arrives (in-flight turns are cancelled).
    pub async fn start(&self) -> Void {
        tokio::spawn(log_events(self.events.subscribe()));

        let (intake, mut messages) = mpsc::channel(INTAKE_CAPACITY);

        let chat = self.chat.clone();
        let transport = tokio::spawn(
            async move {
                if let Err(err) = chat.start(intake).await {
                    error!("Chat transport `{}` stopped with an error: {err}", chat.name());
                }
            }
            .in_current_span(),
        );

        info!("Listening on `{}` as `{}` ...", self.chat.name(), self.config.bot_name);

        loop {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {
                    info!("Interrupted");
                    transport.abort();
                    self.orchestrator.shutdown().await;
                    break;
                }
                next = messages.recv() => match next {
                    Some(message) => self.orchestrator.dispatch(message),
                    None => {
                        info!("Transport closed, finishing queued turns ...");
                        self.orchestrator.drain().await;
                        break;
                    }
                },
            }
        }

        let stats = self.llm.statistics();
        info!(
            "Session totals: {} requests, {} tokens, {} errors, {:.1}% success, ${:.4} estimated",
            stats.total_requests,
            stats.total_tokens,
            stats.total_errors,
            stats.success_rate(),
            stats.estimated_cost
        );

        Ok(())
    }
}
