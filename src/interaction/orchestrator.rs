//! Per-message turn handling.
//!
//! A turn moves through `Received → Filtered | Addressed → ContextLoaded →
//! Requesting → Responded → Persisted → Delivered`, ending early in `Failed`
//! or `Cancelled`. [`ConversationOrchestrator::dispatch`] feeds turns into one
//! queue per participant so that a participant's replies come back in the
//! order their messages arrived, while different participants proceed
//! concurrently.

use std::{
    collections::HashMap,
    sync::{Arc, Mutex, PoisonError},
    time::Duration,
};

use chrono::Utc;
use tokio::{sync::mpsc, time::timeout};
use tokio_util::{sync::CancellationToken, task::TaskTracker};
use tracing::Instrument;

use crate::{
    base::events::{ErrorKind, EventBus, EventKind},
    interaction::{mention::MentionMatcher, prompt},
    prelude::*,
    service::{
        chat::ChatClient,
        llm::{CompletionOptions, LlmClient},
        store::{ConversationStore, normalize_participant},
    },
};

/// How a single turn ended.
#[derive(Debug, Clone, PartialEq)]
pub enum TurnOutcome {
    /// Not addressed to the bot.
    Filtered,
    /// Addressed, but nothing left to ask once the name was stripped.
    Empty,
    /// A reply was produced and persisted; `delivered` is false if the transport failed.
    Replied { reply: String, delivered: bool },
    /// The completion failed; no reply was sent.
    Failed { kind: ErrorKind },
    /// Shutdown interrupted the turn before a reply arrived.
    Cancelled,
}

/// Drives mention detection, history, prompt assembly and the completion
/// round-trip for each incoming message.
///
/// This is trivially cloneable and can be passed around without the need for `Arc` or `Mutex`.
#[derive(Clone)]
pub struct ConversationOrchestrator {
    inner: Arc<OrchestratorInner>,
}

struct OrchestratorInner {
    matcher: MentionMatcher,
    store: ConversationStore,
    llm: LlmClient,
    chat: ChatClient,
    events: EventBus,
    system_prompt: String,
    options: CompletionOptions,
    worker_idle: Duration,
    cancel: CancellationToken,
    tracker: TaskTracker,
    workers: Mutex<HashMap<String, mpsc::UnboundedSender<Message>>>,
}

impl ConversationOrchestrator {
    pub fn new(config: &Config, store: ConversationStore, llm: LlmClient, chat: ChatClient, events: EventBus) -> Res<Self> {
        let matcher = MentionMatcher::from_config(config)?;

        Ok(Self {
            inner: Arc::new(OrchestratorInner {
                matcher,
                store,
                llm,
                chat,
                events,
                system_prompt: config.system_prompt(),
                options: CompletionOptions::from_config(config),
                worker_idle: config.worker_idle,
                cancel: CancellationToken::new(),
                tracker: TaskTracker::new(),
                workers: Mutex::new(HashMap::new()),
            }),
        })
    }

    /// Run one turn to completion.
    #[instrument(name = "ConversationOrchestrator::handle", skip_all, fields(participant = %message.participant_id))]
    pub async fn handle(&self, message: Message) -> TurnOutcome {
        let inner = &self.inner;
        let participant = message.participant_id.as_str();

        // Classify.

        let detection = inner.matcher.detect(&message.text);
        let Some(kind) = detection.kind else {
            debug!("Message not addressed to the bot");
            return TurnOutcome::Filtered;
        };

        inner.events.emit(Some(participant), EventKind::MentionDetected { kind });

        let question = detection.residual_text;
        if question.is_empty() {
            warn!("Addressed without a question, nothing to ask");
            return TurnOutcome::Empty;
        }

        if inner.cancel.is_cancelled() {
            return TurnOutcome::Cancelled;
        }

        // Load context.

        let now = Utc::now().max(message.timestamp);
        let history = inner.store.read(participant, now).await;
        inner.events.emit(Some(participant), EventKind::HistoryLoaded { count: history.len() });

        let context = prompt::build(&inner.system_prompt, history, &question);

        // Request.

        inner.events.emit(
            Some(participant),
            EventKind::RequestSent {
                model: inner.options.model.clone(),
                message_count: context.message_count(),
            },
        );

        let result = tokio::select! {
            biased;
            _ = inner.cancel.cancelled() => {
                info!("Turn cancelled while waiting for a completion");
                return TurnOutcome::Cancelled;
            }
            result = inner.llm.complete(&context, &inner.options) => result,
        };

        let completion = match result {
            Ok(completion) => completion,
            Err(err) => {
                error!("Completion failed: {err}");

                self.remember(participant, HistoryRole::User, &question, now).await;
                inner.events.emit(
                    Some(participant),
                    EventKind::Error {
                        kind: err.kind(),
                        detail: err.to_string(),
                    },
                );

                return TurnOutcome::Failed { kind: err.kind() };
            }
        };

        inner.events.emit(
            Some(participant),
            EventKind::ResponseReceived {
                tokens: completion.tokens_used,
                latency: completion.latency,
                cost: completion.cost_estimate,
            },
        );

        // Persist, then deliver.

        self.remember(participant, HistoryRole::User, &question, now).await;
        self.remember(participant, HistoryRole::Assistant, &completion.text, Utc::now().max(now)).await;

        let delivered = match inner.chat.send_message(participant, &completion.text).await {
            Ok(()) => true,
            Err(err) => {
                error!("Failed to deliver reply: {err}");
                inner.events.emit(
                    Some(participant),
                    EventKind::Error {
                        kind: ErrorKind::Delivery,
                        detail: err.to_string(),
                    },
                );
                false
            }
        };

        TurnOutcome::Replied {
            reply: completion.text,
            delivered,
        }
    }

    /// Best-effort append; the store reports its own failures.
    async fn remember(&self, participant: &str, role: HistoryRole, content: &str, at: chrono::DateTime<Utc>) {
        if let Err(err) = self.inner.store.append(participant, role, content, at).await {
            warn!("Continuing without persisting the {role:?} entry: {err}");
        }
    }

    /// Queue a message behind any earlier ones from the same participant.
    ///
    /// Returns immediately; the turn runs on that participant's worker task.
    pub fn dispatch(&self, message: Message) {
        if self.inner.cancel.is_cancelled() {
            debug!("Dropping message received after shutdown");
            return;
        }

        let key = normalize_participant(&message.participant_id);
        let mut workers = self.inner.workers.lock().unwrap_or_else(PoisonError::into_inner);

        let message = match workers.get(&key) {
            Some(sender) => match sender.send(message) {
                Ok(()) => return,
                Err(mpsc::error::SendError(message)) => message,
            },
            None => message,
        };

        let (sender, receiver) = mpsc::unbounded_channel();
        let _ = sender.send(message);
        workers.insert(key.clone(), sender);

        let this = self.clone();
        self.inner.tracker.spawn(async move { this.run_worker(key, receiver).in_current_span().await });
    }

    #[instrument(name = "ConversationOrchestrator::worker", skip(self, receiver))]
    async fn run_worker(&self, key: String, mut receiver: mpsc::UnboundedReceiver<Message>) {
        debug!("Worker started");

        loop {
            let next = tokio::select! {
                biased;
                _ = self.inner.cancel.cancelled() => None,
                next = timeout(self.inner.worker_idle, receiver.recv()) => match next {
                    Ok(next) => next,
                    Err(_) => self.retire_if_idle(&key, &mut receiver),
                },
            };

            let Some(message) = next else {
                break;
            };

            let outcome = self.handle(message).await;
            debug!("Turn finished: {outcome:?}");
        }

        debug!("Worker stopped");
    }

    /// Deregister an idle worker, unless a message slipped in meanwhile.
    fn retire_if_idle(&self, key: &str, receiver: &mut mpsc::UnboundedReceiver<Message>) -> Option<Message> {
        let mut workers = self.inner.workers.lock().unwrap_or_else(PoisonError::into_inner);

        match receiver.try_recv() {
            Ok(message) => Some(message),
            Err(_) => {
                workers.remove(key);
                None
            }
        }
    }

    /// Number of participants with a live worker.
    pub fn active_workers(&self) -> usize {
        self.inner.workers.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    /// Stop accepting work and wait for every queued turn to finish.
    pub async fn drain(&self) {
        self.inner.workers.lock().unwrap_or_else(PoisonError::into_inner).clear();
        self.inner.tracker.close();
        self.inner.tracker.wait().await;
    }

    /// Cancel in-flight turns, drop queued ones, and wait for workers to stop.
    pub async fn shutdown(&self) {
        info!("Shutting down orchestrator ...");

        self.inner.cancel.cancel();
        self.drain().await;
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};

    use async_trait::async_trait;
    use mockall::mock;

    use super::*;
    use crate::{
        base::{config::ConfigInner, events::Event},
        service::{
            chat::GenericChatClient,
            llm::{CompletionError, CompletionRequest, GenericLlmClient, RawCompletion, RetryPolicy},
            store::{GenericConversationBackend, StoreError, StoreSettings},
        },
    };

    mock! {
        pub Llm {}

        #[async_trait]
        impl GenericLlmClient for Llm {
            async fn execute(&self, request: &CompletionRequest) -> Result<RawCompletion, CompletionError>;
            async fn validate_credential(&self, key: &str) -> bool;
        }
    }

    mock! {
        pub Chat {}

        #[async_trait]
        impl GenericChatClient for Chat {
            fn name(&self) -> &str;
            async fn start(&self, intake: mpsc::Sender<Message>) -> Void;
            async fn send_message(&self, participant_id: &str, text: &str) -> Void;
        }
    }

    /// Echoes the question back after a short delay.
    struct EchoLlm {
        delay: Duration,
    }

    #[async_trait]
    impl GenericLlmClient for EchoLlm {
        async fn execute(&self, request: &CompletionRequest) -> Result<RawCompletion, CompletionError> {
            tokio::time::sleep(self.delay).await;

            let question = request.messages.last().map(|m| m.content.clone()).unwrap_or_default();
            Ok(RawCompletion {
                text: format!("re: {question}"),
                tokens_used: 1,
            })
        }

        async fn validate_credential(&self, _key: &str) -> bool {
            true
        }
    }

    /// Forwards every delivered reply to a channel.
    struct RecordingChat {
        sent: mpsc::UnboundedSender<(String, String)>,
    }

    #[async_trait]
    impl GenericChatClient for RecordingChat {
        fn name(&self) -> &str {
            "recording"
        }

        async fn start(&self, _intake: mpsc::Sender<Message>) -> Void {
            Ok(())
        }

        async fn send_message(&self, participant_id: &str, text: &str) -> Void {
            self.sent.send((participant_id.to_string(), text.to_string()))?;
            Ok(())
        }
    }

    fn config(worker_idle: Duration) -> Config {
        Config::from(ConfigInner {
            api_key: "test-key".to_string(),
            worker_idle,
            ..Default::default()
        })
    }

    fn policy() -> RetryPolicy {
        RetryPolicy {
            request_timeout: Duration::from_secs(5),
            max_transient_attempts: 2,
            backoff: Duration::from_millis(1),
            rate_limit_cooldown: Duration::from_millis(1),
        }
    }

    fn orchestrator(llm: Arc<dyn GenericLlmClient>, chat: Arc<dyn GenericChatClient>, worker_idle: Duration) -> (ConversationOrchestrator, ConversationStore, EventBus) {
        let config = config(worker_idle);
        let events = EventBus::new(256);
        let store = ConversationStore::memory(StoreSettings::from_config(&config), events.clone());
        let llm = LlmClient::new(llm, policy(), config.cost_per_1k_tokens, events.clone());

        let orchestrator = ConversationOrchestrator::new(&config, store.clone(), llm, ChatClient::new(chat), events.clone()).unwrap();

        (orchestrator, store, events)
    }

    fn message(participant: &str, text: &str) -> Message {
        Message::new(participant, text, Utc::now())
    }

    fn drain(receiver: &mut tokio::sync::broadcast::Receiver<Event>) -> Vec<EventKind> {
        let mut kinds = Vec::new();
        while let Ok(event) = receiver.try_recv() {
            kinds.push(event.kind);
        }
        kinds
    }

    #[tokio::test]
    async fn test_unaddressed_message_is_filtered() {
        let (orchestrator, store, events) = orchestrator(Arc::new(MockLlm::new()), Arc::new(MockChat::new()), Duration::from_secs(60));
        let mut receiver = events.subscribe();

        let outcome = orchestrator.handle(message("alice", "anyone seen my keys?")).await;

        assert_eq!(outcome, TurnOutcome::Filtered);
        assert_eq!(store.message_count("alice").await, 0);
        assert!(drain(&mut receiver).is_empty());
    }

    #[tokio::test]
    async fn test_bare_mention_sends_nothing() {
        let (orchestrator, store, _) = orchestrator(Arc::new(MockLlm::new()), Arc::new(MockChat::new()), Duration::from_secs(60));

        assert_eq!(orchestrator.handle(message("alice", "@Eugen")).await, TurnOutcome::Empty);
        assert_eq!(store.message_count("alice").await, 0);
    }

    #[tokio::test]
    async fn test_successful_turn_persists_then_delivers() {
        let mut llm = MockLlm::new();
        llm.expect_execute()
            .withf(|r: &CompletionRequest| r.messages.len() == 2 && r.messages[1].content == "what's the weather?")
            .times(1)
            .returning(|_| {
                Ok(RawCompletion {
                    text: "Sunny.".to_string(),
                    tokens_used: 12,
                })
            });

        let mut chat = MockChat::new();
        chat.expect_send_message().withf(|p: &str, t: &str| p == "alice" && t == "Sunny.").times(1).returning(|_, _| Ok(()));

        let (orchestrator, store, events) = orchestrator(Arc::new(llm), Arc::new(chat), Duration::from_secs(60));
        let mut receiver = events.subscribe();

        let outcome = orchestrator.handle(message("alice", "@Eugen what's the weather?")).await;

        assert_eq!(
            outcome,
            TurnOutcome::Replied {
                reply: "Sunny.".to_string(),
                delivered: true,
            }
        );

        let history = store.read("alice", Utc::now()).await;
        assert_eq!(history.len(), 2);
        assert_eq!((history[0].role, history[0].content.as_str()), (HistoryRole::User, "what's the weather?"));
        assert_eq!((history[1].role, history[1].content.as_str()), (HistoryRole::Assistant, "Sunny."));
        assert!(history[0].timestamp <= history[1].timestamp);

        let kinds = drain(&mut receiver);
        assert!(matches!(kinds[0], EventKind::MentionDetected { .. }));
        assert_eq!(kinds[1], EventKind::HistoryLoaded { count: 0 });
        assert!(matches!(kinds[2], EventKind::RequestSent { message_count: 2, .. }));
        assert!(matches!(kinds[3], EventKind::ApiCall(_)));
        assert!(matches!(kinds[4], EventKind::ResponseReceived { tokens: 12, .. }));
    }

    #[tokio::test]
    async fn test_second_turn_sees_first_exchange() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let recorded = seen.clone();

        let mut llm = MockLlm::new();
        llm.expect_execute().times(2).returning(move |r| {
            recorded.lock().unwrap().push(r.messages.iter().map(|m| m.content.clone()).collect::<Vec<_>>());
            Ok(RawCompletion {
                text: "noted".to_string(),
                tokens_used: 1,
            })
        });

        let mut chat = MockChat::new();
        chat.expect_send_message().times(2).returning(|_, _| Ok(()));

        let (orchestrator, _, _) = orchestrator(Arc::new(llm), Arc::new(chat), Duration::from_secs(60));

        orchestrator.handle(message("alice", "Eugen, my printer is a Prusa")).await;
        orchestrator.handle(message("alice", "@Eugen which nozzle should I use?")).await;

        let seen = seen.lock().unwrap();
        assert_eq!(seen[1][1..], ["my printer is a Prusa", "noted", "which nozzle should I use?"]);
    }

    #[tokio::test]
    async fn test_auth_failure_keeps_question_without_reply() {
        let mut llm = MockLlm::new();
        llm.expect_execute().times(1).returning(|_| Err(CompletionError::Auth("invalid key".to_string())));

        // No `send_message` expectation: any delivery attempt fails the test.
        let (orchestrator, store, events) = orchestrator(Arc::new(llm), Arc::new(MockChat::new()), Duration::from_secs(60));
        let mut receiver = events.subscribe();

        let outcome = orchestrator.handle(message("alice", "@Eugen hello there")).await;

        assert_eq!(outcome, TurnOutcome::Failed { kind: ErrorKind::Auth });

        let history = store.read("alice", Utc::now()).await;
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].role, HistoryRole::User);

        assert!(
            drain(&mut receiver)
                .iter()
                .any(|kind| matches!(kind, EventKind::Error { kind: ErrorKind::Auth, .. }))
        );
    }

    #[tokio::test]
    async fn test_delivery_failure_is_reported_but_remembered() {
        let mut llm = MockLlm::new();
        llm.expect_execute().returning(|_| {
            Ok(RawCompletion {
                text: "pong".to_string(),
                tokens_used: 1,
            })
        });

        let mut chat = MockChat::new();
        chat.expect_send_message().times(1).returning(|_, _| Err(anyhow::anyhow!("socket closed")));

        let (orchestrator, store, events) = orchestrator(Arc::new(llm), Arc::new(chat), Duration::from_secs(60));
        let mut receiver = events.subscribe();

        let outcome = orchestrator.handle(message("bob", "ping Eugen")).await;

        assert_eq!(
            outcome,
            TurnOutcome::Replied {
                reply: "pong".to_string(),
                delivered: false,
            }
        );
        assert_eq!(store.message_count("bob").await, 2);
        assert!(
            drain(&mut receiver)
                .iter()
                .any(|kind| matches!(kind, EventKind::Error { kind: ErrorKind::Delivery, .. }))
        );
    }

    /// A backend with no history that cannot write.
    struct ReadOnlyBackend;

    #[async_trait]
    impl GenericConversationBackend for ReadOnlyBackend {
        async fn load(&self, _key: &str) -> Result<Vec<crate::base::types::HistoryEntry>, StoreError> {
            Ok(Vec::new())
        }

        async fn save(&self, _key: &str, _entries: &[crate::base::types::HistoryEntry]) -> Result<(), StoreError> {
            Err(std::io::Error::other("disk full").into())
        }

        async fn remove(&self, _key: &str) -> Result<(), StoreError> {
            Ok(())
        }

        async fn keys(&self) -> Result<Vec<String>, StoreError> {
            Ok(Vec::new())
        }
    }

    #[tokio::test]
    async fn test_failed_persistence_still_delivers_reply() {
        let mut llm = MockLlm::new();
        llm.expect_execute().times(1).returning(|_| {
            Ok(RawCompletion {
                text: "still here".to_string(),
                tokens_used: 3,
            })
        });

        let mut chat = MockChat::new();
        chat.expect_send_message().withf(|p: &str, t: &str| p == "alice" && t == "still here").times(1).returning(|_, _| Ok(()));

        let config = config(Duration::from_secs(60));
        let events = EventBus::new(256);
        let mut receiver = events.subscribe();
        let store = ConversationStore::new(Arc::new(ReadOnlyBackend), StoreSettings::from_config(&config), events.clone());
        let llm = LlmClient::new(Arc::new(llm), policy(), config.cost_per_1k_tokens, events.clone());
        let orchestrator = ConversationOrchestrator::new(&config, store, llm, ChatClient::new(Arc::new(chat)), events).unwrap();

        let outcome = orchestrator.handle(message("alice", "@Eugen are you there?")).await;

        assert_eq!(
            outcome,
            TurnOutcome::Replied {
                reply: "still here".to_string(),
                delivered: true,
            }
        );
        assert!(
            drain(&mut receiver)
                .iter()
                .any(|kind| matches!(kind, EventKind::Error { kind: ErrorKind::Storage, .. }))
        );
    }

    #[tokio::test]
    async fn test_shutdown_cancels_in_flight_turn() {
        let (sent, _received) = mpsc::unbounded_channel();
        let (orchestrator, store, _) = orchestrator(Arc::new(EchoLlm { delay: Duration::from_secs(10) }), Arc::new(RecordingChat { sent }), Duration::from_secs(60));

        let turn = tokio::spawn({
            let orchestrator = orchestrator.clone();
            async move { orchestrator.handle(message("alice", "@Eugen take your time")).await }
        });

        tokio::time::sleep(Duration::from_millis(50)).await;
        orchestrator.shutdown().await;

        assert_eq!(turn.await.unwrap(), TurnOutcome::Cancelled);
        assert_eq!(store.message_count("alice").await, 0);
    }

    #[tokio::test]
    async fn test_dispatch_preserves_per_participant_order() {
        let (sent, mut received) = mpsc::unbounded_channel();
        let (orchestrator, store, _) = orchestrator(Arc::new(EchoLlm { delay: Duration::from_millis(5) }), Arc::new(RecordingChat { sent }), Duration::from_secs(60));

        for i in 0..5 {
            orchestrator.dispatch(message("alice", &format!("@Eugen question {i}")));
            orchestrator.dispatch(message("bob", &format!("@Eugen other {i}")));
        }

        let mut alice = Vec::new();
        let mut bob = Vec::new();
        for _ in 0..10 {
            let (participant, text) = timeout(Duration::from_secs(5), received.recv()).await.unwrap().unwrap();
            match participant.as_str() {
                "alice" => alice.push(text),
                _ => bob.push(text),
            }
        }

        assert_eq!(alice, (0..5).map(|i| format!("re: question {i}")).collect::<Vec<_>>());
        assert_eq!(bob, (0..5).map(|i| format!("re: other {i}")).collect::<Vec<_>>());
        assert_eq!(store.message_count("alice").await, 10);

        orchestrator.shutdown().await;
        assert_eq!(orchestrator.active_workers(), 0);
    }

    #[tokio::test]
    async fn test_idle_workers_retire_and_respawn() {
        let (sent, mut received) = mpsc::unbounded_channel();
        let (orchestrator, _, _) = orchestrator(Arc::new(EchoLlm { delay: Duration::ZERO }), Arc::new(RecordingChat { sent }), Duration::from_millis(20));

        orchestrator.dispatch(message("alice", "@Eugen first"));
        timeout(Duration::from_secs(5), received.recv()).await.unwrap().unwrap();

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(orchestrator.active_workers(), 0);

        orchestrator.dispatch(message("alice", "@Eugen second"));
        let (_, text) = timeout(Duration::from_secs(5), received.recv()).await.unwrap().unwrap();
        assert_eq!(text, "re: second");
    }

    #[tokio::test]
    async fn test_drain_finishes_queued_turns() {
        let (sent, mut received) = mpsc::unbounded_channel();
        let (orchestrator, store, _) = orchestrator(Arc::new(EchoLlm { delay: Duration::from_millis(5) }), Arc::new(RecordingChat { sent }), Duration::from_secs(60));

        for i in 0..3 {
            orchestrator.dispatch(message("carol", &format!("@Eugen step {i}")));
        }
        orchestrator.drain().await;

        assert_eq!(store.message_count("carol").await, 6);
        assert_eq!(orchestrator.active_workers(), 0);
        for i in 0..3 {
            assert_eq!(received.try_recv().unwrap().1, format!("re: step {i}"));
        }
    }

    #[tokio::test]
    async fn test_dispatch_after_shutdown_is_dropped() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();

        let mut llm = MockLlm::new();
        llm.expect_execute().returning(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(RawCompletion {
                text: "late".to_string(),
                tokens_used: 1,
            })
        });

        let (orchestrator, _, _) = orchestrator(Arc::new(llm), Arc::new(MockChat::new()), Duration::from_secs(60));

        orchestrator.shutdown().await;
        orchestrator.dispatch(message("alice", "@Eugen too late"));
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert_eq!(orchestrator.active_workers(), 0);
    }
}
