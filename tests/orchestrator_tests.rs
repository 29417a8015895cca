use async_trait::async_trait;
use futures_util::stream;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use multillama::client_wrapper::{
    ChunkMode, ClientError, ClientWrapper, Message, MessageChunk, MessageChunkStream, ModelInfo,
    Role,
};
use multillama::config::OrchestratorConfig;
use multillama::host_registry::{HostStatus, DEFAULT_HOST_ID};
use multillama::orchestrator::{
    Orchestrator, OrchestratorError, ProcessOutcome, SubmitOutcome, SubmitRequest,
};
use multillama::participant::{ModelRef, ParticipantKey};
use multillama::prompt::Attachment;

/// Backend double: scripted replies per model, a set of failing models, recorded calls.
#[derive(Default)]
struct ScriptedClient {
    replies: HashMap<String, String>,
    failing: HashSet<String>,
    chunks: Option<Vec<&'static str>>,
    break_stream: bool,
    chunk_mode: ChunkMode,
    catalog: Vec<String>,
    calls: Mutex<Vec<(String, Vec<Message>)>>,
}

impl ScriptedClient {
    fn new() -> Self {
        Self::default()
    }

    fn reply(mut self, model: &str, content: &str) -> Self {
        self.replies.insert(model.to_string(), content.to_string());
        self
    }

    fn failing(mut self, model: &str) -> Self {
        self.failing.insert(model.to_string());
        self
    }

    fn streaming(mut self, chunks: Vec<&'static str>) -> Self {
        self.chunks = Some(chunks);
        self
    }

    /// End the stream with a network error after the scripted chunks.
    fn breaking_stream(mut self) -> Self {
        self.break_stream = true;
        self
    }

    fn cumulative(mut self) -> Self {
        self.chunk_mode = ChunkMode::Cumulative;
        self
    }

    fn serving(mut self, models: &[&str]) -> Self {
        self.catalog = models.iter().map(|m| m.to_string()).collect();
        self
    }

    fn calls(&self) -> Vec<(String, Vec<Message>)> {
        self.calls.lock().unwrap().clone()
    }

    fn called_models(&self) -> Vec<String> {
        let mut models: Vec<String> = self.calls().into_iter().map(|(m, _)| m).collect();
        models.sort();
        models
    }
}

#[async_trait]
impl ClientWrapper for ScriptedClient {
    async fn list_models(&self, base_url: &str) -> Result<Vec<ModelInfo>, ClientError> {
        if self.catalog.is_empty() {
            return Err(ClientError::Network {
                host: base_url.to_string(),
                detail: "connection refused".to_string(),
            });
        }
        Ok(self
            .catalog
            .iter()
            .map(|name| ModelInfo {
                name: name.clone(),
                ..ModelInfo::default()
            })
            .collect())
    }

    async fn send_message(
        &self,
        base_url: &str,
        model: &str,
        messages: &[Message],
    ) -> Result<Message, ClientError> {
        self.calls
            .lock()
            .unwrap()
            .push((model.to_string(), messages.to_vec()));
        if self.failing.contains(model) {
            return Err(ClientError::Status {
                host: base_url.to_string(),
                status: 500,
                detail: "model crashed".to_string(),
            });
        }
        let content = self
            .replies
            .get(model)
            .cloned()
            .unwrap_or_else(|| format!("reply from {}", model));
        Ok(Message::assistant(content))
    }

    async fn send_message_stream(
        &self,
        base_url: &str,
        model: &str,
        messages: &[Message],
    ) -> Result<MessageChunkStream, ClientError> {
        let Some(chunks) = &self.chunks else {
            return Err(ClientError::Unsupported("streaming".to_string()));
        };
        self.calls
            .lock()
            .unwrap()
            .push((model.to_string(), messages.to_vec()));
        let last = chunks.len().saturating_sub(1);
        let mut items: Vec<Result<MessageChunk, ClientError>> = chunks
            .iter()
            .enumerate()
            .map(|(i, c)| {
                Ok(MessageChunk {
                    content: c.to_string(),
                    is_final: i == last && !self.break_stream,
                })
            })
            .collect();
        if self.break_stream {
            items.push(Err(ClientError::Network {
                host: base_url.to_string(),
                detail: "connection reset".to_string(),
            }));
        }
        Ok(Box::pin(stream::iter(items)))
    }

    fn chunk_mode(&self) -> ChunkMode {
        self.chunk_mode
    }
}

fn manual_config() -> OrchestratorConfig {
    OrchestratorConfig {
        auto_drain: false,
        inter_turn_delay: Duration::from_millis(0),
        ..OrchestratorConfig::default()
    }
}

fn setup(client: ScriptedClient, models: &[&str]) -> (Arc<ScriptedClient>, Orchestrator, Vec<ParticipantKey>) {
    let client = Arc::new(client);
    let orchestrator = Orchestrator::builder(client.clone())
        .config(manual_config())
        .build();
    let keys = models
        .iter()
        .map(|m| {
            orchestrator
                .add_participant(ModelRef::new(DEFAULT_HOST_ID, *m))
                .unwrap()
        })
        .collect();
    (client, orchestrator, keys)
}

async fn send(orchestrator: &Orchestrator, request: SubmitRequest) -> ProcessOutcome {
    let outcome = orchestrator.submit(request).await.unwrap();
    assert!(matches!(outcome, SubmitOutcome::Queued(_)));
    orchestrator.process_next().await.unwrap()
}

fn assistant_replies(orchestrator: &Orchestrator, key: &ParticipantKey) -> Vec<String> {
    orchestrator
        .participant(key)
        .unwrap()
        .messages
        .into_iter()
        .filter(|m| m.role == Role::Assistant)
        .map(|m| m.content)
        .collect()
}

#[tokio::test]
async fn test_broadcast_records_replies_and_failures() {
    let (_client, orchestrator, keys) =
        setup(ScriptedClient::new().failing("gamma"), &["alpha", "beta", "gamma"]);

    let outcome = send(&orchestrator, SubmitRequest::text("hello all")).await;
    let ProcessOutcome::Broadcast(broadcast) = outcome else {
        panic!("expected a broadcast outcome");
    };
    assert_eq!(broadcast.targets.len(), 3);
    assert_eq!(broadcast.succeeded.len(), 2);
    assert_eq!(broadcast.failed, vec![keys[2].clone()]);

    for key in &keys {
        let participant = orchestrator.participant(key).unwrap();
        assert!(!participant.loading);
        assert_eq!(participant.messages.len(), 2);
        assert_eq!(participant.messages[0], Message::user("hello all"));
    }
    assert_eq!(assistant_replies(&orchestrator, &keys[0]), vec!["reply from alpha"]);
    let failure = &assistant_replies(&orchestrator, &keys[2])[0];
    assert!(failure.starts_with("Error: Could not get response from gamma:"));
    assert!(failure.contains("http://127.0.0.1:11434"));

    assert_eq!(orchestrator.host_status(DEFAULT_HOST_ID), HostStatus::Failed);
    assert!(orchestrator.queued_requests().is_empty());
    assert_eq!(orchestrator.active_session().title, "hello all");
}

#[tokio::test]
async fn test_mentions_narrow_the_targets() {
    let (client, orchestrator, _) = setup(ScriptedClient::new(), &["alpha", "beta"]);
    let second_alpha = orchestrator
        .add_participant(ModelRef::new(DEFAULT_HOST_ID, "alpha"))
        .unwrap();
    assert_eq!(orchestrator.display_name(&second_alpha), "alpha #2");

    let ProcessOutcome::Broadcast(broadcast) =
        send(&orchestrator, SubmitRequest::text("@alpha#2 summarize this")).await
    else {
        panic!("expected a broadcast outcome");
    };
    assert_eq!(broadcast.targets, vec![second_alpha.clone()]);
    let calls = client.calls();
    assert_eq!(calls.len(), 1);
    assert_eq!(calls[0].1.last().unwrap().content, "summarize this");

    let ProcessOutcome::Broadcast(broadcast) =
        send(&orchestrator, SubmitRequest::text("@alpha compare notes")).await
    else {
        panic!("expected a broadcast outcome");
    };
    assert_eq!(broadcast.targets.len(), 2);
    assert!(broadcast.targets.iter().all(|k| k.model_name == "alpha"));
}

#[tokio::test]
async fn test_unmatched_mention_reaches_every_target_unchanged() {
    let (client, orchestrator, keys) = setup(ScriptedClient::new(), &["alpha", "beta"]);

    let ProcessOutcome::Broadcast(broadcast) =
        send(&orchestrator, SubmitRequest::text("ping @zeta please")).await
    else {
        panic!("expected a broadcast outcome");
    };
    assert_eq!(broadcast.targets, keys);
    for (_, messages) in client.calls() {
        assert_eq!(messages.last().unwrap().content, "ping @zeta please");
    }
}

#[tokio::test]
async fn test_output_limit_truncates_replies_and_shapes_prompt() {
    let (client, orchestrator, keys) =
        setup(ScriptedClient::new().reply("alpha", "abcdefghijklmnopqrst"), &["alpha"]);
    orchestrator.update_settings(|s| {
        s.chat_config.enabled = true;
        s.chat_config.pre_prompt = "Be concise.".to_string();
        s.chat_config.max_output_length = Some(10);
    });

    send(&orchestrator, SubmitRequest::text("spell the alphabet")).await;

    assert_eq!(assistant_replies(&orchestrator, &keys[0]), vec!["abcdefghij…"]);
    let sent = &client.calls()[0].1;
    let last = sent.last().unwrap();
    assert_eq!(last.role, Role::User);
    assert_eq!(
        last.content,
        "Be concise.\n\nspell the alphabet\n\nOutput limit: Keep your final response under 10 characters."
    );
    // The visible history keeps the raw input.
    let stored = orchestrator.participant(&keys[0]).unwrap();
    assert_eq!(stored.messages[0].content, "spell the alphabet");
}

#[tokio::test]
async fn test_roles_become_system_instructions() {
    let (client, orchestrator, keys) = setup(ScriptedClient::new(), &["alpha"]);
    let label = orchestrator.set_role(&keys[0], "  devil's   advocate ").unwrap();
    assert_eq!(label, "Devil's Advocate");

    send(&orchestrator, SubmitRequest::text("is rust fast?")).await;
    let sent = &client.calls()[0].1;
    assert_eq!(sent[0].role, Role::System);
    assert!(sent[0].content.contains("Devil's Advocate"));

    orchestrator.update_settings(|s| s.enable_roles = false);
    send(&orchestrator, SubmitRequest::text("and safe?")).await;
    let sent = &client.calls()[1].1;
    assert!(sent.iter().all(|m| m.role != Role::System));
    assert!(orchestrator.role_library().contains(&"Devil's Advocate".to_string()));
}

#[tokio::test]
async fn test_queue_rejects_the_sixth_request() {
    let (_client, orchestrator, _) = setup(ScriptedClient::new(), &["alpha"]);
    for i in 0..5 {
        orchestrator
            .submit(SubmitRequest::text(format!("message {}", i)))
            .await
            .unwrap();
    }
    let err = orchestrator
        .submit(SubmitRequest::text("one too many"))
        .await
        .unwrap_err();
    assert_eq!(err, OrchestratorError::QueueFull { capacity: 5 });
    assert_eq!(orchestrator.queued_requests().len(), 5);

    assert_eq!(orchestrator.drain().await, 5);
    assert!(orchestrator.queued_requests().is_empty());
}

#[tokio::test]
async fn test_invalid_submissions_leave_state_untouched() {
    let client = Arc::new(ScriptedClient::new());
    let orchestrator = Orchestrator::builder(client).config(manual_config()).build();

    assert_eq!(
        orchestrator.submit(SubmitRequest::text("   ")).await,
        Err(OrchestratorError::EmptyInput)
    );
    assert_eq!(
        orchestrator.submit(SubmitRequest::text("anyone?")).await,
        Err(OrchestratorError::NoTargets)
    );

    let key = orchestrator
        .add_participant(ModelRef::new(DEFAULT_HOST_ID, "alpha"))
        .unwrap();
    let stranger = ParticipantKey::new(&ModelRef::new(DEFAULT_HOST_ID, "ghost"), 9);
    assert_eq!(
        orchestrator
            .submit(SubmitRequest::text("hi").with_targets(vec![stranger]))
            .await,
        Err(OrchestratorError::NoTargets)
    );
    assert!(orchestrator.queued_requests().is_empty());
    assert!(orchestrator.participant(&key).unwrap().messages.is_empty());
}

#[tokio::test]
async fn test_attachments_are_flattened_into_the_message() {
    let (client, orchestrator, keys) = setup(ScriptedClient::new(), &["llava"]);
    let request = SubmitRequest::default().with_attachments(vec![
        Attachment::text("notes.txt", "text/plain", "line one"),
        Attachment::image("cat.png", "image/png", "aGk="),
    ]);

    send(&orchestrator, request).await;
    let stored = orchestrator.participant(&keys[0]).unwrap();
    let user = &stored.messages[0];
    assert!(user.content.contains("Attachment: notes.txt (text/plain)"));
    assert!(user.content.contains("Image attached: cat.png"));
    assert_eq!(user.images, vec!["aGk=".to_string()]);
    assert_eq!(client.calls()[0].1.last().unwrap().images.len(), 1);
}

#[tokio::test]
async fn test_removing_a_participant_purges_queued_targets() {
    let (_client, orchestrator, keys) = setup(ScriptedClient::new(), &["alpha", "beta", "gamma"]);

    orchestrator
        .submit(SubmitRequest::text("only alpha").with_targets(vec![keys[0].clone()]))
        .await
        .unwrap();
    orchestrator
        .submit(SubmitRequest::text("alpha and beta").with_targets(vec![keys[0].clone(), keys[1].clone()]))
        .await
        .unwrap();

    orchestrator.remove_participant(&keys[0]).unwrap();

    let queued = orchestrator.queued_requests();
    assert_eq!(queued.len(), 1);
    assert_eq!(queued[0].targets, vec![keys[1].clone()]);
    let members = orchestrator.participant_keys();
    assert!(queued.iter().all(|q| q.targets.iter().all(|t| members.contains(t))));

    assert_eq!(
        orchestrator.remove_participant(&keys[0]),
        Err(OrchestratorError::UnknownParticipant(keys[0].clone()))
    );
}

#[tokio::test]
async fn test_remove_queued_request() {
    let (_client, orchestrator, _) = setup(ScriptedClient::new(), &["alpha"]);
    let SubmitOutcome::Queued(first) = orchestrator.submit(SubmitRequest::text("one")).await.unwrap() else {
        panic!("expected a queued request");
    };
    orchestrator.submit(SubmitRequest::text("two")).await.unwrap();

    let removed = orchestrator.remove_queued(first).unwrap();
    assert_eq!(removed.raw_input, "one");
    assert_eq!(
        orchestrator.remove_queued(first),
        Err(OrchestratorError::QueueItemNotFound(first))
    );
    assert_eq!(orchestrator.queued_requests()[0].raw_input, "two");
}

#[tokio::test]
async fn test_duplicate_models_follow_the_setting() {
    let (_client, orchestrator, keys) = setup(ScriptedClient::new(), &["alpha"]);
    orchestrator.update_settings(|s| s.allow_same_model_multi_chat = false);
    let model = ModelRef::new(DEFAULT_HOST_ID, "alpha");
    assert_eq!(
        orchestrator.add_participant(model.clone()),
        Err(OrchestratorError::DuplicateModel(model))
    );

    let copy = orchestrator.duplicate_participant(&keys[0]).unwrap();
    assert_ne!(copy, keys[0]);
    assert_eq!(orchestrator.participant_keys(), vec![keys[0].clone(), copy]);
}

#[tokio::test]
async fn test_streaming_accumulates_chunks() {
    let (client, orchestrator, keys) = setup(
        ScriptedClient::new().streaming(vec!["Hel", "lo", " there"]),
        &["alpha"],
    );
    orchestrator.update_settings(|s| s.enable_message_streaming = true);

    let ProcessOutcome::Broadcast(broadcast) = send(&orchestrator, SubmitRequest::text("greet me")).await else {
        panic!("expected a broadcast outcome");
    };
    assert_eq!(broadcast.succeeded, keys);
    assert_eq!(assistant_replies(&orchestrator, &keys[0]), vec!["Hello there"]);
    assert_eq!(client.calls().len(), 1);
}

#[tokio::test]
async fn test_streaming_keeps_repeated_tokens() {
    let (_client, orchestrator, keys) = setup(
        ScriptedClient::new().streaming(vec!["ha", "ha", ".", "..", "=", "=="]),
        &["alpha"],
    );
    orchestrator.update_settings(|s| s.enable_message_streaming = true);

    send(&orchestrator, SubmitRequest::text("laugh")).await;
    assert_eq!(assistant_replies(&orchestrator, &keys[0]), vec!["haha...==="]);
}

#[tokio::test]
async fn test_cumulative_streams_replace_the_text() {
    let (_client, orchestrator, keys) = setup(
        ScriptedClient::new()
            .streaming(vec!["Hel", "Hello", "Hello there"])
            .cumulative(),
        &["alpha"],
    );
    orchestrator.update_settings(|s| s.enable_message_streaming = true);

    send(&orchestrator, SubmitRequest::text("greet me")).await;
    assert_eq!(assistant_replies(&orchestrator, &keys[0]), vec!["Hello there"]);
}

#[tokio::test]
async fn test_stream_failure_replaces_the_partial_reply() {
    let (_client, orchestrator, keys) = setup(
        ScriptedClient::new().streaming(vec!["Partial an"]).breaking_stream(),
        &["alpha"],
    );
    orchestrator.update_settings(|s| s.enable_message_streaming = true);

    let ProcessOutcome::Broadcast(broadcast) = send(&orchestrator, SubmitRequest::text("greet me")).await else {
        panic!("expected a broadcast outcome");
    };
    assert_eq!(broadcast.failed, keys);

    let participant = orchestrator.participant(&keys[0]).unwrap();
    assert!(!participant.loading);
    let replies = assistant_replies(&orchestrator, &keys[0]);
    assert_eq!(replies.len(), 1);
    assert!(replies[0].starts_with("Error: Could not get response from alpha:"));
    assert!(!replies[0].contains("Partial an"));
    assert_eq!(orchestrator.host_status(DEFAULT_HOST_ID), HostStatus::Failed);
}

#[tokio::test]
async fn test_streaming_falls_back_to_batch_calls() {
    let (client, orchestrator, keys) = setup(ScriptedClient::new(), &["alpha"]);
    orchestrator.update_settings(|s| s.enable_message_streaming = true);

    send(&orchestrator, SubmitRequest::text("greet me")).await;
    assert_eq!(assistant_replies(&orchestrator, &keys[0]), vec!["reply from alpha"]);
    assert_eq!(client.called_models(), vec!["alpha"]);
}

#[tokio::test]
async fn test_connection_test_fills_the_catalog() {
    let client = Arc::new(ScriptedClient::new().serving(&["llama3:8b", "mistral"]));
    let orchestrator = Orchestrator::builder(client).config(manual_config()).build();

    let status = orchestrator.test_connection(DEFAULT_HOST_ID).await.unwrap();
    assert_eq!(status, HostStatus::Connected);
    let names: Vec<String> = orchestrator.catalog().into_iter().map(|m| m.model_name).collect();
    assert_eq!(names, vec!["llama3:8b", "mistral"]);

    assert_eq!(
        orchestrator.test_connection("host-missing").await,
        Err(OrchestratorError::UnknownHost("host-missing".to_string()))
    );
}

#[tokio::test]
async fn test_failed_connection_marks_host_failed() {
    let orchestrator = Orchestrator::builder(Arc::new(ScriptedClient::new()))
        .config(manual_config())
        .build();
    let status = orchestrator.test_connection(DEFAULT_HOST_ID).await.unwrap();
    assert_eq!(status, HostStatus::Failed);
    assert!(orchestrator.catalog().is_empty());
}

#[tokio::test]
async fn test_refresh_and_url_update_reset_host_state() {
    let client = Arc::new(ScriptedClient::new().serving(&["llama3:8b"]));
    let orchestrator = Orchestrator::builder(client).config(manual_config()).build();
    let remote = orchestrator.add_host("10.0.0.40").unwrap();

    let refreshed = orchestrator.refresh_all_hosts().await;
    assert_eq!(
        refreshed,
        vec![
            (DEFAULT_HOST_ID.to_string(), HostStatus::Connected),
            (remote.clone(), HostStatus::Connected),
        ]
    );
    assert_eq!(orchestrator.catalog().len(), 2);

    orchestrator.update_host_url(&remote, "10.0.0.41/").unwrap();
    assert_eq!(orchestrator.host_status(&remote), HostStatus::Idle);
    assert!(orchestrator.catalog().iter().all(|m| m.host_id != remote));
    assert!(orchestrator
        .hosts()
        .iter()
        .any(|h| h.id == remote && h.url == "http://10.0.0.41"));

    assert_eq!(
        orchestrator.update_host_url("host-missing", "10.0.0.42"),
        Err(OrchestratorError::UnknownHost("host-missing".to_string()))
    );
}

#[tokio::test]
async fn test_removing_a_host_cascades() {
    let (_client, orchestrator, keys) = setup(ScriptedClient::new(), &["alpha"]);
    let remote = orchestrator.add_host("gpu-box:11434").unwrap();
    assert_eq!(orchestrator.add_host("http://gpu-box:11434/").unwrap(), remote);
    let remote_key = orchestrator
        .add_participant(ModelRef::new(remote.as_str(), "mixtral"))
        .unwrap();
    orchestrator
        .submit(SubmitRequest::text("remote only").with_targets(vec![remote_key.clone()]))
        .await
        .unwrap();

    let host = orchestrator.remove_host(&remote).unwrap();
    assert_eq!(host.url, "http://gpu-box:11434");
    assert_eq!(orchestrator.participant_keys(), keys);
    assert!(orchestrator.queued_requests().is_empty());
    assert!(orchestrator.hosts().iter().all(|h| h.id != remote));
}

#[tokio::test]
async fn test_sessions_switch_and_clear_waiting_requests() {
    let (_client, orchestrator, _) = setup(ScriptedClient::new(), &["alpha"]);
    send(&orchestrator, SubmitRequest::text("first session")).await;
    let first = orchestrator.active_session().id;

    let second = orchestrator.new_session().unwrap();
    assert_ne!(first, second);
    assert!(orchestrator.participants().is_empty());

    orchestrator
        .add_participant(ModelRef::new(DEFAULT_HOST_ID, "beta"))
        .unwrap();
    orchestrator.submit(SubmitRequest::text("waiting")).await.unwrap();
    orchestrator.switch_session(first).unwrap();
    assert!(orchestrator.queued_requests().is_empty());
    assert_eq!(orchestrator.active_session().title, "first session");

    orchestrator.delete_session(first).unwrap();
    assert_ne!(orchestrator.active_session().id, first);
    let missing = uuid::Uuid::new_v4();
    assert_eq!(
        orchestrator.switch_session(missing),
        Err(OrchestratorError::UnknownSession(missing))
    );
}

#[tokio::test]
async fn test_auto_drain_processes_in_the_background() {
    let client = Arc::new(ScriptedClient::new());
    let orchestrator = Orchestrator::builder(client.clone()).build();
    let key = orchestrator
        .add_participant(ModelRef::new(DEFAULT_HOST_ID, "alpha"))
        .unwrap();

    orchestrator.submit(SubmitRequest::text("one")).await.unwrap();
    orchestrator.submit(SubmitRequest::text("two")).await.unwrap();

    tokio::time::timeout(Duration::from_secs(5), async {
        while !orchestrator.queued_requests().is_empty() || orchestrator.snapshot().processing.is_some() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("queue should drain");

    let messages = orchestrator.participant(&key).unwrap().messages;
    let users: Vec<&str> = messages
        .iter()
        .filter(|m| m.role == Role::User)
        .map(|m| m.content.as_str())
        .collect();
    assert_eq!(users, vec!["one", "two"]);
    assert_eq!(messages.len(), 4);
}
