//! Multi-agent workflow: host → planner → critic → planner → reporter.
//!
//! Each round is one LLM call at its role's queue priority; the session
//! store is checkpointed after every round, so a reconnecting client can
//! skip completed rounds. Only the reporter round streams to the client;
//! earlier rounds are working state.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::json;
use stream_event::ChatEvent;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use super::{AgentSession, AgentSessionStore, SESSION_TTL};
use crate::llm::{LlmClient, ProviderRequest};
use crate::message::{ChatMessage, ChatRole};
use crate::queue::{EnqueueOptions, LlmQueue, QueueRole};
use crate::repo::{ConversationRepo, MessageRepo, StoredMessage};
use crate::stream::progress::StreamProgressStore;
use crate::stream::think::split_thinking;
use crate::stream::writer::AdaptiveSseWriter;

/// One round of the workflow.
#[derive(Clone, Copy, Debug)]
pub struct RoundSpec {
    pub name: &'static str,
    pub role: QueueRole,
    pub instruction: &'static str,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
struct RoundOutput {
    round: u32,
    name: String,
    content: String,
}

/// Inputs for one workflow run.
#[derive(Clone)]
pub struct WorkflowRequest {
    pub user_id: String,
    pub conversation_id: String,
    pub assistant_message_id: String,
    pub request_id: String,
    pub user_query: String,
    pub resume_from_round: Option<u32>,
    pub client_assistant_message_id: Option<String>,
    pub cancel: CancellationToken,
}

#[derive(Clone, Debug, Default)]
pub struct WorkflowOutcome {
    pub completed: bool,
    pub rounds_completed: u32,
    pub final_content: String,
    pub persisted: bool,
}

/// Runs the round pipeline with checkpoints and resume.
pub struct MultiAgentWorkflow {
    queue: Arc<LlmQueue>,
    sessions: Arc<dyn AgentSessionStore>,
    conversations: Arc<dyn ConversationRepo>,
    messages: Arc<dyn MessageRepo>,
    progress: Arc<dyn StreamProgressStore>,
    ttl: Duration,
}

impl MultiAgentWorkflow {
    pub fn new(
        queue: Arc<LlmQueue>,
        sessions: Arc<dyn AgentSessionStore>,
        conversations: Arc<dyn ConversationRepo>,
        messages: Arc<dyn MessageRepo>,
        progress: Arc<dyn StreamProgressStore>,
    ) -> Self {
        Self {
            queue,
            sessions,
            conversations,
            messages,
            progress,
            ttl: SESSION_TTL,
        }
    }

    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = ttl;
        self
    }

    pub fn rounds() -> &'static [RoundSpec] {
        &[
            RoundSpec {
                name: "host",
                role: QueueRole::Host,
                instruction: "Restate the user's request in one paragraph and list what a \
                              complete answer must cover.",
            },
            RoundSpec {
                name: "planner",
                role: QueueRole::Planner,
                instruction: "Draft a concrete step-by-step plan that satisfies the host's \
                              requirements.",
            },
            RoundSpec {
                name: "critic",
                role: QueueRole::Critic,
                instruction: "Critique the plan: find gaps, risks, and wrong assumptions. \
                              Be specific.",
            },
            RoundSpec {
                name: "planner",
                role: QueueRole::Planner,
                instruction: "Revise the plan to address every point of the critique.",
            },
            RoundSpec {
                name: "reporter",
                role: QueueRole::Reporter,
                instruction: "Write the final answer for the user, following the revised plan. \
                              Answer directly; do not mention the planning process.",
            },
        ]
    }

    /// Runs (or resumes) the workflow and streams the reporter round.
    pub async fn run(
        &self,
        llm: &Arc<dyn LlmClient>,
        request: &WorkflowRequest,
        writer: &AdaptiveSseWriter,
    ) -> WorkflowOutcome {
        let rounds = Self::rounds();
        let total_rounds = rounds.len() as u32;
        let mut outcome = WorkflowOutcome::default();

        let (mut session, mut outputs, start_round) = self.load_or_start(request, writer).await;
        outcome.rounds_completed = session.completed_rounds;

        for (index, spec) in rounds.iter().enumerate() {
            let round = index as u32 + 1;
            if round < start_round {
                continue;
            }
            if writer.is_closed() || request.cancel.is_cancelled() {
                tracing::debug!(round, "client gone, leaving checkpoint for resume");
                return outcome;
            }

            let is_final = round == total_rounds;
            let content = match self.run_round(llm, request, spec, &outputs, is_final, writer).await
            {
                Ok(content) => content,
                Err(e) => {
                    if !writer.is_closed() {
                        writer.send_event(ChatEvent::Error {
                            error: e,
                            message: None,
                        });
                    }
                    return outcome;
                }
            };

            outputs.push(RoundOutput {
                round,
                name: spec.name.to_string(),
                content: content.clone(),
            });
            session.completed_rounds = round;
            session.session_state = json!({ "outputs": outputs });
            session.updated_at = Utc::now();
            session.expires_at = Utc::now()
                + chrono::Duration::from_std(self.ttl).unwrap_or(chrono::Duration::minutes(5));
            if let Err(e) = self.sessions.save(&session).await {
                tracing::warn!("session checkpoint failed: {}", e);
            }
            outcome.rounds_completed = round;

            if is_final {
                let split = split_thinking(&content);
                outcome.final_content = split.content.clone();
                outcome.persisted = self.persist_final(request, &split).await;
                outcome.completed = true;
                writer.send_event(ChatEvent::SessionComplete {
                    rounds: total_rounds,
                });
                writer.send_event(ChatEvent::Done {
                    assistant_message_id: request.assistant_message_id.clone(),
                    sources: vec![],
                });
                if let Err(e) = self
                    .sessions
                    .delete(
                        &request.conversation_id,
                        &request.user_id,
                        &request.assistant_message_id,
                    )
                    .await
                {
                    tracing::warn!("finished session cleanup failed: {}", e);
                }
            }
        }
        outcome
    }

    /// Loads a resumable checkpoint or starts fresh. Emits the `resume`
    /// event when a valid checkpoint is picked up.
    async fn load_or_start(
        &self,
        request: &WorkflowRequest,
        writer: &AdaptiveSseWriter,
    ) -> (AgentSession, Vec<RoundOutput>, u32) {
        if let Some(requested) = request.resume_from_round {
            let found = self
                .sessions
                .find_by_identifiers(
                    &request.conversation_id,
                    &request.user_id,
                    &request.assistant_message_id,
                )
                .await
                .unwrap_or_default();
            if let Some(session) = found {
                let continue_from = requested.clamp(1, session.completed_rounds + 1);
                let outputs: Vec<RoundOutput> = session
                    .session_state
                    .get("outputs")
                    .and_then(|v| serde_json::from_value(v.clone()).ok())
                    .unwrap_or_default();
                let outputs: Vec<RoundOutput> = outputs
                    .into_iter()
                    .filter(|o| o.round < continue_from)
                    .collect();
                writer.send_event(ChatEvent::Resume {
                    resumed_from_round: session.completed_rounds,
                    continue_from_round: continue_from,
                });
                tracing::info!(
                    completed = session.completed_rounds,
                    continue_from,
                    "resuming multi-agent session"
                );
                return (session, outputs, continue_from);
            }
        }
        let session = AgentSession::new(
            &request.conversation_id,
            &request.user_id,
            &request.assistant_message_id,
            &request.user_query,
            self.ttl,
        );
        (session, Vec::new(), 1)
    }

    /// One round: prompt from the query plus prior outputs, queued at the
    /// round's priority. The final round streams; earlier rounds buffer.
    async fn run_round(
        &self,
        llm: &Arc<dyn LlmClient>,
        request: &WorkflowRequest,
        spec: &RoundSpec,
        outputs: &[RoundOutput],
        stream_to_client: bool,
        writer: &AdaptiveSseWriter,
    ) -> Result<String, String> {
        let mut prompt = format!("User request:\n{}\n", request.user_query);
        for output in outputs {
            prompt.push_str(&format!(
                "\n[round {} · {}]\n{}\n",
                output.round, output.name, output.content
            ));
        }
        let messages = vec![
            ChatMessage::system(spec.instruction),
            ChatMessage::user(prompt),
        ];
        let opts = EnqueueOptions {
            role: Some(spec.role),
            cancel: Some(request.cancel.clone()),
            ..EnqueueOptions::default()
        };

        if !stream_to_client {
            let outcome = self
                .queue
                .enqueue(
                    opts,
                    llm.stream_chat(
                        ProviderRequest {
                            messages,
                            tools: vec![],
                            model: None,
                        },
                        None,
                    ),
                )
                .await
                .map_err(|e| e.to_string())?;
            return Ok(outcome.content);
        }

        let (delta_tx, mut delta_rx) = mpsc::channel::<String>(64);
        let call = llm.stream_chat(
            ProviderRequest {
                messages,
                tools: vec![],
                model: None,
            },
            Some(delta_tx),
        );
        let forward = async {
            let mut cumulative = String::new();
            let mut visible_len = 0usize;
            while let Some(delta) = delta_rx.recv().await {
                cumulative.push_str(&delta);
                let split = split_thinking(&cumulative);
                if split.content.len() >= visible_len {
                    let visible_delta = split.content[visible_len..].to_string();
                    visible_len = split.content.len();
                    writer.push_text(visible_delta, split.thinking, vec![]);
                } else {
                    visible_len = split.content.len();
                }
            }
        };
        let (result, ()) = tokio::join!(self.queue.enqueue(opts, call), forward);
        result.map(|o| o.content).map_err(|e| e.to_string())
    }

    async fn persist_final(
        &self,
        request: &WorkflowRequest,
        split: &crate::stream::think::ThinkingSplit,
    ) -> bool {
        let mut message = StoredMessage::new(
            &request.conversation_id,
            &request.user_id,
            ChatRole::Assistant,
            &split.content,
        );
        message.id = request.assistant_message_id.clone();
        message.thinking = split.thinking.clone();
        message.client_id = request.client_assistant_message_id.clone();
        match self.messages.save(&message).await {
            Ok(_) => {
                if let Err(e) = self
                    .conversations
                    .record_message_append(&request.conversation_id)
                    .await
                {
                    tracing::warn!("message count bump failed: {}", e);
                }
                if let Err(e) = self
                    .progress
                    .mark_completed(
                        &request.assistant_message_id,
                        &split.content,
                        split.thinking.as_deref(),
                        &[],
                    )
                    .await
                {
                    tracing::warn!("progress completion failed: {}", e);
                }
                true
            }
            Err(e) => {
                tracing::error!("workflow final persist failed: {}", e);
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::{LlmError, MockLlm, MockTurn, ProviderOutcome};
    use crate::queue::QueueConfig;
    use crate::repo::sqlite::{test_db, SqliteConversationRepo, SqliteMessageRepo};
    use crate::repo::Conversation;
    use crate::session::InMemoryAgentSessionStore;
    use crate::stream::progress::InMemoryProgressStore;
    use crate::stream::writer::{CollectorSink, WriteMode, WriterConfig};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicU32, Ordering};

    struct Fixture {
        _dir: tempfile::TempDir,
        workflow: MultiAgentWorkflow,
        sessions: Arc<InMemoryAgentSessionStore>,
        messages: Arc<SqliteMessageRepo>,
    }

    async fn fixture() -> Fixture {
        let (_dir, db) = test_db();
        let sessions = Arc::new(InMemoryAgentSessionStore::new());
        let conversations = Arc::new(SqliteConversationRepo::new(db.clone()));
        let conv = Conversation::new("u1", "multi");
        {
            use crate::repo::ConversationRepo as _;
            let mut c = conv.clone();
            c.id = "c1".into();
            conversations.save(&c).await.unwrap();
        }
        let messages = Arc::new(SqliteMessageRepo::new(db));
        let workflow = MultiAgentWorkflow::new(
            LlmQueue::new(QueueConfig::default()),
            sessions.clone() as Arc<dyn AgentSessionStore>,
            conversations as Arc<dyn ConversationRepo>,
            messages.clone() as Arc<dyn MessageRepo>,
            Arc::new(InMemoryProgressStore::default()) as Arc<dyn StreamProgressStore>,
        );
        Fixture {
            _dir,
            workflow,
            sessions,
            messages,
        }
    }

    fn request(resume: Option<u32>) -> WorkflowRequest {
        WorkflowRequest {
            user_id: "u1".into(),
            conversation_id: "c1".into(),
            assistant_message_id: "m1".into(),
            request_id: "r1".into(),
            user_query: "plan my launch".into(),
            resume_from_round: resume,
            client_assistant_message_id: None,
            cancel: CancellationToken::new(),
        }
    }

    fn writer(sink: &Arc<CollectorSink>) -> AdaptiveSseWriter {
        AdaptiveSseWriter::spawn(
            Arc::clone(sink) as Arc<dyn crate::stream::SseSink>,
            WriterConfig {
                char_delay: Duration::from_millis(1),
                chunk_pause: Duration::from_millis(1),
                forced_mode: Some(WriteMode::Chunk),
                ..WriterConfig::default()
            },
        )
    }

    /// Fails every call after the first `allowed`.
    struct FailAfter {
        allowed: u32,
        calls: AtomicU32,
    }

    #[async_trait]
    impl LlmClient for FailAfter {
        fn name(&self) -> &str {
            "fail-after"
        }
        async fn stream_chat(
            &self,
            _request: ProviderRequest,
            _delta_tx: Option<mpsc::Sender<String>>,
        ) -> Result<ProviderOutcome, LlmError> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            if n >= self.allowed {
                return Err(LlmError::Transport("cut off".into()));
            }
            Ok(ProviderOutcome {
                content: format!("round output {}", n + 1),
                tool_calls: vec![],
                finish_reason: crate::llm::FinishReason::Stop,
                usage: None,
            })
        }
    }

    #[tokio::test]
    async fn full_run_completes_all_rounds_and_persists() {
        let f = fixture().await;
        let llm: Arc<dyn LlmClient> =
            Arc::new(MockLlm::new(vec![MockTurn::text("final report")]));
        let sink = Arc::new(CollectorSink::new());
        let w = writer(&sink);

        let outcome = f.workflow.run(&llm, &request(None), &w).await;
        w.flush().await;

        assert!(outcome.completed);
        assert_eq!(outcome.rounds_completed, 5);
        assert_eq!(outcome.final_content, "final report");

        let payloads = sink.payloads();
        let complete = payloads
            .iter()
            .find(|p| p["type"] == "session_complete")
            .expect("session_complete event");
        assert_eq!(complete["rounds"], 5);
        assert_eq!(payloads.last().unwrap()["done"], true);

        let saved = f.messages.find_by_id("m1", "u1").await.unwrap().unwrap();
        assert_eq!(saved.content, "final report");
        // Finished sessions are cleaned up.
        assert!(f
            .sessions
            .find_by_identifiers("c1", "u1", "m1")
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn interrupt_after_two_rounds_then_resume_from_three() {
        let f = fixture().await;

        // First attempt: rounds 1 and 2 succeed, round 3 dies.
        let flaky: Arc<dyn LlmClient> = Arc::new(FailAfter {
            allowed: 2,
            calls: AtomicU32::new(0),
        });
        let sink1 = Arc::new(CollectorSink::new());
        let w1 = writer(&sink1);
        let first = f.workflow.run(&flaky, &request(None), &w1).await;
        assert!(!first.completed);
        assert_eq!(first.rounds_completed, 2);

        let checkpoint = f
            .sessions
            .find_by_identifiers("c1", "u1", "m1")
            .await
            .unwrap()
            .expect("checkpoint survives interruption");
        assert_eq!(checkpoint.completed_rounds, 2);

        // Reconnect asking to continue from round 3.
        let healthy: Arc<dyn LlmClient> =
            Arc::new(MockLlm::new(vec![MockTurn::text("resumed output")]));
        let sink2 = Arc::new(CollectorSink::new());
        let w2 = writer(&sink2);
        let second = f.workflow.run(&healthy, &request(Some(3)), &w2).await;
        w2.flush().await;

        assert!(second.completed);
        assert_eq!(second.rounds_completed, 5);

        let payloads = sink2.payloads();
        let resume = payloads
            .iter()
            .find(|p| p["type"] == "resume")
            .expect("resume event");
        assert_eq!(resume["resumedFromRound"], 2);
        assert_eq!(resume["continueFromRound"], 3);
        let complete = payloads
            .iter()
            .find(|p| p["type"] == "session_complete")
            .unwrap();
        assert_eq!(complete["rounds"], 5);
    }

    #[tokio::test]
    async fn expired_checkpoint_starts_from_round_one() {
        let f = fixture().await;
        let mut dead = AgentSession::new("c1", "u1", "m1", "q", SESSION_TTL);
        dead.completed_rounds = 4;
        dead.expires_at = Utc::now() - chrono::Duration::seconds(1);
        f.sessions.save(&dead).await.unwrap();

        let llm: Arc<dyn LlmClient> = Arc::new(MockLlm::new(vec![MockTurn::text("fresh")]));
        let sink = Arc::new(CollectorSink::new());
        let w = writer(&sink);
        let outcome = f.workflow.run(&llm, &request(Some(5)), &w).await;
        w.flush().await;

        assert!(outcome.completed);
        // No resume event: the checkpoint was expired.
        assert!(!sink.payloads().iter().any(|p| p["type"] == "resume"));
    }
}
