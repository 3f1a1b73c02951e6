//! The Socratic discovery loop and PRD generation.
//!
//! One question at a time: ask, persist, broadcast, wait for the client's
//! answer, repeat. The model signals completion with a `DISCOVERY_COMPLETE`
//! line; a configurable question cap bounds the loop regardless. Completion
//! rolls straight into PRD generation and, on success, advances the project
//! to `planning`.

use std::sync::Arc;

use cf_bridge::event_bus::ProjectBus;
use cf_bridge::orchestrator::CommandError;
use cf_bridge::protocol::EventKind;
use cf_core::store::Store;
use cf_core::types::{DiscoveryPhase, Id, PrdStatus, ProjectPhase};
use cf_harness::cancel::CancelToken;
use cf_harness::provider::{ChatMessage, CompletionProvider, CompletionRequest};

pub const COMPLETION_MARKER: &str = "DISCOVERY_COMPLETE";

const QUESTIONER_SYSTEM_PROMPT: &str = "\
You are conducting a product discovery interview for a software project.
Ask exactly one short, concrete question that most reduces uncertainty
about what to build. When the brief and the answers so far are sufficient
to write a product requirements document, respond with the single line
DISCOVERY_COMPLETE instead of another question.";

const PRD_SYSTEM_PROMPT: &str = "\
You write product requirements documents. Given a project brief and a
discovery transcript, produce a complete PRD in markdown: overview, goals,
user stories, functional requirements, and acceptance criteria. Be
specific enough that an engineering team can implement from it directly.";

// ---------------------------------------------------------------------------
// Policy
// ---------------------------------------------------------------------------

/// Termination policy for the discovery loop. The evaluator's completion
/// marker ends it early; the question cap ends it unconditionally.
#[derive(Debug, Clone)]
pub struct DiscoveryPolicy {
    pub max_questions: usize,
}

impl Default for DiscoveryPolicy {
    fn default() -> Self {
        Self { max_questions: 12 }
    }
}

// ---------------------------------------------------------------------------
// DiscoveryEngine
// ---------------------------------------------------------------------------

pub struct DiscoveryEngine {
    store: Arc<Store>,
    bus: Arc<ProjectBus>,
    provider: Arc<dyn CompletionProvider>,
    policy: DiscoveryPolicy,
    model: String,
    max_tokens: u32,
}

impl DiscoveryEngine {
    pub fn new(
        store: Arc<Store>,
        bus: Arc<ProjectBus>,
        provider: Arc<dyn CompletionProvider>,
        policy: DiscoveryPolicy,
        model: impl Into<String>,
        max_tokens: u32,
    ) -> Self {
        Self {
            store,
            bus,
            provider,
            policy,
            model: model.into(),
            max_tokens,
        }
    }

    /// Enter the discovery loop for a fresh project and ask the first
    /// question.
    pub async fn start(&self, project_id: Id) -> Result<(), CommandError> {
        let project = self.store.get_project(project_id).await?;
        if project.phase != ProjectPhase::Discovery {
            return Err(CommandError::Conflict(format!(
                "project is in phase {}, not discovery",
                project.phase
            )));
        }
        let state = self.store.discovery_state(project_id).await?;
        if state.state != DiscoveryPhase::NotStarted {
            return Err(CommandError::Conflict(
                "discovery has already started".into(),
            ));
        }
        self.store
            .set_discovery_phase(project_id, DiscoveryPhase::Discovering)
            .await?;
        self.ask_next(project_id).await
    }

    /// Record the client's answer to the pending question and continue the
    /// loop (next question, or conclusion + PRD).
    pub async fn answer(&self, project_id: Id, text: &str) -> Result<(), CommandError> {
        let project = self.store.get_project(project_id).await?;
        if project.phase != ProjectPhase::Discovery {
            return Err(CommandError::Conflict(format!(
                "project is in phase {}, not discovery",
                project.phase
            )));
        }

        let question = self.store.answer_question(project_id, text).await?;
        self.bus.publish(
            project_id,
            EventKind::DiscoveryAnswered {
                question_id: question.id,
                answer: text.to_string(),
            },
        );

        let state = self.store.discovery_state(project_id).await?;
        if state.questions.len() >= self.policy.max_questions {
            tracing::info!(project_id, "discovery question cap reached");
            return self.conclude(project_id).await;
        }
        self.ask_next(project_id).await
    }

    /// Ask the evaluator for the next question, or conclude when it signals
    /// completion.
    async fn ask_next(&self, project_id: Id) -> Result<(), CommandError> {
        let project = self.store.get_project(project_id).await?;
        let state = self.store.discovery_state(project_id).await?;

        let mut transcript = format!(
            "Project brief: {}\n{}\n\nInterview so far:\n",
            project.name, project.description
        );
        for q in &state.questions {
            transcript.push_str(&format!("Q: {}\n", q.text));
            if let Some(answer) = &q.answer {
                transcript.push_str(&format!("A: {}\n", answer));
            }
        }

        let request = CompletionRequest {
            messages: vec![
                ChatMessage::system(QUESTIONER_SYSTEM_PROMPT),
                ChatMessage::user(transcript),
            ],
            model: self.model.clone(),
            max_tokens: self.max_tokens,
        };
        let completion = self
            .provider
            .complete(request, &CancelToken::new())
            .await
            .map_err(|e| CommandError::Internal(format!("discovery evaluator failed: {}", e)))?;

        self.store
            .record_cost(
                project_id,
                None,
                None,
                &completion.model,
                completion.tokens_in,
                completion.tokens_out,
                completion.cost_cents,
            )
            .await?;

        let reply = completion.text.trim();
        if reply.starts_with(COMPLETION_MARKER) {
            return self.conclude(project_id).await;
        }

        let question = self.store.ask_question(project_id, reply).await?;
        self.bus.publish(
            project_id,
            EventKind::DiscoveryQuestion {
                question_id: question.id,
                text: question.text.clone(),
            },
        );
        Ok(())
    }

    /// Mark discovery complete, generate the PRD, and advance to planning.
    async fn conclude(&self, project_id: Id) -> Result<(), CommandError> {
        self.store
            .set_discovery_phase(project_id, DiscoveryPhase::Completed)
            .await?;
        self.store
            .set_prd_status(project_id, PrdStatus::Generating)
            .await?;
        self.bus.publish(
            project_id,
            EventKind::PrdStatusChanged {
                status: PrdStatus::Generating,
            },
        );

        let project = self.store.get_project(project_id).await?;
        let state = self.store.discovery_state(project_id).await?;
        let mut transcript = format!(
            "Project: {}\n{}\n\nDiscovery transcript:\n",
            project.name, project.description
        );
        for q in &state.questions {
            transcript.push_str(&format!(
                "Q: {}\nA: {}\n",
                q.text,
                q.answer.as_deref().unwrap_or("(unanswered)")
            ));
        }

        let request = CompletionRequest {
            messages: vec![
                ChatMessage::system(PRD_SYSTEM_PROMPT),
                ChatMessage::user(transcript),
            ],
            model: self.model.clone(),
            max_tokens: self.max_tokens,
        };

        match self.provider.complete(request, &CancelToken::new()).await {
            Ok(completion) => {
                self.store
                    .record_cost(
                        project_id,
                        None,
                        None,
                        &completion.model,
                        completion.tokens_in,
                        completion.tokens_out,
                        completion.cost_cents,
                    )
                    .await?;
                self.store
                    .set_prd(project_id, PrdStatus::Available, Some(completion.text))
                    .await?;
                self.bus.publish(
                    project_id,
                    EventKind::PrdStatusChanged {
                        status: PrdStatus::Available,
                    },
                );
                self.store
                    .set_project_phase(project_id, ProjectPhase::Discovery, ProjectPhase::Planning)
                    .await?;
                tracing::info!(project_id, "PRD generated, project advanced to planning");
                Ok(())
            }
            Err(e) => {
                self.store
                    .set_prd_status(project_id, PrdStatus::Failed)
                    .await?;
                self.bus.publish(
                    project_id,
                    EventKind::PrdStatusChanged {
                        status: PrdStatus::Failed,
                    },
                );
                tracing::warn!(project_id, error = %e, "PRD generation failed");
                Ok(())
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
