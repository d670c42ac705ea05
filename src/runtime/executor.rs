//! Agent turn execution
//!
//! Drives one end-to-end agent turn: assemble the prompt, stream the model,
//! interleave tool calls, publish replies. The invariant that matters most
//! here: buffered text is flushed as a finalized reply event *before* a
//! tool runs, so tool effects never race unpublished text.

use nostr::prelude::{Event, EventId};
use rand::Rng;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::agents::ProjectAgent;
use crate::conversation::Phase;
use crate::llm::{
    ChatMessage, ContentBlock, LlmError, LlmRequest, MessageRole, StreamChunk, ToolCallChunk,
};
use crate::prompt;
use crate::relay::tags;
use crate::tools::{ToolContext, ToolControl};

use super::publisher::{OutboundError, OutboundMessage};
use super::ProjectContext;

/// Streaming status events are throttled to at most one per window.
const STATUS_INTERVAL: Duration = Duration::from_millis(250);
/// Transient LLM failures get this many attempts per step.
const LLM_MAX_ATTEMPTS: u32 = 3;
/// Base delay for LLM retries; doubled per attempt, plus jitter.
const LLM_BACKOFF_BASE: Duration = Duration::from_millis(1000);
const LLM_BACKOFF_JITTER_MS: u64 = 250;

#[derive(Debug, Error)]
pub enum TurnError {
    #[error("llm request failed: {0}")]
    Llm(#[from] LlmError),
    #[error(transparent)]
    Publish(#[from] OutboundError),
}

/// Why a turn ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    /// Stream finished with no pending tool call.
    Finished,
    /// A tool returned a stop verdict.
    ToolStop,
    /// Step budget exhausted; an explanatory reply was published.
    StepLimit,
    Cancelled,
}

#[derive(Debug)]
pub struct TurnOutcome {
    pub stop: StopReason,
    pub steps: u32,
    pub replies_published: usize,
}

/// One agent turn on one triggering event.
pub struct AgentExecutor {
    project: Arc<ProjectContext>,
    agent: Arc<ProjectAgent>,
}

impl AgentExecutor {
    pub fn new(project: Arc<ProjectContext>, agent: Arc<ProjectAgent>) -> Self {
        Self { project, agent }
    }

    #[allow(clippy::too_many_lines)] // the stream/tool loop is one state machine
    pub async fn run_turn(
        &self,
        trigger: &Event,
        conversation_root: &str,
        cancel: CancellationToken,
    ) -> Result<TurnOutcome, TurnError> {
        let root_id = EventId::parse(conversation_root).ok();
        let phase_at_start = self.project.phase(conversation_root).unwrap_or_default();

        tracing::info!(
            agent = %self.agent.slug(),
            conv = %conversation_root,
            trigger = %trigger.id,
            phase = %phase_at_start,
            "agent turn starting"
        );

        let system = prompt::system_prompt(
            &self.agent.definition,
            self.project.title(),
            phase_at_start,
        );
        let mut messages = self.assemble_thread(trigger);
        let tools = self
            .project
            .tools
            .definitions_for(&self.agent.definition.tools);
        let model = self.project.models.resolve_model(
            "agents",
            self.agent.definition.model.as_deref(),
        );

        let mut published_phase = phase_at_start;
        let mut replies_published = 0usize;
        let mut last_status: Option<tokio::time::Instant> = None;
        let max_steps = self.project.max_steps();

        for step in 1..=max_steps {
            let request = LlmRequest {
                model: model.clone(),
                system: system.clone(),
                messages: messages.clone(),
                tools: tools.clone(),
            };

            let consumed = match self
                .stream_step(request, root_id, &mut last_status, &cancel)
                .await
            {
                Ok(c) => c,
                Err(StepFailure::Cancelled(buffer)) => {
                    // Shutdown grace: flush what the model already said.
                    if !buffer.trim().is_empty() {
                        self.publish_reply(trigger, root_id, &buffer, &mut published_phase)
                            .await?;
                        replies_published += 1;
                    }
                    return Ok(TurnOutcome {
                        stop: StopReason::Cancelled,
                        steps: step,
                        replies_published,
                    });
                }
                Err(StepFailure::Terminal(e)) => {
                    self.publish_reply(
                        trigger,
                        root_id,
                        &format!("I could not complete this turn: {e}"),
                        &mut published_phase,
                    )
                    .await?;
                    return Err(TurnError::Llm(e));
                }
            };

            match consumed.tool_call {
                Some(tool_call) => {
                    // Flush text ahead of the tool so its effects never
                    // precede the words that announced them.
                    if !consumed.text.trim().is_empty() {
                        self.publish_reply(
                            trigger,
                            root_id,
                            &consumed.text,
                            &mut published_phase,
                        )
                        .await?;
                        replies_published += 1;
                    }

                    let mut assistant_blocks = Vec::new();
                    if !consumed.text.is_empty() {
                        assistant_blocks.push(ContentBlock::text(consumed.text.clone()));
                    }
                    assistant_blocks.push(ContentBlock::ToolUse {
                        id: tool_call.id.clone(),
                        name: tool_call.name.clone(),
                        input: tool_call.input.clone(),
                    });
                    messages.push(ChatMessage {
                        role: MessageRole::Assistant,
                        content: assistant_blocks,
                    });

                    let output = self.invoke_tool(&tool_call, trigger, conversation_root, &cancel).await;
                    tracing::debug!(
                        agent = %self.agent.slug(),
                        tool = %tool_call.name,
                        is_error = output.is_error,
                        "tool finished"
                    );
                    messages.push(ChatMessage {
                        role: MessageRole::User,
                        content: vec![ContentBlock::tool_result(
                            tool_call.id.clone(),
                            output.content.clone(),
                            output.is_error,
                        )],
                    });

                    if output.control == ToolControl::Stop {
                        if !output.content.trim().is_empty() {
                            self.publish_reply(
                                trigger,
                                root_id,
                                &output.content,
                                &mut published_phase,
                            )
                            .await?;
                            replies_published += 1;
                        }
                        return Ok(TurnOutcome {
                            stop: StopReason::ToolStop,
                            steps: step,
                            replies_published,
                        });
                    }
                }
                None => {
                    if !consumed.text.trim().is_empty() {
                        self.publish_reply(trigger, root_id, &consumed.text, &mut published_phase)
                            .await?;
                        replies_published += 1;
                    }
                    return Ok(TurnOutcome {
                        stop: StopReason::Finished,
                        steps: step,
                        replies_published,
                    });
                }
            }
        }

        tracing::warn!(
            agent = %self.agent.slug(),
            conv = %conversation_root,
            max_steps,
            "step limit exceeded"
        );
        self.publish_reply(
            trigger,
            root_id,
            &format!(
                "Stopping here: this turn hit the {max_steps}-step limit. \
                 Ask me to continue if the work is unfinished."
            ),
            &mut published_phase,
        )
        .await?;
        Ok(TurnOutcome {
            stop: StopReason::StepLimit,
            steps: max_steps,
            replies_published: replies_published + 1,
        })
    }

    fn assemble_thread(&self, trigger: &Event) -> Vec<ChatMessage> {
        let pinned = self.project.delegations().pinned_event_ids();
        let thread = self
            .project
            .thread_for(&trigger.id, &self.agent.pubkey(), &pinned);
        let labels = self.project.agent_labels();
        let notices = self
            .project
            .delegations()
            .take_orphan_notices(&self.agent.pubkey());
        let mut messages = prompt::thread_messages(&thread, &labels, &notices);

        if messages.is_empty() {
            // Never hand the model an empty conversation; fall back to the
            // trigger content itself.
            messages.push(ChatMessage::user(trigger.content.clone()));
        }
        messages
    }

    /// Run one streaming request with transient-error retries, consuming
    /// chunks until a tool call or finish.
    async fn stream_step(
        &self,
        request: LlmRequest,
        root_id: Option<EventId>,
        last_status: &mut Option<tokio::time::Instant>,
        cancel: &CancellationToken,
    ) -> Result<ConsumedStream, StepFailure> {
        let mut attempt = 1u32;
        loop {
            match self
                .consume_stream(request.clone(), root_id, last_status, cancel)
                .await
            {
                Ok(consumed) => return Ok(consumed),
                Err(StepFailure::Cancelled(buffer)) => {
                    return Err(StepFailure::Cancelled(buffer))
                }
                Err(StepFailure::Terminal(e)) if e.is_retryable() && attempt < LLM_MAX_ATTEMPTS => {
                    let delay = retry_delay(attempt, e.retry_after);
                    tracing::warn!(
                        agent = %self.agent.slug(),
                        attempt,
                        error = %e,
                        delay_ms = delay.as_millis(),
                        "transient llm error; retrying"
                    );
                    attempt += 1;
                    tokio::select! {
                        () = tokio::time::sleep(delay) => {}
                        () = cancel.cancelled() => {
                            return Err(StepFailure::Cancelled(String::new()))
                        }
                    }
                }
                Err(terminal) => return Err(terminal),
            }
        }
    }

    async fn consume_stream(
        &self,
        request: LlmRequest,
        root_id: Option<EventId>,
        last_status: &mut Option<tokio::time::Instant>,
        cancel: &CancellationToken,
    ) -> Result<ConsumedStream, StepFailure> {
        let provider = self
            .project
            .models
            .provider()
            .map_err(StepFailure::Terminal)?;
        let mut stream = provider
            .stream(request, cancel.clone())
            .await
            .map_err(StepFailure::Terminal)?;

        let mut buffer = String::new();

        loop {
            let chunk = tokio::select! {
                chunk = stream.recv() => chunk,
                () = cancel.cancelled() => return Err(StepFailure::Cancelled(buffer)),
            };
            match chunk {
                Some(Ok(StreamChunk::TextDelta(delta))) => {
                    buffer.push_str(&delta);
                    let due = last_status
                        .is_none_or(|at| at.elapsed() >= STATUS_INTERVAL);
                    if due && !buffer.trim().is_empty() {
                        *last_status = Some(tokio::time::Instant::now());
                        self.project
                            .publisher
                            .publish_streaming_status(&self.agent, root_id, &buffer)
                            .await;
                    }
                }
                Some(Ok(StreamChunk::ToolCall(tool_call))) => {
                    return Ok(ConsumedStream {
                        text: buffer,
                        tool_call: Some(tool_call),
                    });
                }
                Some(Ok(StreamChunk::Finish(usage))) => {
                    tracing::debug!(
                        agent = %self.agent.slug(),
                        input_tokens = usage.input_tokens,
                        output_tokens = usage.output_tokens,
                        "stream finished"
                    );
                    return Ok(ConsumedStream {
                        text: buffer,
                        tool_call: None,
                    });
                }
                None => {
                    return Ok(ConsumedStream {
                        text: buffer,
                        tool_call: None,
                    });
                }
                Some(Err(e)) => return Err(StepFailure::Terminal(e)),
            }
        }
    }

    async fn invoke_tool(
        &self,
        tool_call: &ToolCallChunk,
        trigger: &Event,
        conversation_root: &str,
        cancel: &CancellationToken,
    ) -> crate::tools::ToolOutput {
        let ctx = ToolContext {
            cancel: cancel.clone(),
            agent: self.agent.clone(),
            conversation_root: conversation_root.to_string(),
            trigger: trigger.clone(),
            project: self.project.clone(),
        };
        self.project
            .tools
            .execute(&tool_call.name, tool_call.input.clone(), ctx)
            .await
    }

    async fn publish_reply(
        &self,
        trigger: &Event,
        root_id: Option<EventId>,
        content: &str,
        published_phase: &mut Phase,
    ) -> Result<Event, TurnError> {
        // Phase tag rides on the first reply after a transition.
        let current_phase = root_id
            .map(|id| id.to_hex())
            .and_then(|root| self.project.phase(&root))
            .unwrap_or(*published_phase);
        let phase_tag = (current_phase != *published_phase).then_some(current_phase);
        *published_phase = current_phase;

        // Replies to a delegation request carry the correlation tag the
        // delegator's router is watching for.
        let extra_tags = if self
            .project
            .delegations()
            .is_delegation_request(&trigger.id)
        {
            vec![tags::q_correlation(trigger.id)]
        } else {
            Vec::new()
        };

        let message = OutboundMessage {
            conversation_root: root_id,
            reply_to: Some(trigger.id),
            recipients: reply_recipients(trigger, &self.agent),
            content: content.to_string(),
            phase: phase_tag,
            extra_tags,
        };
        let event = self.project.publish_as(&self.agent, message).await?;
        Ok(event)
    }
}

/// The trigger's author plus everyone it p-tagged, minus the replying agent.
fn reply_recipients(trigger: &Event, agent: &ProjectAgent) -> Vec<nostr::prelude::PublicKey> {
    let own = agent.pubkey();
    let mut recipients = vec![trigger.pubkey];
    for pk in tags::recipients(trigger) {
        if !recipients.contains(&pk) {
            recipients.push(pk);
        }
    }
    recipients.retain(|pk| *pk != own);
    recipients
}

struct ConsumedStream {
    text: String,
    tool_call: Option<ToolCallChunk>,
}

enum StepFailure {
    Terminal(LlmError),
    Cancelled(String),
}

fn retry_delay(attempt: u32, suggested: Option<Duration>) -> Duration {
    if let Some(suggested) = suggested {
        return suggested;
    }
    let base = LLM_BACKOFF_BASE * 2u32.saturating_pow(attempt - 1);
    let jitter = rand::thread_rng().gen_range(0..LLM_BACKOFF_JITTER_MS);
    base + Duration::from_millis(jitter)
}
