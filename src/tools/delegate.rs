//! Delegation tools
//!
//! `delegate` / `delegate_external` / `delegate_followup` publish a request
//! event to the recipients, suspend the calling turn on the delegation
//! registry, and resume with the per-recipient results. All three refuse a
//! recipient set containing the caller. `delegate_phase` is the exception:
//! it records a phase transition, hands the conversation off (possibly to
//! the caller itself, as a fresh turn in the new phase) and ends the
//! current turn without waiting.

use async_trait::async_trait;
use nostr::prelude::PublicKey;
use serde::Deserialize;
use serde_json::{json, Value};
use std::time::Duration;

use crate::conversation::Phase;
use crate::delegation::{DelegationOutcome, DelegationSpec, ReplyStatus};
use crate::runtime::publisher::OutboundMessage;

use super::{Tool, ToolContext, ToolOutput};

const RECIPIENTS_SCHEMA: &str =
    "Agent slugs within this project, or npub/hex pubkeys for any agent";

/// Delegate work to one or more agents and wait for all of them.
pub struct DelegateTool;

/// Delegate to an agent outside this project, addressed by pubkey.
pub struct DelegateExternalTool;

/// Follow up with a single prior recipient and wait for its reply.
pub struct DelegateFollowupTool;

/// Transition phase and hand the conversation off without waiting.
pub struct DelegatePhaseTool;

#[derive(Debug, Deserialize)]
struct DelegateInput {
    recipients: Vec<String>,
    prompt: String,
    #[serde(default)]
    timeout_ms: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct DelegateExternalInput {
    recipient: String,
    prompt: String,
    /// Target project coordinate, if known.
    #[serde(default)]
    project: Option<String>,
    #[serde(default)]
    timeout_ms: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct DelegateFollowupInput {
    recipient: String,
    prompt: String,
    #[serde(default)]
    timeout_ms: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct DelegatePhaseInput {
    phase: String,
    prompt: String,
    /// Defaults to the caller: same agent, next phase.
    #[serde(default)]
    recipients: Option<Vec<String>>,
}

#[async_trait]
impl Tool for DelegateTool {
    fn name(&self) -> &'static str {
        "delegate"
    }

    fn description(&self) -> String {
        "Hand a task to other agents and wait for their replies. Your turn \
         suspends until every recipient responds or the timeout fires."
            .to_string()
    }

    fn input_schema(&self) -> Value {
        json!({
            "type": "object",
            "required": ["recipients", "prompt"],
            "properties": {
                "recipients": {
                    "type": "array",
                    "items": { "type": "string" },
                    "minItems": 1,
                    "description": RECIPIENTS_SCHEMA
                },
                "prompt": { "type": "string", "description": "The task" },
                "timeout_ms": { "type": "integer", "minimum": 1 }
            }
        })
    }

    async fn run(&self, input: Value, ctx: ToolContext) -> ToolOutput {
        let input: DelegateInput = match serde_json::from_value(input) {
            Ok(i) => i,
            Err(e) => return ToolOutput::error(format!("Invalid input: {e}")),
        };
        let recipients = match resolve(&ctx, &input.recipients) {
            Ok(r) => r,
            Err(out) => return out,
        };
        delegate_and_wait(&ctx, recipients, &input.prompt, input.timeout_ms).await
    }
}

#[async_trait]
impl Tool for DelegateExternalTool {
    fn name(&self) -> &'static str {
        "delegate_external"
    }

    fn description(&self) -> String {
        "Hand a task to an agent outside this project, addressed by pubkey. \
         Waits for the reply like delegate."
            .to_string()
    }

    fn input_schema(&self) -> Value {
        json!({
            "type": "object",
            "required": ["recipient", "prompt"],
            "properties": {
                "recipient": {
                    "type": "string",
                    "description": "npub or hex pubkey of the external agent"
                },
                "prompt": { "type": "string" },
                "project": {
                    "type": "string",
                    "description": "Target project coordinate (kind:pubkey:d), if known"
                },
                "timeout_ms": { "type": "integer", "minimum": 1 }
            }
        })
    }

    async fn run(&self, input: Value, ctx: ToolContext) -> ToolOutput {
        let input: DelegateExternalInput = match serde_json::from_value(input) {
            Ok(i) => i,
            Err(e) => return ToolOutput::error(format!("Invalid input: {e}")),
        };
        // External recipients are pubkeys only; slugs are meaningless
        // outside this project.
        let Ok(recipient) = PublicKey::parse(&input.recipient) else {
            return ToolOutput::error(format!(
                "Unknown recipient {:?}: external delegation requires an npub or hex pubkey",
                input.recipient
            ));
        };
        if let Some(out) = refuse_self(&ctx, &[recipient]) {
            return out;
        }

        let extra = input.project.as_deref().and_then(|coord| {
            nostr::prelude::Coordinate::parse(coord)
                .ok()
                .map(crate::relay::tags::project_ref)
        });

        publish_and_wait(
            &ctx,
            vec![recipient],
            &input.prompt,
            input.timeout_ms,
            extra.into_iter().collect(),
            None,
        )
        .await
    }
}

#[async_trait]
impl Tool for DelegateFollowupTool {
    fn name(&self) -> &'static str {
        "delegate_followup"
    }

    fn description(&self) -> String {
        "Send a follow-up request to one agent you previously delegated to \
         and wait for the reply."
            .to_string()
    }

    fn input_schema(&self) -> Value {
        json!({
            "type": "object",
            "required": ["recipient", "prompt"],
            "properties": {
                "recipient": { "type": "string", "description": RECIPIENTS_SCHEMA },
                "prompt": { "type": "string" },
                "timeout_ms": { "type": "integer", "minimum": 1 }
            }
        })
    }

    async fn run(&self, input: Value, ctx: ToolContext) -> ToolOutput {
        let input: DelegateFollowupInput = match serde_json::from_value(input) {
            Ok(i) => i,
            Err(e) => return ToolOutput::error(format!("Invalid input: {e}")),
        };
        let recipients = match resolve(&ctx, std::slice::from_ref(&input.recipient)) {
            Ok(r) => r,
            Err(out) => return out,
        };
        delegate_and_wait(&ctx, recipients, &input.prompt, input.timeout_ms).await
    }
}

#[async_trait]
impl Tool for DelegatePhaseTool {
    fn name(&self) -> &'static str {
        "delegate_phase"
    }

    fn description(&self) -> String {
        "Transition the conversation to a new phase and hand it off. Without \
         explicit recipients the conversation comes back to you in the new \
         phase as a fresh turn. Ends your current turn immediately."
            .to_string()
    }

    fn input_schema(&self) -> Value {
        json!({
            "type": "object",
            "required": ["phase", "prompt"],
            "properties": {
                "phase": {
                    "type": "string",
                    "enum": Phase::ALL.map(|p| p.as_str())
                },
                "prompt": {
                    "type": "string",
                    "description": "Instructions for the next phase"
                },
                "recipients": {
                    "type": "array",
                    "items": { "type": "string" },
                    "description": RECIPIENTS_SCHEMA
                }
            }
        })
    }

    async fn run(&self, input: Value, ctx: ToolContext) -> ToolOutput {
        let input: DelegatePhaseInput = match serde_json::from_value(input) {
            Ok(i) => i,
            Err(e) => return ToolOutput::error(format!("Invalid input: {e}")),
        };

        if !ctx.project.is_pm(&ctx.agent) {
            return ToolOutput::error(
                "Phase transitions are reserved for the project manager",
            );
        }

        let phase: Phase = match input.phase.parse() {
            Ok(p) => p,
            Err(e) => return ToolOutput::error(e.to_string()),
        };

        let recipients = match input.recipients {
            Some(names) => match resolve_without_self_check(&ctx, &names) {
                Ok(r) => r,
                Err(out) => return out,
            },
            None => vec![ctx.agent.pubkey()],
        };

        if let Err(e) = ctx
            .project
            .set_phase(&ctx.conversation_root, phase, &input.prompt)
        {
            return ToolOutput::error(format!("Failed to record phase: {e}"));
        }

        // Prepare the hand-off requests. When a recipient is the caller
        // itself the event routes back as a fresh turn in the new phase;
        // either way this turn is done, so nobody waits.
        let requests =
            match prepare_requests(&ctx, &recipients, &input.prompt, &[], Some(phase)) {
                Ok(events) => events,
                Err(out) => return out,
            };

        let spec = DelegationSpec {
            delegator: ctx.agent.pubkey(),
            recipients,
            conversation: ctx.conversation_root.clone(),
            request_event_ids: requests.iter().map(|e| e.id.to_hex()).collect(),
            phase: Some(phase),
        };
        if let Err(e) = ctx.project.delegations().register(&spec) {
            return ToolOutput::error(e.to_string());
        }

        if let Err(out) = send_requests(&ctx, requests).await {
            return out;
        }

        ToolOutput::stop(String::new())
    }
}

// ---------------------------------------------------------------------------
// Shared plumbing
// ---------------------------------------------------------------------------

fn parse_root(ctx: &ToolContext) -> Option<nostr::prelude::EventId> {
    nostr::prelude::EventId::parse(&ctx.conversation_root).ok()
}

fn resolve(ctx: &ToolContext, names: &[String]) -> Result<Vec<PublicKey>, ToolOutput> {
    let recipients = resolve_without_self_check(ctx, names)?;
    if let Some(out) = refuse_self(ctx, &recipients) {
        return Err(out);
    }
    Ok(recipients)
}

fn resolve_without_self_check(
    ctx: &ToolContext,
    names: &[String],
) -> Result<Vec<PublicKey>, ToolOutput> {
    if names.is_empty() {
        return Err(ToolOutput::error("recipients must not be empty"));
    }
    let mut resolved = Vec::with_capacity(names.len());
    for name in names {
        match ctx.project.resolve_recipient(name) {
            Ok(pubkey) => resolved.push(pubkey),
            Err(e) => return Err(ToolOutput::error(e.to_string())),
        }
    }
    Ok(resolved)
}

fn refuse_self(ctx: &ToolContext, recipients: &[PublicKey]) -> Option<ToolOutput> {
    let own = ctx.agent.pubkey();
    recipients.contains(&own).then(|| {
        ToolOutput::error(format!(
            "SelfDelegationError: agent {:?} cannot delegate to itself; \
             use delegate_phase for a phase-transition hand-off",
            ctx.agent.slug()
        ))
    })
}

async fn delegate_and_wait(
    ctx: &ToolContext,
    recipients: Vec<PublicKey>,
    prompt: &str,
    timeout_ms: Option<u64>,
) -> ToolOutput {
    publish_and_wait(ctx, recipients, prompt, timeout_ms, Vec::new(), None).await
}

/// Sign one request event per recipient without sending yet. Registration
/// happens between signing and sending so a fast reply can never arrive
/// before its delegation exists.
fn prepare_requests(
    ctx: &ToolContext,
    recipients: &[PublicKey],
    prompt: &str,
    extra_tags: &[nostr::prelude::Tag],
    phase: Option<Phase>,
) -> Result<Vec<nostr::prelude::Event>, ToolOutput> {
    let mut events = Vec::with_capacity(recipients.len());
    for recipient in recipients {
        let request = OutboundMessage {
            conversation_root: parse_root(ctx),
            reply_to: Some(ctx.trigger.id),
            recipients: vec![*recipient],
            content: prompt.to_string(),
            phase,
            extra_tags: extra_tags.to_vec(),
        };
        match ctx.project.prepare_message(&ctx.agent, request) {
            Ok(event) => events.push(event),
            Err(e) => {
                return Err(ToolOutput::error(format!(
                    "Failed to build request: {e}"
                )))
            }
        }
    }
    Ok(events)
}

async fn send_requests(
    ctx: &ToolContext,
    requests: Vec<nostr::prelude::Event>,
) -> Result<(), ToolOutput> {
    for request in requests {
        if let Err(e) = ctx.project.send_prepared(&ctx.agent, request).await {
            // Already-registered recipients that never hear from us simply
            // time out; report the failure to the model.
            return Err(ToolOutput::error(format!(
                "Failed to publish request: {e}"
            )));
        }
    }
    Ok(())
}

async fn publish_and_wait(
    ctx: &ToolContext,
    recipients: Vec<PublicKey>,
    prompt: &str,
    timeout_ms: Option<u64>,
    extra_tags: Vec<nostr::prelude::Tag>,
    phase: Option<Phase>,
) -> ToolOutput {
    let requests = match prepare_requests(ctx, &recipients, prompt, &extra_tags, phase) {
        Ok(events) => events,
        Err(out) => return out,
    };

    let spec = DelegationSpec {
        delegator: ctx.agent.pubkey(),
        recipients,
        conversation: ctx.conversation_root.clone(),
        request_event_ids: requests.iter().map(|e| e.id.to_hex()).collect(),
        phase,
    };
    let delegation_id = match ctx.project.delegations().register(&spec) {
        Ok(id) => id,
        Err(e) => return ToolOutput::error(e.to_string()),
    };

    if let Err(out) = send_requests(ctx, requests).await {
        return out;
    }

    let timeout = timeout_ms
        .map_or(ctx.project.delegation_timeout(), Duration::from_millis);

    let outcome = tokio::select! {
        outcome = ctx
            .project
            .delegations()
            .await_completion(&delegation_id, timeout) => match outcome {
                Ok(o) => o,
                Err(e) => return ToolOutput::error(e.to_string()),
            },
        () = ctx.cancel.cancelled() => {
            return ToolOutput::error("Delegation await cancelled");
        }
    };

    format_outcome(ctx, &outcome)
}

fn format_outcome(ctx: &ToolContext, outcome: &DelegationOutcome) -> ToolOutput {
    let mut lines = Vec::with_capacity(outcome.results.len() + 1);
    let replied = outcome
        .results
        .iter()
        .filter(|r| r.status == ReplyStatus::Completed)
        .count();
    lines.push(format!(
        "Delegation {} ({replied}/{} replied{}):",
        outcome.delegation_id,
        outcome.results.len(),
        if outcome.timed_out { ", timed out" } else { "" },
    ));

    for result in &outcome.results {
        let who = ctx
            .project
            .slug_of_hex(&result.recipient)
            .unwrap_or_else(|| short_key(&result.recipient));
        match result.status {
            ReplyStatus::Completed => lines.push(format!("- {who}: {}", result.content)),
            ReplyStatus::Failed => lines.push(format!("- {who}: FAILED: {}", result.content)),
            ReplyStatus::TimedOut => lines.push(format!("- {who}: timed out, no reply")),
        }
    }

    ToolOutput {
        content: lines.join("\n"),
        is_error: false,
        control: super::ToolControl::Continue,
    }
}

fn short_key(hex: &str) -> String {
    hex.chars().take(8).collect()
}
