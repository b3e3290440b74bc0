use parley_core::entry::{ContentBlock, ConversationEntry, EntryContent, Role};
use parley_core::repair::{repair, RepairDiagnostic};
use parley_core::wire::ClientMessage;

use crate::error::ClientError;
use crate::model::{ModelEvent, ModelService};
use crate::tools::ToolExecutor;
use crate::transport::Transport;

use futures::StreamExt;
use parley_core::error::ModelError;

const MAX_TOOL_ROUNDS: usize = 16;

/// Input the user submitted before their lock grant arrived. Held until
/// the grant, consumed exactly once, discarded on denial.
#[derive(Default)]
pub struct PendingInput {
    slot: Option<EntryContent>,
}

impl PendingInput {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stash input typed ahead of the grant. A second submission before
    /// the grant replaces the first.
    pub fn stash(&mut self, content: EntryContent) {
        if self.slot.is_some() {
            tracing::debug!("replacing pending input");
        }
        self.slot = Some(content);
    }

    /// Take the input on `lock_granted`. Empty on every call after the
    /// first.
    pub fn take(&mut self) -> Option<EntryContent> {
        self.slot.take()
    }

    /// Drop the input on `lock_denied`.
    pub fn clear(&mut self) {
        self.slot = None;
    }

    pub fn is_pending(&self) -> bool {
        self.slot.is_some()
    }
}

/// What one completed turn produced: the entries appended to the
/// conversation and any fragments the repairer had to drop along the way.
#[derive(Debug)]
pub struct TurnOutcome {
    pub entries: Vec<ConversationEntry>,
    pub repairs: Vec<RepairDiagnostic>,
}

/// Runs one full turn under a held lock: user message out, model stream
/// forwarded as chunks, tool round-trips until the model stops asking,
/// then release. The release is sent unconditionally, and before any
/// error surfaces, so a failed turn never leaves the session wedged.
pub struct TurnDriver<'a> {
    model: &'a dyn ModelService,
    tools: &'a dyn ToolExecutor,
    author: String,
}

impl<'a> TurnDriver<'a> {
    pub fn new(model: &'a dyn ModelService, tools: &'a dyn ToolExecutor, author: &str) -> Self {
        Self {
            model,
            tools,
            author: author.to_string(),
        }
    }

    pub async fn run_turn(
        &self,
        transport: &mut dyn Transport,
        history: &[ConversationEntry],
        user_content: EntryContent,
    ) -> Result<TurnOutcome, ClientError> {
        let result = self.drive(transport, history, user_content).await;

        let release = transport.send(ClientMessage::LockRelease).await;
        match result {
            Ok(outcome) => {
                release?;
                Ok(outcome)
            }
            // The turn's own error is the one worth reporting
            Err(e) => Err(e),
        }
    }

    async fn drive(
        &self,
        transport: &mut dyn Transport,
        history: &[ConversationEntry],
        user_content: EntryContent,
    ) -> Result<TurnOutcome, ClientError> {
        let mut working = history.to_vec();
        let mut repairs = Vec::new();

        transport
            .send(ClientMessage::UserMessage {
                content: user_content.clone(),
            })
            .await?;
        working.push(ConversationEntry::new(
            Role::User,
            user_content,
            Some(self.author.clone()),
        ));

        for round in 0.. {
            if round >= MAX_TOOL_ROUNDS {
                tracing::warn!(round, "tool round limit reached, ending turn");
                break;
            }

            let repaired = repair(&working);
            repairs.extend(repaired.diagnostics);

            let assistant = self.stream_completion(transport, &repaired.entries).await?;
            let tool_uses: Vec<(parley_core::ids::ToolUseId, String, serde_json::Value)> =
                assistant
                    .blocks()
                    .iter()
                    .filter_map(|b| match b {
                        ContentBlock::ToolUse { id, name, input } => {
                            Some((id.clone(), name.clone(), input.clone()))
                        }
                        _ => None,
                    })
                    .collect();
            working.push(assistant);

            if tool_uses.is_empty() {
                break;
            }

            let mut result_blocks = Vec::with_capacity(tool_uses.len());
            for (tool_use_id, name, input) in tool_uses {
                transport
                    .send(ClientMessage::ToolExecute {
                        tool_use_id: tool_use_id.clone(),
                        name: name.clone(),
                    })
                    .await?;

                // A failing tool is reported back to the model, not fatal
                let (content, is_error) = match self.tools.execute(&name, &input).await {
                    Ok(output) => (output, false),
                    Err(e) => {
                        tracing::warn!(tool = %name, error = %e, "tool execution failed");
                        (serde_json::Value::String(e.to_string()), true)
                    }
                };

                transport
                    .send(ClientMessage::ToolResult {
                        tool_use_id: tool_use_id.clone(),
                        content: content.clone(),
                        is_error,
                    })
                    .await?;

                result_blocks.push(ContentBlock::ToolResult {
                    tool_use_id,
                    content,
                    is_error,
                });
            }

            // Tool results re-enter the conversation as a user entry so
            // the next model request sees them in order
            let results_content = EntryContent::Blocks(result_blocks);
            transport
                .send(ClientMessage::UserMessage {
                    content: results_content.clone(),
                })
                .await?;
            working.push(ConversationEntry::new(
                Role::User,
                results_content,
                Some(self.author.clone()),
            ));
        }

        Ok(TurnOutcome {
            entries: working.split_off(history.len()),
            repairs,
        })
    }

    /// Stream one completion, forwarding text deltas as they arrive.
    /// Returns the assembled assistant entry.
    async fn stream_completion(
        &self,
        transport: &mut dyn Transport,
        entries: &[ConversationEntry],
    ) -> Result<ConversationEntry, ClientError> {
        let mut stream = self.model.stream(entries, &self.tools.definitions()).await?;
        while let Some(event) = stream.next().await {
            match event {
                ModelEvent::Start | ModelEvent::ToolUse { .. } => {}
                ModelEvent::TextDelta { delta } => {
                    transport
                        .send(ClientMessage::AssistantChunk { delta })
                        .await?;
                }
                ModelEvent::Done { content } => {
                    transport
                        .send(ClientMessage::AssistantComplete {
                            content: content.clone(),
                        })
                        .await?;
                    return Ok(ConversationEntry::new(
                        Role::Assistant,
                        content,
                        Some(self.author.clone()),
                    ));
                }
                ModelEvent::Error { error } => return Err(error.into()),
            }
        }
        Err(ModelError::StreamInterrupted("stream ended without completion".into()).into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parley_core::ids::ToolUseId;

    use crate::model::{MockModel, ScriptedTurn};
    use crate::tools::MockToolExecutor;
    use crate::transport::ChannelTransport;

    fn drain(harness: &mut crate::transport::TransportHarness) -> Vec<ClientMessage> {
        let mut out = Vec::new();
        while let Ok(msg) = harness.sent.try_recv() {
            out.push(msg);
        }
        out
    }

    fn kinds(msgs: &[ClientMessage]) -> Vec<&'static str> {
        msgs.iter()
            .map(|m| match m {
                ClientMessage::Connect { .. } => "connect",
                ClientMessage::SyncRequest => "sync_request",
                ClientMessage::LockRequest => "lock_request",
                ClientMessage::LockRelease => "lock_release",
                ClientMessage::UserMessage { .. } => "user_message",
                ClientMessage::AssistantChunk { .. } => "assistant_chunk",
                ClientMessage::AssistantComplete { .. } => "assistant_complete",
                ClientMessage::ToolExecute { .. } => "tool_execute",
                ClientMessage::ToolResult { .. } => "tool_result",
            })
            .collect()
    }

    #[tokio::test]
    async fn plain_turn_streams_then_releases() {
        let model = MockModel::new(vec![ScriptedTurn::text("two words")]);
        let tools = MockToolExecutor::new();
        let driver = TurnDriver::new(&model, &tools, "alice");
        let (mut transport, mut harness) = ChannelTransport::pair();

        let outcome = driver
            .run_turn(&mut transport, &[], EntryContent::Text("hi".into()))
            .await
            .unwrap();

        let sent = drain(&mut harness);
        assert_eq!(
            kinds(&sent),
            vec![
                "user_message",
                "assistant_chunk",
                "assistant_chunk",
                "assistant_complete",
                "lock_release",
            ]
        );
        assert_eq!(outcome.entries.len(), 2);
        assert_eq!(outcome.entries[0].role, Role::User);
        assert_eq!(outcome.entries[1].role, Role::Assistant);
        assert!(outcome.repairs.is_empty());
    }

    #[tokio::test]
    async fn tool_round_trip_feeds_results_back() {
        let id = ToolUseId::new();
        let model = MockModel::new(vec![
            ScriptedTurn::tool_call(
                "checking",
                id.clone(),
                "lookup",
                serde_json::json!({"q": "x"}),
            ),
            ScriptedTurn::text("found it"),
        ]);
        let tools = MockToolExecutor::new().with_tool("lookup", serde_json::json!("42"));
        let driver = TurnDriver::new(&model, &tools, "alice");
        let (mut transport, mut harness) = ChannelTransport::pair();

        let outcome = driver
            .run_turn(&mut transport, &[], EntryContent::Text("question".into()))
            .await
            .unwrap();

        let sent = drain(&mut harness);
        assert_eq!(
            kinds(&sent),
            vec![
                "user_message",
                "assistant_chunk",
                "assistant_complete",
                "tool_execute",
                "tool_result",
                "user_message",
                "assistant_chunk",
                "assistant_chunk",
                "assistant_complete",
                "lock_release",
            ]
        );
        assert_eq!(model.call_count(), 2);
        // user, assistant(tool_use), user(tool_result), assistant
        assert_eq!(outcome.entries.len(), 4);
        assert!(outcome.entries[2].has_tool_results());
    }

    #[tokio::test]
    async fn failing_tool_reports_error_result() {
        let id = ToolUseId::new();
        let model = MockModel::new(vec![
            ScriptedTurn::tool_call("trying", id, "missing_tool", serde_json::json!({})),
            ScriptedTurn::text("could not do it"),
        ]);
        let tools = MockToolExecutor::new();
        let driver = TurnDriver::new(&model, &tools, "alice");
        let (mut transport, mut harness) = ChannelTransport::pair();

        driver
            .run_turn(&mut transport, &[], EntryContent::Text("go".into()))
            .await
            .unwrap();

        let sent = drain(&mut harness);
        let result = sent
            .iter()
            .find_map(|m| match m {
                ClientMessage::ToolResult { is_error, .. } => Some(*is_error),
                _ => None,
            })
            .unwrap();
        assert!(result, "tool failure should be flagged is_error");
    }

    #[tokio::test]
    async fn model_failure_releases_lock_before_surfacing() {
        let model = MockModel::new(vec![ScriptedTurn::interrupted(
            ModelError::StreamInterrupted("carrier lost".into()),
        )]);
        let tools = MockToolExecutor::new();
        let driver = TurnDriver::new(&model, &tools, "alice");
        let (mut transport, mut harness) = ChannelTransport::pair();

        let err = driver
            .run_turn(&mut transport, &[], EntryContent::Text("hi".into()))
            .await
            .unwrap_err();
        assert!(matches!(err, ClientError::Model(_)));

        // The release went out even though the turn failed
        let sent = drain(&mut harness);
        assert_eq!(kinds(&sent).last(), Some(&"lock_release"));
    }

    #[tokio::test]
    async fn refused_model_call_still_releases() {
        let model = MockModel::new(vec![ScriptedTurn::Refuse(ModelError::Overloaded)]);
        let tools = MockToolExecutor::new();
        let driver = TurnDriver::new(&model, &tools, "alice");
        let (mut transport, mut harness) = ChannelTransport::pair();

        let err = driver
            .run_turn(&mut transport, &[], EntryContent::Text("hi".into()))
            .await
            .unwrap_err();
        assert!(matches!(err, ClientError::Model(ModelError::Overloaded)));

        let sent = drain(&mut harness);
        assert_eq!(kinds(&sent).last(), Some(&"lock_release"));
    }

    #[test]
    fn pending_input_consumed_once() {
        let mut pending = PendingInput::new();
        assert!(!pending.is_pending());

        pending.stash(EntryContent::Text("queued".into()));
        assert!(pending.is_pending());

        let first = pending.take();
        assert!(matches!(first, Some(EntryContent::Text(t)) if t == "queued"));
        assert!(pending.take().is_none());
    }

    #[test]
    fn pending_input_cleared_on_denial() {
        let mut pending = PendingInput::new();
        pending.stash(EntryContent::Text("queued".into()));
        pending.clear();
        assert!(pending.take().is_none());
    }

    #[test]
    fn later_stash_replaces_earlier() {
        let mut pending = PendingInput::new();
        pending.stash(EntryContent::Text("first".into()));
        pending.stash(EntryContent::Text("second".into()));
        assert!(matches!(
            pending.take(),
            Some(EntryContent::Text(t)) if t == "second"
        ));
    }
}
