use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use futures::{stream, Stream};

use parley_core::entry::{ContentBlock, ConversationEntry, EntryContent};
use parley_core::error::ModelError;
use parley_core::ids::ToolUseId;

/// A tool capability declared to the model alongside the conversation.
#[derive(Clone, Debug)]
pub struct ToolDefinition {
    pub name: String,
    pub description: String,
    pub input_schema: serde_json::Value,
}

/// Incremental output of one model request.
#[derive(Clone, Debug)]
pub enum ModelEvent {
    Start,
    TextDelta { delta: String },
    ToolUse {
        id: ToolUseId,
        name: String,
        input: serde_json::Value,
    },
    /// Terminal event carrying the assembled assistant content.
    Done { content: EntryContent },
    Error { error: ModelError },
}

pub type ModelStream = Pin<Box<dyn Stream<Item = ModelEvent> + Send>>;

/// The upstream language-model boundary. The relay never interprets model
/// output beyond the event shapes here; everything else is opaque.
#[async_trait]
pub trait ModelService: Send + Sync {
    fn name(&self) -> &str;

    /// Stream one completion for the given conversation, declaring the
    /// tools the model may call. The caller is expected to have run the
    /// integrity repairer over `entries` first.
    async fn stream(
        &self,
        entries: &[ConversationEntry],
        tools: &[ToolDefinition],
    ) -> Result<ModelStream, ModelError>;
}

/// One pre-programmed reply for [`MockModel`].
#[derive(Clone)]
pub enum ScriptedTurn {
    /// Yield these events verbatim.
    Events(Vec<ModelEvent>),
    /// Fail the `stream` call itself.
    Refuse(ModelError),
}

impl ScriptedTurn {
    /// A plain text reply, streamed as word-sized deltas.
    pub fn text(text: &str) -> Self {
        let mut events = vec![ModelEvent::Start];
        for word in text.split_inclusive(' ') {
            events.push(ModelEvent::TextDelta {
                delta: word.to_string(),
            });
        }
        events.push(ModelEvent::Done {
            content: EntryContent::Text(text.to_string()),
        });
        Self::Events(events)
    }

    /// A reply that requests one tool call alongside some text.
    pub fn tool_call(text: &str, tool_use_id: ToolUseId, name: &str, input: serde_json::Value) -> Self {
        let blocks = vec![
            ContentBlock::Text {
                text: text.to_string(),
            },
            ContentBlock::ToolUse {
                id: tool_use_id.clone(),
                name: name.to_string(),
                input: input.clone(),
            },
        ];
        Self::Events(vec![
            ModelEvent::Start,
            ModelEvent::TextDelta {
                delta: text.to_string(),
            },
            ModelEvent::ToolUse {
                id: tool_use_id,
                name: name.to_string(),
                input,
            },
            ModelEvent::Done {
                content: EntryContent::Blocks(blocks),
            },
        ])
    }

    /// A stream that starts, then dies with the given error.
    pub fn interrupted(error: ModelError) -> Self {
        Self::Events(vec![ModelEvent::Start, ModelEvent::Error { error }])
    }
}

/// Deterministic model double that plays scripted turns in order. Calls
/// beyond the script fail with `InvalidRequest`.
pub struct MockModel {
    script: Vec<ScriptedTurn>,
    call_count: AtomicUsize,
}

impl MockModel {
    pub fn new(script: Vec<ScriptedTurn>) -> Self {
        Self {
            script,
            call_count: AtomicUsize::new(0),
        }
    }

    pub fn call_count(&self) -> usize {
        self.call_count.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl ModelService for MockModel {
    fn name(&self) -> &str {
        "mock"
    }

    async fn stream(
        &self,
        _entries: &[ConversationEntry],
        _tools: &[ToolDefinition],
    ) -> Result<ModelStream, ModelError> {
        let idx = self.call_count.fetch_add(1, Ordering::Relaxed);
        match self.script.get(idx) {
            Some(ScriptedTurn::Events(events)) => Ok(Box::pin(stream::iter(events.clone()))),
            Some(ScriptedTurn::Refuse(error)) => Err(error.clone()),
            None => Err(ModelError::InvalidRequest(format!(
                "no scripted turn for call {idx}"
            ))),
        }
    }
}
