use chrono::Utc;
use serde::{Deserialize, Serialize};

use crate::ids::{EntryId, ToolUseId};

/// One immutable record in a session's conversation log.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ConversationEntry {
    pub id: EntryId,
    pub role: Role,
    pub content: EntryContent,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub author_name: Option<String>,
    pub created_at: String,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    User,
    Assistant,
    System,
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::User => write!(f, "user"),
            Self::Assistant => write!(f, "assistant"),
            Self::System => write!(f, "system"),
        }
    }
}

impl std::str::FromStr for Role {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "user" => Ok(Self::User),
            "assistant" => Ok(Self::Assistant),
            "system" => Ok(Self::System),
            other => Err(format!("unknown role: {other}")),
        }
    }
}

/// Entry content: either a plain string or an ordered block sequence.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(untagged)]
pub enum EntryContent {
    Text(String),
    Blocks(Vec<ContentBlock>),
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ContentBlock {
    #[serde(rename = "text")]
    Text { text: String },
    #[serde(rename = "tool_use")]
    ToolUse {
        id: ToolUseId,
        name: String,
        input: serde_json::Value,
    },
    #[serde(rename = "tool_result")]
    ToolResult {
        tool_use_id: ToolUseId,
        content: serde_json::Value,
        #[serde(default, skip_serializing_if = "std::ops::Not::not")]
        is_error: bool,
    },
}

impl ConversationEntry {
    pub fn new(role: Role, content: EntryContent, author_name: Option<String>) -> Self {
        Self {
            id: EntryId::new(),
            role,
            content,
            author_name,
            created_at: Utc::now().to_rfc3339(),
        }
    }

    pub fn user_text(text: impl Into<String>, author_name: impl Into<String>) -> Self {
        Self::new(
            Role::User,
            EntryContent::Text(text.into()),
            Some(author_name.into()),
        )
    }

    pub fn assistant_blocks(blocks: Vec<ContentBlock>) -> Self {
        Self::new(Role::Assistant, EntryContent::Blocks(blocks), None)
    }

    pub fn assistant_text(text: impl Into<String>) -> Self {
        Self::new(Role::Assistant, EntryContent::Text(text.into()), None)
    }

    /// Blocks view of the content; a plain string has no blocks.
    pub fn blocks(&self) -> &[ContentBlock] {
        match &self.content {
            EntryContent::Text(_) => &[],
            EntryContent::Blocks(blocks) => blocks,
        }
    }

    /// Tool-use identifiers declared by this entry.
    pub fn tool_use_ids(&self) -> Vec<&ToolUseId> {
        self.blocks()
            .iter()
            .filter_map(|b| match b {
                ContentBlock::ToolUse { id, .. } => Some(id),
                _ => None,
            })
            .collect()
    }

    pub fn has_tool_results(&self) -> bool {
        self.blocks()
            .iter()
            .any(|b| matches!(b, ContentBlock::ToolResult { .. }))
    }

    /// Concatenated text of the entry, ignoring tool blocks.
    pub fn text_content(&self) -> String {
        match &self.content {
            EntryContent::Text(text) => text.clone(),
            EntryContent::Blocks(blocks) => blocks
                .iter()
                .filter_map(|b| match b {
                    ContentBlock::Text { text } => Some(text.as_str()),
                    _ => None,
                })
                .collect::<Vec<_>>()
                .join(""),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn user_text_entry() {
        let entry = ConversationEntry::user_text("hello", "alice");
        let v = serde_json::to_value(&entry).unwrap();
        assert_eq!(v["role"], "user");
        assert_eq!(v["content"], "hello");
        assert_eq!(v["author_name"], "alice");
    }

    #[test]
    fn assistant_blocks_entry() {
        let entry = ConversationEntry::assistant_blocks(vec![
            ContentBlock::Text { text: "let me check".into() },
            ContentBlock::ToolUse {
                id: ToolUseId::new(),
                name: "read_file".into(),
                input: json!({"path": "notes.txt"}),
            },
        ]);
        let v = serde_json::to_value(&entry).unwrap();
        assert_eq!(v["role"], "assistant");
        assert_eq!(v["content"][0]["type"], "text");
        assert_eq!(v["content"][1]["type"], "tool_use");
    }

    #[test]
    fn tool_use_ids_extracted() {
        let a = ToolUseId::new();
        let b = ToolUseId::new();
        let entry = ConversationEntry::assistant_blocks(vec![
            ContentBlock::ToolUse { id: a.clone(), name: "grep".into(), input: json!({}) },
            ContentBlock::Text { text: "and".into() },
            ContentBlock::ToolUse { id: b.clone(), name: "glob".into(), input: json!({}) },
        ]);
        assert_eq!(entry.tool_use_ids(), vec![&a, &b]);
    }

    #[test]
    fn has_tool_results_detects_blocks() {
        let plain = ConversationEntry::user_text("hi", "bob");
        assert!(!plain.has_tool_results());

        let with_result = ConversationEntry::new(
            Role::User,
            EntryContent::Blocks(vec![ContentBlock::ToolResult {
                tool_use_id: ToolUseId::new(),
                content: json!("ok"),
                is_error: false,
            }]),
            None,
        );
        assert!(with_result.has_tool_results());
    }

    #[test]
    fn text_content_skips_tool_blocks() {
        let entry = ConversationEntry::assistant_blocks(vec![
            ContentBlock::Text { text: "a".into() },
            ContentBlock::ToolUse { id: ToolUseId::new(), name: "t".into(), input: json!({}) },
            ContentBlock::Text { text: "b".into() },
        ]);
        assert_eq!(entry.text_content(), "ab");
    }

    #[test]
    fn serde_roundtrip_both_content_shapes() {
        let entries = vec![
            ConversationEntry::user_text("plain", "carol"),
            ConversationEntry::assistant_blocks(vec![
                ContentBlock::Text { text: "x".into() },
                ContentBlock::ToolResult {
                    tool_use_id: ToolUseId::new(),
                    content: json!({"lines": 3}),
                    is_error: true,
                },
            ]),
        ];
        for entry in &entries {
            let json = serde_json::to_string(entry).unwrap();
            let parsed: ConversationEntry = serde_json::from_str(&json).unwrap();
            let json2 = serde_json::to_string(&parsed).unwrap();
            assert_eq!(json, json2, "roundtrip failed for {json}");
        }
    }

    #[test]
    fn role_parse_and_display() {
        assert_eq!("assistant".parse::<Role>().unwrap(), Role::Assistant);
        assert_eq!(Role::System.to_string(), "system");
        assert!("moderator".parse::<Role>().is_err());
    }
}
