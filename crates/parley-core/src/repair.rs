//! Conversation-integrity repair.
//!
//! Model services reject a replayed history in which a tool-result block is
//! not answered by a tool-use block in the immediately preceding assistant
//! entry. Each participant runs this pass locally over the reconstructed log
//! after every sync, before building its next model request.

use std::collections::HashSet;

use crate::entry::{ContentBlock, ConversationEntry, EntryContent, Role};
use crate::ids::{EntryId, ToolUseId};

/// Why a fragment was removed during repair.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RepairDiagnostic {
    /// A user entry carried tool results but the preceding repaired entry
    /// was missing or not an assistant entry.
    NoPrecedingAssistant { entry_id: EntryId },
    /// A tool-result block referenced an id the preceding assistant entry
    /// never issued.
    OrphanToolResult {
        entry_id: EntryId,
        tool_use_id: ToolUseId,
    },
    /// Filtering left the entry with no content at all.
    EmptyAfterFilter { entry_id: EntryId },
}

#[derive(Debug, Default)]
pub struct RepairOutcome {
    pub entries: Vec<ConversationEntry>,
    pub diagnostics: Vec<RepairDiagnostic>,
}

impl RepairOutcome {
    pub fn is_clean(&self) -> bool {
        self.diagnostics.is_empty()
    }
}

/// Walk the ordered log and drop tool-result fragments that cannot be
/// causally justified. Entries without tool results pass through unchanged,
/// in order, role intact.
pub fn repair(entries: &[ConversationEntry]) -> RepairOutcome {
    let mut outcome = RepairOutcome::default();

    for entry in entries {
        if entry.role != Role::User || !entry.has_tool_results() {
            outcome.entries.push(entry.clone());
            continue;
        }

        // Anchor against the repaired sequence, not the raw one: an earlier
        // drop may have changed which entry precedes this one.
        let anchor: Option<HashSet<&ToolUseId>> = outcome
            .entries
            .last()
            .filter(|prev| prev.role == Role::Assistant)
            .map(|prev| prev.tool_use_ids().into_iter().collect());

        let Some(issued) = anchor else {
            tracing::debug!(entry_id = %entry.id, "dropping tool results with no preceding assistant entry");
            outcome
                .diagnostics
                .push(RepairDiagnostic::NoPrecedingAssistant {
                    entry_id: entry.id.clone(),
                });
            continue;
        };

        let mut kept = Vec::new();
        for block in entry.blocks() {
            match block {
                ContentBlock::ToolResult { tool_use_id, .. } => {
                    if issued.contains(tool_use_id) {
                        kept.push(block.clone());
                    } else {
                        tracing::debug!(
                            entry_id = %entry.id,
                            tool_use_id = %tool_use_id,
                            "dropping orphan tool result"
                        );
                        outcome.diagnostics.push(RepairDiagnostic::OrphanToolResult {
                            entry_id: entry.id.clone(),
                            tool_use_id: tool_use_id.clone(),
                        });
                    }
                }
                other => kept.push(other.clone()),
            }
        }

        if kept.is_empty() {
            outcome.diagnostics.push(RepairDiagnostic::EmptyAfterFilter {
                entry_id: entry.id.clone(),
            });
            continue;
        }

        let mut repaired = entry.clone();
        repaired.content = EntryContent::Blocks(kept);
        outcome.entries.push(repaired);
    }

    outcome
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn assistant_with_tools(ids: &[&ToolUseId]) -> ConversationEntry {
        ConversationEntry::assistant_blocks(
            ids.iter()
                .map(|id| ContentBlock::ToolUse {
                    id: (*id).clone(),
                    name: "read_file".into(),
                    input: json!({}),
                })
                .collect(),
        )
    }

    fn user_with_results(ids: &[&ToolUseId]) -> ConversationEntry {
        ConversationEntry::new(
            Role::User,
            EntryContent::Blocks(
                ids.iter()
                    .map(|id| ContentBlock::ToolResult {
                        tool_use_id: (*id).clone(),
                        content: json!("ok"),
                        is_error: false,
                    })
                    .collect(),
            ),
            None,
        )
    }

    #[test]
    fn plain_entries_pass_through() {
        let log = vec![
            ConversationEntry::user_text("hello", "alice"),
            ConversationEntry::assistant_text("hi"),
        ];
        let outcome = repair(&log);
        assert!(outcome.is_clean());
        assert_eq!(outcome.entries.len(), 2);
        assert_eq!(outcome.entries[0].text_content(), "hello");
    }

    #[test]
    fn matched_results_kept_orphans_filtered() {
        let a = ToolUseId::new();
        let b = ToolUseId::new();
        let c = ToolUseId::new();
        let log = vec![
            assistant_with_tools(&[&a, &b]),
            user_with_results(&[&a, &c]),
        ];

        let outcome = repair(&log);
        assert_eq!(outcome.entries.len(), 2);
        let results = outcome.entries[1].blocks();
        assert_eq!(results.len(), 1);
        match &results[0] {
            ContentBlock::ToolResult { tool_use_id, .. } => assert_eq!(tool_use_id, &a),
            other => panic!("unexpected block: {other:?}"),
        }
        assert_eq!(
            outcome.diagnostics,
            vec![RepairDiagnostic::OrphanToolResult {
                entry_id: log[1].id.clone(),
                tool_use_id: c,
            }]
        );
    }

    #[test]
    fn all_orphans_drops_entry() {
        let a = ToolUseId::new();
        let c = ToolUseId::new();
        let log = vec![assistant_with_tools(&[&a]), user_with_results(&[&c])];

        let outcome = repair(&log);
        assert_eq!(outcome.entries.len(), 1);
        assert_eq!(outcome.entries[0].role, Role::Assistant);
        assert!(outcome
            .diagnostics
            .iter()
            .any(|d| matches!(d, RepairDiagnostic::EmptyAfterFilter { .. })));
    }

    #[test]
    fn results_without_preceding_assistant_dropped() {
        let c = ToolUseId::new();
        let log = vec![
            ConversationEntry::user_text("hello", "alice"),
            user_with_results(&[&c]),
        ];

        let outcome = repair(&log);
        assert_eq!(outcome.entries.len(), 1);
        assert_eq!(
            outcome.diagnostics,
            vec![RepairDiagnostic::NoPrecedingAssistant {
                entry_id: log[1].id.clone(),
            }]
        );
    }

    #[test]
    fn results_at_log_start_dropped() {
        let c = ToolUseId::new();
        let log = vec![user_with_results(&[&c])];
        let outcome = repair(&log);
        assert!(outcome.entries.is_empty());
        assert_eq!(outcome.diagnostics.len(), 1);
    }

    #[test]
    fn anchor_is_repaired_sequence_not_raw() {
        // Raw: assistant{a}, user{orphan} (dropped), user{a}.
        // After the middle entry is dropped, the last entry's predecessor in
        // the repaired sequence is the assistant entry, so `a` is justified.
        let a = ToolUseId::new();
        let orphan = ToolUseId::new();
        let log = vec![
            assistant_with_tools(&[&a]),
            user_with_results(&[&orphan]),
            user_with_results(&[&a]),
        ];

        let outcome = repair(&log);
        assert_eq!(outcome.entries.len(), 2);
        assert_eq!(outcome.entries[1].blocks().len(), 1);
    }

    #[test]
    fn non_result_blocks_pass_through_filter() {
        let a = ToolUseId::new();
        let orphan = ToolUseId::new();
        let mixed = ConversationEntry::new(
            Role::User,
            EntryContent::Blocks(vec![
                ContentBlock::Text { text: "context".into() },
                ContentBlock::ToolResult {
                    tool_use_id: a.clone(),
                    content: json!("ok"),
                    is_error: false,
                },
                ContentBlock::ToolResult {
                    tool_use_id: orphan.clone(),
                    content: json!("stale"),
                    is_error: false,
                },
            ]),
            None,
        );
        let log = vec![assistant_with_tools(&[&a]), mixed];

        let outcome = repair(&log);
        let blocks = outcome.entries[1].blocks();
        assert_eq!(blocks.len(), 2);
        assert!(matches!(blocks[0], ContentBlock::Text { .. }));
        assert!(matches!(blocks[1], ContentBlock::ToolResult { .. }));
    }

    #[test]
    fn ordering_and_roles_preserved() {
        let a = ToolUseId::new();
        let log = vec![
            ConversationEntry::user_text("q", "bob"),
            assistant_with_tools(&[&a]),
            user_with_results(&[&a]),
            ConversationEntry::assistant_text("done"),
        ];
        let outcome = repair(&log);
        assert!(outcome.is_clean());
        let roles: Vec<Role> = outcome.entries.iter().map(|e| e.role).collect();
        assert_eq!(roles, vec![Role::User, Role::Assistant, Role::User, Role::Assistant]);
    }
}
