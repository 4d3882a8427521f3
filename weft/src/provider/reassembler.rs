//! Streaming tool-call reassembly for the Anthropic dialect.
//!
//! A single model turn can open several `tool_use` content blocks, each keyed
//! by an integer block index. Their input JSON arrives as `input_json_delta`
//! fragments stamped with the index but not the tool id, interleaved across
//! blocks. The reassembler is an explicit state machine keyed by index: each
//! block carries its phase, tool identity, and accumulated JSON buffer, so
//! out-of-order starts and deltas cannot cross wires.

use std::collections::BTreeMap;

use tracing::{debug, warn};

use super::repair::validate_or_repair;
use crate::message::ToolCall;

/// Lifecycle of one content block.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
enum BlockPhase {
    /// Deltas arrived before the block's start event.
    #[default]
    Pending,
    Started,
    Deltas,
    Finalized,
}

/// Per-index block record.
#[derive(Debug, Default)]
struct BlockState {
    phase: BlockPhase,
    tool_id: Option<String>,
    name: Option<String>,
    json_buf: String,
    /// Validated/repaired arguments, set when the block finalizes.
    arguments: Option<String>,
}

/// Reassembles interleaved tool-use blocks into complete tool calls.
#[derive(Debug, Default)]
pub struct ToolCallReassembler {
    blocks: BTreeMap<i64, BlockState>,
}

impl ToolCallReassembler {
    pub fn new() -> Self {
        Self::default()
    }

    /// `content_block_start` with `type = tool_use`: records identity and the
    /// index mapping. Deltas that arrived early are already in the buffer and
    /// simply become attributable now.
    pub fn block_start(&mut self, index: i64, tool_id: &str, name: &str) {
        let block = self.blocks.entry(index).or_default();
        block.tool_id = Some(tool_id.to_string());
        block.name = Some(name.to_string());
        if block.phase == BlockPhase::Pending && !block.json_buf.is_empty() {
            debug!(index, tool_id, "applying early deltas to late block start");
            block.phase = BlockPhase::Deltas;
        } else {
            block.phase = BlockPhase::Started;
        }
    }

    /// `input_json_delta`: appends the fragment for this index.
    pub fn input_json_delta(&mut self, index: i64, partial: &str) {
        let block = self.blocks.entry(index).or_default();
        block.json_buf.push_str(partial);
        if block.phase == BlockPhase::Started {
            block.phase = BlockPhase::Deltas;
        }
    }

    /// `content_block_stop`: validates (repairing if needed) and freezes the
    /// block's arguments.
    pub fn block_stop(&mut self, index: i64) {
        if let Some(block) = self.blocks.get_mut(&index) {
            finalize_block(index, block);
        }
    }

    /// `message_delta` with `stop_reason = tool_use` and `message_stop`:
    /// finalize every block still open.
    pub fn finalize_all(&mut self) {
        for (index, block) in self.blocks.iter_mut() {
            if block.phase != BlockPhase::Finalized {
                finalize_block(*index, block);
            }
        }
    }

    /// Emits the completed tool calls in block-index order.
    ///
    /// Emergency recovery: when no block ever got a `tool_use` start but
    /// fragments exist, tool calls are synthesized from the fragments rather
    /// than silently dropping the model's intent.
    pub fn into_tool_calls(mut self) -> Vec<ToolCall> {
        self.finalize_all();

        let has_identified = self.blocks.values().any(|b| b.tool_id.is_some());
        let has_fragments = self.blocks.values().any(|b| !b.json_buf.is_empty());
        if !has_identified && has_fragments {
            return self.recover_from_fragments();
        }

        self.blocks
            .into_values()
            .filter_map(|block| {
                let id = block.tool_id?;
                let name = block.name.unwrap_or_default();
                let arguments = block.arguments.unwrap_or_else(|| "{}".to_string());
                Some(ToolCall::new(id, name, arguments))
            })
            .collect()
    }

    /// Whether any tool-use block has been observed (identified or not).
    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }

    fn recover_from_fragments(&mut self) -> Vec<ToolCall> {
        warn!("stream ended with unattributed tool fragments; synthesizing tool calls");
        let mut calls = Vec::new();
        for (n, (index, block)) in self.blocks.iter().enumerate() {
            if block.json_buf.is_empty() {
                continue;
            }
            let arguments = validate_or_repair(&block.json_buf);
            let name = infer_tool_name(&arguments);
            debug!(index, %name, "recovered tool call from fragments");
            calls.push(ToolCall::new(format!("alt_tc_{n}"), name, arguments));
        }
        calls
    }
}

fn finalize_block(index: i64, block: &mut BlockState) {
    if !block.json_buf.is_empty() || block.tool_id.is_some() {
        let arguments = validate_or_repair(&block.json_buf);
        block.arguments = Some(arguments);
    }
    if block.phase == BlockPhase::Pending && block.tool_id.is_none() && !block.json_buf.is_empty() {
        debug!(index, "finalized block never received its start event");
    }
    block.phase = BlockPhase::Finalized;
}

/// Best-effort tool-name inference for recovered fragments, from telltale
/// argument keys.
fn infer_tool_name(arguments: &str) -> String {
    let parsed: Option<serde_json::Value> = serde_json::from_str(arguments).ok();
    if let Some(serde_json::Value::Object(map)) = parsed {
        if map.contains_key("path") {
            return "list_directory".to_string();
        }
        if map.contains_key("query") || map.contains_key("q") {
            return "search".to_string();
        }
        if map.contains_key("command") {
            return "run_command".to_string();
        }
    }
    "unknown_tool".to_string()
}
