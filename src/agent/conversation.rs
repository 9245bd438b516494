//! Ordered transcript for one agent instance.
//!
//! A [`Conversation`] starts with the system prompt, is append-only while
//! its agent runs, and is handed to the caller afterwards for logging.
//! Appends stamp a monotonic `message_id`.

use std::collections::HashSet;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::message::{
    ChatMessage, Role, assistant_message, assistant_tool_calls_message, system_message,
    tool_message, user_message,
};
use super::tool::{ToolCall, ToolResult};

/// A violated transcript invariant.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TranscriptError {
    /// The first message is not a system prompt.
    #[error("conversation must start with a system message")]
    MissingSystemPrompt,

    /// A tool message answers an id no earlier assistant turn issued.
    #[error("message {index}: tool result for unknown call id {id}")]
    UnknownToolCallId {
        /// Message index.
        index: usize,
        /// Offending id.
        id: String,
    },

    /// A tool call id was answered more than once.
    #[error("message {index}: tool call id {id} answered twice")]
    DuplicateAnswer {
        /// Message index.
        index: usize,
        /// Offending id.
        id: String,
    },

    /// A non-tool message arrived while tool calls were unanswered.
    #[error("message {index}: {pending} tool call(s) unanswered before next turn")]
    UnansweredCalls {
        /// Message index.
        index: usize,
        /// Unanswered call count.
        pending: usize,
    },

    /// A tool message has no `tool_call_id`.
    #[error("message {index}: tool message without tool_call_id")]
    MissingToolCallId {
        /// Message index.
        index: usize,
    },

    /// An assistant turn issued the same id twice.
    #[error("message {index}: duplicate tool call id {id} within one turn")]
    DuplicateCallId {
        /// Message index.
        index: usize,
        /// Offending id.
        id: String,
    },
}

/// Ordered messages of one agent run.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(from = "StoredConversation")]
pub struct Conversation {
    messages: Vec<ChatMessage>,
    #[serde(skip)]
    next_id: u64,
}

/// Serialized form; the id counter is rebuilt from the messages.
#[derive(Deserialize)]
struct StoredConversation {
    messages: Vec<ChatMessage>,
}

impl From<StoredConversation> for Conversation {
    fn from(stored: StoredConversation) -> Self {
        let next_id = stored
            .messages
            .iter()
            .filter_map(|m| m.message_id)
            .max()
            .map_or_else(
                || u64::try_from(stored.messages.len()).unwrap_or(u64::MAX),
                |last| last.saturating_add(1),
            );
        Self {
            messages: stored.messages,
            next_id,
        }
    }
}

impl Conversation {
    /// Creates a conversation seeded with the system prompt.
    #[must_use]
    pub fn new(system_prompt: &str) -> Self {
        let mut conversation = Self::default();
        conversation.push(system_message(system_prompt));
        conversation
    }

    /// Appends a message, assigning the next `message_id`.
    pub fn push(&mut self, mut message: ChatMessage) {
        message.message_id = Some(self.next_id);
        self.next_id += 1;
        self.messages.push(message);
    }

    /// Appends a user message.
    pub fn push_user(&mut self, content: &str) {
        self.push(user_message(content));
    }

    /// Appends an assistant message, with tool calls if any.
    pub fn push_assistant(&mut self, content: &str, tool_calls: Vec<ToolCall>) {
        if tool_calls.is_empty() {
            self.push(assistant_message(content));
        } else {
            self.push(assistant_tool_calls_message(content, tool_calls));
        }
    }

    /// Appends one tool message per result, in the given order.
    pub fn push_tool_results(&mut self, results: &[ToolResult]) {
        for result in results {
            self.push(tool_message(
                &result.tool_call_id,
                &result.content,
                result.is_error,
            ));
        }
    }

    /// Messages in order.
    #[must_use]
    pub fn messages(&self) -> &[ChatMessage] {
        &self.messages
    }

    /// Number of messages including the system prompt.
    #[must_use]
    pub const fn len(&self) -> usize {
        self.messages.len()
    }

    /// Returns `true` if no messages were appended.
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    /// Text of the most recent assistant message with non-empty content.
    #[must_use]
    pub fn last_assistant_text(&self) -> Option<&str> {
        self.messages
            .iter()
            .rev()
            .filter(|m| m.role == Role::Assistant)
            .map(|m| m.content.trim())
            .find(|c| !c.is_empty())
    }

    /// Consumes the conversation, returning its messages.
    #[must_use]
    pub fn into_messages(self) -> Vec<ChatMessage> {
        self.messages
    }

    /// Checks the tool-call pairing invariant.
    ///
    /// Every tool message must answer an id issued by an earlier assistant
    /// message, each id is answered exactly once, and all ids of a turn are
    /// answered before the next non-tool message. Trailing unanswered calls
    /// are allowed only when `allow_pending_tail` is set (a run that stopped
    /// mid-turn).
    ///
    /// # Errors
    ///
    /// Returns the first [`TranscriptError`] found.
    pub fn validate(&self, allow_pending_tail: bool) -> Result<(), TranscriptError> {
        if self.messages.first().map(|m| m.role) != Some(Role::System) {
            return Err(TranscriptError::MissingSystemPrompt);
        }

        let mut issued: HashSet<&str> = HashSet::new();
        let mut pending: HashSet<&str> = HashSet::new();

        for (index, msg) in self.messages.iter().enumerate() {
            match msg.role {
                Role::Tool => {
                    let id = msg
                        .tool_call_id
                        .as_deref()
                        .ok_or(TranscriptError::MissingToolCallId { index })?;
                    if !issued.contains(id) {
                        return Err(TranscriptError::UnknownToolCallId {
                            index,
                            id: id.to_string(),
                        });
                    }
                    if !pending.remove(id) {
                        return Err(TranscriptError::DuplicateAnswer {
                            index,
                            id: id.to_string(),
                        });
                    }
                }
                Role::System | Role::User | Role::Assistant => {
                    if !pending.is_empty() {
                        return Err(TranscriptError::UnansweredCalls {
                            index,
                            pending: pending.len(),
                        });
                    }
                    for call in &msg.tool_calls {
                        if !issued.insert(call.id.as_str()) {
                            return Err(TranscriptError::DuplicateCallId {
                                index,
                                id: call.id.clone(),
                            });
                        }
                        pending.insert(call.id.as_str());
                    }
                }
            }
        }

        if !pending.is_empty() && !allow_pending_tail {
            return Err(TranscriptError::UnansweredCalls {
                index: self.messages.len(),
                pending: pending.len(),
            });
        }
        Ok(())
    }
}
