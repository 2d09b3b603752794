use serde::{Deserialize, Serialize};

use crate::tool::{ToolCall, ToolResult};

/// A message in the LLM conversation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ChatMessage {
    /// User's text input.
    User(String),
    /// Assistant's response (text and/or tool calls).
    Assistant(AssistantContent),
    /// Results for every tool call of the preceding assistant message,
    /// grouped into one message as the Messages API expects.
    ToolResults(Vec<ToolResult>),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AssistantContent {
    pub text: Option<String>,
    pub tool_calls: Vec<ToolCall>,
}

impl AssistantContent {
    pub fn text_only(text: impl Into<String>) -> Self {
        Self {
            text: Some(text.into()),
            tool_calls: Vec::new(),
        }
    }
}

/// Conversation state for one turn, rebuilt from the message log each time.
/// Keeps the system prompt plus the most recent messages that fit an
/// approximate token budget, truncating from the front.
pub struct Conversation {
    system_prompt: String,
    messages: Vec<ChatMessage>,
    token_budget: usize,
}

impl Conversation {
    pub fn new(system_prompt: String, token_budget: usize) -> Self {
        Self {
            system_prompt,
            messages: Vec::new(),
            token_budget,
        }
    }

    pub fn system_prompt(&self) -> &str {
        &self.system_prompt
    }

    pub fn messages(&self) -> &[ChatMessage] {
        &self.messages
    }

    pub fn push_user(&mut self, text: impl Into<String>) {
        self.messages.push(ChatMessage::User(text.into()));
        self.truncate_to_budget();
    }

    pub fn push_assistant(&mut self, content: AssistantContent) {
        self.messages.push(ChatMessage::Assistant(content));
        self.truncate_to_budget();
    }

    pub fn push_tool_results(&mut self, results: Vec<ToolResult>) {
        self.messages.push(ChatMessage::ToolResults(results));
        self.truncate_to_budget();
    }

    pub fn push(&mut self, message: ChatMessage) {
        self.messages.push(message);
        self.truncate_to_budget();
    }

    /// Approximate token count via the chars/4 heuristic.
    pub fn approximate_tokens(&self) -> usize {
        let chars: usize = self.messages.iter().map(message_chars).sum();
        (self.system_prompt.len() + chars) / 4
    }

    /// Drop oldest messages when over budget, always keeping the two most
    /// recent (the current exchange). A `ToolResults` message must not become
    /// the front of the window — it would dangle without its tool calls.
    fn truncate_to_budget(&mut self) {
        while self.approximate_tokens() > self.token_budget && self.messages.len() > 2 {
            self.messages.remove(0);
            while matches!(self.messages.first(), Some(ChatMessage::ToolResults(_)))
                && self.messages.len() > 2
            {
                self.messages.remove(0);
            }
        }
    }
}

fn message_chars(message: &ChatMessage) -> usize {
    match message {
        ChatMessage::User(text) => text.len(),
        ChatMessage::Assistant(content) => {
            content.text.as_ref().map_or(0, |t| t.len())
                + content
                    .tool_calls
                    .iter()
                    .map(|tc| tc.input.to_string().len() + tc.name.len())
                    .sum::<usize>()
        }
        ChatMessage::ToolResults(results) => results.iter().map(|r| r.content.len()).sum(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn push_and_read_back() {
        let mut conv = Conversation::new("system".into(), 100_000);
        conv.push_user("hello");
        conv.push_assistant(AssistantContent::text_only("hi"));
        assert_eq!(conv.messages().len(), 2);
        assert_eq!(conv.system_prompt(), "system");
    }

    #[test]
    fn truncates_oldest_when_over_budget() {
        let mut conv = Conversation::new(String::new(), 25);
        for i in 0..50 {
            conv.push_user(format!("message number {i} with a bit of padding text"));
        }
        assert!(conv.messages().len() < 50);
        assert!(conv.messages().len() >= 2);
        // The newest message always survives.
        match conv.messages().last().unwrap() {
            ChatMessage::User(text) => assert!(text.contains("49")),
            other => panic!("unexpected tail: {other:?}"),
        }
    }

    #[test]
    fn truncation_never_leads_with_dangling_tool_results() {
        let mut conv = Conversation::new(String::new(), 30);
        for i in 0..20 {
            conv.push_assistant(AssistantContent {
                text: Some(format!("step {i} reasoning with some padding text here")),
                tool_calls: vec![],
            });
            conv.push_tool_results(vec![ToolResult::ok("c", "a fairly long tool result body")]);
        }
        assert!(!matches!(
            conv.messages().first(),
            Some(ChatMessage::ToolResults(_))
        ));
    }
}
