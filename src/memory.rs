use crate::message::{Message, Role};

/// In-memory transcript for a single run.
#[derive(Default, Clone, Debug)]
pub struct ConversationMemory {
    messages: Vec<Message>,
}

impl ConversationMemory {
    pub fn with_messages(messages: Vec<Message>) -> Self {
        Self { messages }
    }

    pub fn push(&mut self, message: Message) {
        self.messages.push(message);
    }

    pub fn iter(&self) -> impl DoubleEndedIterator<Item = &Message> + '_ {
        self.messages.iter()
    }

    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    /// Messages appended after position `start`.
    pub fn since(&self, start: usize) -> &[Message] {
        &self.messages[start.min(self.messages.len())..]
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }
}

/// Decides which part of the history is sent to the model.
pub trait MemoryStrategy: Send + Sync {
    fn get_context_messages(&self, messages: &[Message]) -> Vec<Message>;

    fn name(&self) -> &str;
}

#[derive(Clone, Default)]
pub struct FullMemoryStrategy;

impl MemoryStrategy for FullMemoryStrategy {
    fn get_context_messages(&self, messages: &[Message]) -> Vec<Message> {
        messages.to_vec()
    }

    fn name(&self) -> &str {
        "full"
    }
}

/// Keep system messages plus the last N others.
///
/// The window never starts on a tool result, so a result is always preceded
/// by the call that produced it.
#[derive(Clone)]
pub struct WindowedMemoryStrategy {
    window_size: usize,
}

impl WindowedMemoryStrategy {
    pub fn new(window_size: usize) -> Self {
        Self {
            window_size: window_size.max(1),
        }
    }
}

impl MemoryStrategy for WindowedMemoryStrategy {
    fn get_context_messages(&self, messages: &[Message]) -> Vec<Message> {
        let non_system: Vec<&Message> = messages
            .iter()
            .filter(|m| m.role != Role::System)
            .collect();
        if non_system.len() <= self.window_size {
            return messages.to_vec();
        }

        let mut start = non_system.len() - self.window_size;
        while start < non_system.len() && non_system[start].role == Role::Tool {
            start += 1;
        }

        let mut result: Vec<Message> = messages
            .iter()
            .filter(|m| m.role == Role::System)
            .cloned()
            .collect();
        result.extend(non_system[start..].iter().map(|m| (*m).clone()));
        result
    }

    fn name(&self) -> &str {
        "windowed"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn windowed_strategy_keeps_system_and_recent_turns() {
        let messages = vec![
            Message::system("Tu es un assistant."),
            Message::user("Bonjour"),
            Message::assistant("Bonjour !"),
            Message::user("Mon colis est en retard"),
            Message::assistant("Je regarde."),
            Message::user("Merci"),
            Message::assistant("Avec plaisir"),
        ];

        let context = WindowedMemoryStrategy::new(4).get_context_messages(&messages);

        assert_eq!(context.len(), 5);
        assert_eq!(context[0].content, "Tu es un assistant.");
        assert_eq!(context[1].content, "Mon colis est en retard");
    }

    #[test]
    fn window_does_not_start_on_a_tool_result() {
        let messages = vec![
            Message::user("heure ?"),
            Message::assistant("..."),
            Message::tool("current_time", json!({"utc": "t"}), None),
            Message::assistant("Il est midi"),
        ];

        let context = WindowedMemoryStrategy::new(2).get_context_messages(&messages);

        assert_eq!(context.len(), 1);
        assert_eq!(context[0].content, "Il est midi");
    }

    #[test]
    fn since_returns_the_tail() {
        let mut memory = ConversationMemory::default();
        memory.push(Message::user("a"));
        memory.push(Message::assistant("b"));
        assert_eq!(memory.since(1).len(), 1);
        assert!(memory.since(5).is_empty());
        assert_eq!(FullMemoryStrategy.get_context_messages(memory.messages()).len(), 2);
    }
}
