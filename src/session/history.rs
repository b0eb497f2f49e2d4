use std::collections::VecDeque;

/// The most recent commands, oldest first
#[derive(Clone, Debug)]
pub struct CommandHistory {
    entries: VecDeque<String>,
    limit: usize,
}

impl CommandHistory {
    pub fn new(limit: usize) -> Self {
        CommandHistory {
            entries: VecDeque::with_capacity(limit.min(128)),
            limit,
        }
    }

    /// Remember a command, forgetting the oldest when full; blank ones are
    /// ignored
    pub fn push(&mut self, command: &str) {
        let command = command.trim_end_matches(|c| c == '\n' || c == '\r');
        if command.trim().is_empty() || self.limit == 0 {
            return;
        }
        while self.entries.len() >= self.limit {
            self.entries.pop_front();
        }
        self.entries.push_back(command.to_string());
    }

    pub fn entries(&self) -> Vec<String> {
        self.entries.iter().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
