//! Banned-word moderation filter.

/// Case-insensitive substring filter over a configured word list.
pub struct WordFilter {
    words: Vec<String>,
}

impl WordFilter {
    /// Words are stored lowercased; an empty list allows everything.
    pub fn new(words: Vec<String>) -> Self {
        Self { words: words.into_iter().map(|w| w.to_lowercase()).collect() }
    }

    pub fn is_allowed(&self, content: &str) -> bool {
        if self.words.is_empty() {
            return true;
        }
        let lowered = content.to_lowercase();
        !self.words.iter().any(|word| lowered.contains(word))
    }
}
