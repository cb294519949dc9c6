//! Token usage totals.

use std::ops::AddAssign;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::event::ChatEvent;

/// Token counters for one instance or one event.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TokenUsage {
    /// Input tokens.
    pub input_tokens: u64,
    /// Output tokens.
    pub output_tokens: u64,
    /// Cache read tokens.
    pub cache_read_tokens: u64,
    /// Cache creation tokens.
    pub cache_creation_tokens: u64,
}

impl TokenUsage {
    /// Sum of every counter.
    pub fn total(&self) -> u64 {
        self.input_tokens + self.output_tokens + self.cache_read_tokens + self.cache_creation_tokens
    }

    /// `true` when every counter is zero.
    pub fn is_empty(&self) -> bool {
        self.total() == 0
    }

    /// Extract usage carried by an event.
    ///
    /// Looks at `usage` / `tokenUsage` objects first, then at top-level
    /// fields. Both camelCase and snake_case keys are accepted. Returns `None`
    /// if the event carries no usage fields at all.
    pub fn from_event(event: &ChatEvent) -> Option<Self> {
        let nested = ["usage", "tokenUsage", "token_usage"]
            .iter()
            .find_map(|key| event.payload.get(*key).filter(|v| v.is_object()));
        match nested {
            Some(obj) => read_counters(|key| obj.get(key)),
            None => read_counters(|key| event.payload.get(key)),
        }
    }
}

impl AddAssign for TokenUsage {
    fn add_assign(&mut self, rhs: Self) {
        self.input_tokens += rhs.input_tokens;
        self.output_tokens += rhs.output_tokens;
        self.cache_read_tokens += rhs.cache_read_tokens;
        self.cache_creation_tokens += rhs.cache_creation_tokens;
    }
}

fn read_counters<'a>(get: impl Fn(&str) -> Option<&'a Value>) -> Option<TokenUsage> {
    let read = |keys: &[&str]| keys.iter().find_map(|k| get(*k).and_then(Value::as_u64));
    let input = read(&["inputTokens", "input_tokens"]);
    let output = read(&["outputTokens", "output_tokens"]);
    let cache_read = read(&[
        "cacheReadInputTokens",
        "cacheReadTokens",
        "cache_read_input_tokens",
        "cache_read_tokens",
    ]);
    let cache_creation = read(&[
        "cacheCreationInputTokens",
        "cacheCreationTokens",
        "cache_creation_input_tokens",
        "cache_creation_tokens",
    ]);
    if input.is_none() && output.is_none() && cache_read.is_none() && cache_creation.is_none() {
        return None;
    }
    Some(TokenUsage {
        input_tokens: input.unwrap_or(0),
        output_tokens: output.unwrap_or(0),
        cache_read_tokens: cache_read.unwrap_or(0),
        cache_creation_tokens: cache_creation.unwrap_or(0),
    })
}
