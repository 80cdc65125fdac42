//! # Binding and Routing Key Grammar
//!
//! Routing keys are dot-separated word tokens (`orders.created`). Binding
//! keys add two wildcards: `*` matches exactly one token, `#` matches one
//! or more tokens. Matching is anchored to the whole key.
//!
//! Patterns are compiled to a token list and matched with a backtracking
//! token walker rather than a regex engine, so pattern complexity cannot
//! trigger catastrophic backtracking in a general-purpose matcher.

/// Single-token wildcard.
const WILDCARD_ONE: &str = "*";

/// Multi-token wildcard (one or more tokens).
const WILDCARD_MANY: &str = "#";

/// True if the token is a non-empty word: ASCII letters, digits, underscore.
fn is_word(token: &str) -> bool {
    !token.is_empty()
        && token
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_')
}

/// Validate a routing key: one or more dot-separated word tokens.
///
/// Routing keys never contain wildcards.
#[must_use]
pub fn is_valid_routing_key(key: &str) -> bool {
    !key.is_empty() && key.split('.').all(is_word)
}

/// Validate a binding key.
///
/// Every token must be a word, `*`, or `#`, and the adjacent wildcard
/// pairs `#.*`, `*.#`, and `#.#` are rejected as ambiguous spans.
#[must_use]
pub fn is_valid_binding_key(key: &str) -> bool {
    if key.is_empty() {
        return false;
    }
    let tokens: Vec<&str> = key.split('.').collect();
    if !tokens
        .iter()
        .all(|t| is_word(t) || *t == WILDCARD_ONE || *t == WILDCARD_MANY)
    {
        return false;
    }
    !tokens.windows(2).any(|pair| {
        matches!(
            (pair[0], pair[1]),
            ("#", "*") | ("*", "#") | ("#", "#")
        )
    })
}

/// One compiled token of a binding pattern.
#[derive(Debug, Clone, PartialEq, Eq)]
enum PatternToken {
    /// Matches exactly this word.
    Literal(String),
    /// `*`: matches exactly one word token.
    AnyOne,
    /// `#`: matches one or more word tokens.
    AnyMany,
}

/// A binding key compiled for repeated matching.
///
/// Binding keys are registered once and matched against every inbound
/// routing key, so the tokenization happens at registration time and the
/// compiled form is kept alongside the handler.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BindingPattern {
    raw: String,
    tokens: Vec<PatternToken>,
}

impl BindingPattern {
    /// Compile a binding key. Returns `None` when the key fails
    /// [`is_valid_binding_key`].
    #[must_use]
    pub fn compile(binding_key: &str) -> Option<Self> {
        if !is_valid_binding_key(binding_key) {
            return None;
        }
        let tokens = binding_key
            .split('.')
            .map(|t| match t {
                WILDCARD_ONE => PatternToken::AnyOne,
                WILDCARD_MANY => PatternToken::AnyMany,
                word => PatternToken::Literal(word.to_string()),
            })
            .collect();
        Some(Self {
            raw: binding_key.to_string(),
            tokens,
        })
    }

    /// The original binding key text.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.raw
    }

    /// Test a routing key against this pattern.
    ///
    /// The match is anchored: the whole routing key must be consumed.
    /// Invalid (including empty) routing keys never match; `#` requires
    /// at least one token, so `#` does not match an empty key.
    #[must_use]
    pub fn matches(&self, routing_key: &str) -> bool {
        if !is_valid_routing_key(routing_key) {
            return false;
        }
        let segments: Vec<&str> = routing_key.split('.').collect();
        match_tokens(&self.tokens, &segments)
    }
}

/// Recursive backtracking walk over pattern tokens and key segments.
fn match_tokens(pattern: &[PatternToken], segments: &[&str]) -> bool {
    let Some((head, rest)) = pattern.split_first() else {
        return segments.is_empty();
    };
    match head {
        PatternToken::Literal(word) => segments
            .split_first()
            .is_some_and(|(seg, tail)| seg == word && match_tokens(rest, tail)),
        PatternToken::AnyOne => segments
            .split_first()
            .is_some_and(|(_, tail)| match_tokens(rest, tail)),
        // `#` consumes at least one segment, then tries every split point.
        PatternToken::AnyMany => {
            (1..=segments.len()).any(|n| match_tokens(rest, &segments[n..]))
        }
    }
}

/// One-shot convenience: compile and test in a single call.
///
/// Invalid binding keys match nothing.
#[must_use]
pub fn matches(binding_key: &str, routing_key: &str) -> bool {
    BindingPattern::compile(binding_key).is_some_and(|p| p.matches(routing_key))
}
