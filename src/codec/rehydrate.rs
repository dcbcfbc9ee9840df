//! Rehydration: replace tokens with their original glyph runs.
//!
//! Any token without a mapping entry is a hard failure; a partial output
//! file is never written.

use std::collections::BTreeSet;
use std::sync::LazyLock;

use regex::Regex;

use crate::error::{LocPipeError, Result};

use super::map::PlaceholderMap;

static TOKEN_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"⟦(PH_\d+|TAG_\d+)⟧").expect("token regex is valid"));

/// Multiset of token names in a text, keyed by name with occurrence
/// counts. Two texts with equal signatures carry the same tokens.
pub fn token_signature(text: &str) -> std::collections::BTreeMap<String, usize> {
    let mut counts = std::collections::BTreeMap::new();
    for caps in TOKEN_RE.captures_iter(text) {
        *counts.entry(caps[1].to_string()).or_insert(0) += 1;
    }
    counts
}

/// Restores original glyphs from one freeze pass's map.
pub struct Rehydrator<'a> {
    map: &'a PlaceholderMap,
    tokens_restored: u64,
}

impl<'a> Rehydrator<'a> {
    pub fn new(map: &'a PlaceholderMap) -> Self {
        Self {
            map,
            tokens_restored: 0,
        }
    }

    /// Token names present in a text.
    pub fn extract_tokens(text: &str) -> BTreeSet<String> {
        TOKEN_RE
            .captures_iter(text)
            .map(|c| c[1].to_string())
            .collect()
    }

    /// Replace every token in `text` with its original. Fails on the first
    /// token missing from the map.
    pub fn rehydrate_text(&mut self, text: &str, string_id: &str, row: usize) -> Result<String> {
        if text.is_empty() {
            return Ok(String::new());
        }

        for token in Self::extract_tokens(text) {
            if !self.map.contains(&token) {
                return Err(LocPipeError::UnknownToken {
                    token,
                    row,
                    string_id: string_id.to_string(),
                });
            }
        }

        let mut restored = 0u64;
        let result = TOKEN_RE.replace_all(text, |caps: &regex::Captures| {
            restored += 1;
            // Presence was checked above.
            self.map.get(&caps[1]).unwrap_or("").to_string()
        });
        self.tokens_restored += restored;
        Ok(result.into_owned())
    }

    /// Running total of token occurrences restored by this rehydrator.
    pub fn tokens_restored(&self) -> u64 {
        self.tokens_restored
    }
}
