//! Two-tier transcript state.
//!
//! `completed_text` holds frozen window transcripts and only ever grows.
//! Within the current pending window, `confirmed` tokens are stable and
//! `provisional` tokens are replaced wholesale by each decode pass; a
//! provisional token is promoted only once it has reproduced identically at
//! its position across passes AND persisted for the configured delay.

use std::time::{Duration, Instant};

use crate::text;

#[derive(Debug, Default)]
pub struct PromotionLedger {
    completed_text: String,
    confirmed: Vec<i32>,
    provisional: Vec<i32>,
    /// One entry per provisional token: when it first appeared at its
    /// position with its current identity and prefix.
    first_seen: Vec<Instant>,
}

impl PromotionLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Merge a fresh decode result (`confirmed ++ emitted`) into the ledger.
    /// Returns the number of tokens promoted to confirmed.
    pub fn merge(&mut self, new_all_tokens: &[i32], now: Instant, delay: Duration) -> usize {
        let skip = self.confirmed.len().min(new_all_tokens.len());
        let new_raw = &new_all_tokens[skip..];

        let match_len = self
            .provisional
            .iter()
            .zip(new_raw.iter())
            .take_while(|(a, b)| a == b)
            .count();

        let mut promoted = 0;
        while promoted < match_len
            && promoted < self.first_seen.len()
            && now.duration_since(self.first_seen[promoted]) >= delay
        {
            promoted += 1;
        }

        self.confirmed.extend_from_slice(&self.provisional[..promoted]);

        let mut next_seen = Vec::with_capacity(new_raw.len() - promoted);
        for i in 0..new_raw.len() - promoted {
            let old_pos = promoted + i;
            if old_pos < match_len && old_pos < self.first_seen.len() {
                next_seen.push(self.first_seen[old_pos]);
            } else {
                next_seen.push(now);
            }
        }

        self.provisional = new_raw[promoted..].to_vec();
        self.first_seen = next_seen;
        debug_assert_eq!(self.provisional.len(), self.first_seen.len());

        promoted
    }

    pub fn confirmed_tokens(&self) -> &[i32] {
        &self.confirmed
    }

    pub fn provisional_tokens(&self) -> &[i32] {
        &self.provisional
    }

    pub fn first_seen(&self) -> &[Instant] {
        &self.first_seen
    }

    pub fn all_tokens(&self) -> Vec<i32> {
        let mut all = self.confirmed.clone();
        all.extend_from_slice(&self.provisional);
        all
    }

    pub fn completed_text(&self) -> &str {
        &self.completed_text
    }

    pub fn has_tokens(&self) -> bool {
        !self.confirmed.is_empty() || !self.provisional.is_empty()
    }

    /// Irreversibly absorb `text` into the completed transcript and clear
    /// the token state. Used at window boundaries.
    pub fn freeze(&mut self, text: &str) {
        text::append_text(&mut self.completed_text, text);
        self.clear_tokens();
    }

    pub fn clear_tokens(&mut self) {
        self.confirmed.clear();
        self.provisional.clear();
        self.first_seen.clear();
    }

    /// Promote every provisional token as-is.
    pub fn promote_all(&mut self) {
        self.confirmed.append(&mut self.provisional);
        self.first_seen.clear();
    }

    /// Replace the confirmed tokens with a final decode result and drop the
    /// provisional tail.
    pub fn set_confirmed(&mut self, tokens: Vec<i32>) {
        self.confirmed = tokens;
        self.provisional.clear();
        self.first_seen.clear();
    }
}
