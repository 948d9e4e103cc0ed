//! Token accounting for model calls, per turn and per session.

use std::{
    collections::HashMap,
    sync::{Mutex, PoisonError},
};

use coda_ai::ChatUsage;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
/// Token totals over a series of model calls.
pub struct TokenUsage {
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub total_tokens: u64,
    pub requests: u64,
}

impl TokenUsage {
    /// Adds one model response's usage.
    pub fn record(&mut self, usage: &ChatUsage) {
        self.input_tokens = self.input_tokens.saturating_add(usage.input_tokens);
        self.output_tokens = self.output_tokens.saturating_add(usage.output_tokens);
        self.total_tokens = self.total_tokens.saturating_add(usage.total_tokens);
        self.requests = self.requests.saturating_add(1);
    }

    pub fn merge(&mut self, other: &TokenUsage) {
        self.input_tokens = self.input_tokens.saturating_add(other.input_tokens);
        self.output_tokens = self.output_tokens.saturating_add(other.output_tokens);
        self.total_tokens = self.total_tokens.saturating_add(other.total_tokens);
        self.requests = self.requests.saturating_add(other.requests);
    }

    pub fn average_tokens_per_request(&self) -> f64 {
        if self.requests == 0 {
            return 0.0;
        }
        self.total_tokens as f64 / self.requests as f64
    }
}

/// Cumulative usage per session id for the lifetime of the tracker.
///
/// Calls that complete inside a turn that later aborts are still counted.
#[derive(Debug, Default)]
pub struct TokenTracker {
    sessions: Mutex<HashMap<String, TokenUsage>>,
}

impl TokenTracker {
    pub fn record(&self, session_id: &str, usage: &ChatUsage) {
        let mut sessions = self.sessions.lock().unwrap_or_else(PoisonError::into_inner);
        sessions
            .entry(session_id.to_string())
            .or_default()
            .record(usage);
    }

    pub fn session_usage(&self, session_id: &str) -> Option<TokenUsage> {
        let sessions = self.sessions.lock().unwrap_or_else(PoisonError::into_inner);
        sessions.get(session_id).copied()
    }

    /// Sum over every tracked session.
    pub fn total_usage(&self) -> TokenUsage {
        let sessions = self.sessions.lock().unwrap_or_else(PoisonError::into_inner);
        sessions
            .values()
            .fold(TokenUsage::default(), |mut total, usage| {
                total.merge(usage);
                total
            })
    }
}
