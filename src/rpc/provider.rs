//! Per-provider runtime state: budget, cooldown, and error scoring.
//!
//! State transitions: healthy -> cooldown on a 429 or on consecutive
//! failures; cooldown -> healthy automatically once `cooldown_until` passes;
//! disabled only by explicit admin action. Consecutive successes decay the
//! error score geometrically so a recovered provider regains selection bias.

use serde::Serialize;

use crate::config::ProviderConfig;

/// Consecutive failures that push a provider into cooldown.
const COOLDOWN_FAILURE_THRESHOLD: u32 = 3;
/// Error-score decay applied on each success.
const ERROR_SCORE_DECAY: f64 = 0.5;

#[derive(Debug)]
pub struct ProviderState {
    pub config: ProviderConfig,
    pub request_count: u64,
    pub error_count: u64,
    pub in_flight: u32,
    pub consecutive_failures: u32,
    pub last_error: Option<String>,
    /// Unix millis; selectable only when `now >= cooldown_until`.
    pub cooldown_until: i64,
    pub enabled: bool,
    /// Decaying failure weight used for selection bias.
    error_score: f64,
    /// Sliding one-minute request budget.
    minute_index: i64,
    minute_requests: u32,
}

impl ProviderState {
    pub fn new(config: ProviderConfig) -> Self {
        let enabled = config.enabled;
        Self {
            config,
            request_count: 0,
            error_count: 0,
            in_flight: 0,
            consecutive_failures: 0,
            last_error: None,
            cooldown_until: 0,
            enabled,
            error_score: 0.0,
            minute_index: 0,
            minute_requests: 0,
        }
    }

    pub fn provider_id(&self) -> &str {
        &self.config.provider_id
    }

    pub fn is_selectable(&self, now_ms: i64) -> bool {
        self.enabled && now_ms >= self.cooldown_until
    }

    /// True when another request fits in the current minute's budget.
    pub fn has_budget(&self, now_ms: i64) -> bool {
        let minute = now_ms / 60_000;
        minute != self.minute_index || self.minute_requests < self.config.rate_limit
    }

    /// Consume one budget token. Callers check `has_budget` first; this
    /// returns false when the bucket emptied in between.
    pub fn consume_budget(&mut self, now_ms: i64) -> bool {
        let minute = now_ms / 60_000;
        if minute != self.minute_index {
            self.minute_index = minute;
            self.minute_requests = 0;
        }
        if self.minute_requests >= self.config.rate_limit {
            return false;
        }
        self.minute_requests += 1;
        true
    }

    /// Budget tokens for follow-up calls made on an already-acquired slot
    /// (block timestamp lookups). Best-effort: saturates at the limit so the
    /// minute counter stays truthful without failing the batch.
    pub fn consume_extra(&mut self, now_ms: i64, count: u32) {
        let minute = now_ms / 60_000;
        if minute != self.minute_index {
            self.minute_index = minute;
            self.minute_requests = 0;
        }
        self.minute_requests = self
            .minute_requests
            .saturating_add(count)
            .min(self.config.rate_limit.saturating_mul(2));
        self.request_count += count as u64;
    }

    /// Selection weight: configured weight biased down by load and by recent
    /// errors.
    pub fn selection_score(&self) -> f64 {
        let base = self.config.weight.max(1) as f64;
        base / (1.0 + self.in_flight as f64) / (1.0 + self.error_score)
    }

    pub fn begin_request(&mut self) {
        self.in_flight += 1;
        self.request_count += 1;
    }

    pub fn on_success(&mut self) {
        self.in_flight = self.in_flight.saturating_sub(1);
        self.consecutive_failures = 0;
        self.error_score *= ERROR_SCORE_DECAY;
        if self.error_score < 0.01 {
            self.error_score = 0.0;
        }
    }

    pub fn on_failure(&mut self, now_ms: i64, rate_limited: bool, message: &str) {
        self.in_flight = self.in_flight.saturating_sub(1);
        self.error_count += 1;
        self.consecutive_failures += 1;
        self.error_score += 1.0;
        self.last_error = Some(message.to_string());

        if rate_limited || self.consecutive_failures >= COOLDOWN_FAILURE_THRESHOLD {
            self.cooldown_until = now_ms + self.config.cooldown_ms as i64;
            self.consecutive_failures = 0;
        }
    }

    pub fn set_enabled(&mut self, enabled: bool) {
        self.enabled = enabled;
        if enabled {
            // Re-enabling clears the penalty box.
            self.cooldown_until = 0;
            self.consecutive_failures = 0;
        }
    }
}

/// Admin-surface view of one provider.
#[derive(Debug, Clone, Serialize)]
pub struct ProviderStatusRow {
    pub provider_id: String,
    pub enabled: bool,
    pub healthy: bool,
    pub in_flight: u32,
    pub request_count: u64,
    pub error_count: u64,
    pub cooldown_remaining_ms: i64,
    pub last_error: Option<String>,
}

impl ProviderState {
    pub fn status_row(&self, now_ms: i64) -> ProviderStatusRow {
        ProviderStatusRow {
            provider_id: self.config.provider_id.clone(),
            enabled: self.enabled,
            healthy: self.is_selectable(now_ms),
            in_flight: self.in_flight,
            request_count: self.request_count,
            error_count: self.error_count,
            cooldown_remaining_ms: (self.cooldown_until - now_ms).max(0),
            last_error: self.last_error.clone(),
        }
    }
}
