//! Retry classification for executed calls.
//!
//! [`RetryPolicy::decide`] maps a failed [`Response`] to the corrective action the executor
//! takes before trying again. Throttled calls (HTTP 429) are handled separately from the
//! nominal attempt budget and back off exponentially.

// crates.io
use rand::Rng;
// self
use crate::{
	_prelude::*,
	config::duration_ms,
	response::{ErrorKind, Response},
};

/// Statuses retried once as transient server failures.
pub const RETRIED_SERVER_STATUSES: [u16; 3] = [500, 503, 504];

/// Retry budget applied by the executor.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
	/// Attempts per call, excluding throttled attempts.
	pub max_attempts: u32,
	/// Backoff applied when the API answers 429.
	pub rate_limit: RateLimitBackoff,
}
impl Default for RetryPolicy {
	fn default() -> Self {
		Self { max_attempts: 2, rate_limit: RateLimitBackoff::default() }
	}
}
impl RetryPolicy {
	/// Decides what to do after `response`, updating the per-call `state`.
	pub fn decide(&self, state: &mut RetryState, response: &Response) -> RetryDecision {
		let Some(kind) = response.error_kind() else {
			return RetryDecision::Finish;
		};

		if kind == ErrorKind::RateLimited {
			state.rate_limit_hits += 1;
			// Throttled attempts do not count against the nominal budget.
			state.attempts = state.attempts.saturating_sub(1);

			return match self.rate_limit.max_retries {
				Some(max) if state.rate_limit_hits > max => RetryDecision::Finish,
				_ => RetryDecision::Backoff(self.rate_limit.delay_for(state.rate_limit_hits - 1)),
			};
		}
		if state.attempts >= self.max_attempts {
			return RetryDecision::Finish;
		}

		match kind {
			ErrorKind::Transport(_) => RetryDecision::ResetTransport,
			ErrorKind::InvalidToken => RetryDecision::RefreshToken,
			ErrorKind::SignatureExpired => RetryDecision::RunExpiryHook,
			ErrorKind::ServerError
				if response.status.is_some_and(|s| RETRIED_SERVER_STATUSES.contains(&s)) =>
				RetryDecision::Retry,
			_ => RetryDecision::Finish,
		}
	}
}

/// Exponential backoff for throttled calls.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimitBackoff {
	/// Maximum throttled retries per call; `None` keeps retrying until the call goes through.
	pub max_retries: Option<u32>,
	/// Delay before the first retry.
	#[serde(with = "duration_ms")]
	pub base_delay: Duration,
	/// Upper bound for any single delay.
	#[serde(with = "duration_ms")]
	pub max_delay: Duration,
	/// Draws each delay uniformly from `0..=delay` when enabled.
	pub jitter: bool,
}
impl Default for RateLimitBackoff {
	fn default() -> Self {
		Self {
			max_retries: Some(8),
			base_delay: Duration::from_millis(250),
			max_delay: Duration::from_secs(8),
			jitter: true,
		}
	}
}
impl RateLimitBackoff {
	/// Delay before throttled retry number `retry` (0-based).
	pub fn delay_for(&self, retry: u32) -> Duration {
		let ceiling = self.ceiling_for(retry);

		if !self.jitter || ceiling.is_zero() {
			return ceiling;
		}

		let millis = u64::try_from(ceiling.as_millis()).unwrap_or(u64::MAX);

		Duration::from_millis(rand::rng().random_range(0..=millis))
	}

	/// Delay before jitter is applied: `base_delay * 2^retry`, capped at `max_delay`.
	pub fn ceiling_for(&self, retry: u32) -> Duration {
		let factor = 2_u32.saturating_pow(retry.min(31));

		self.base_delay.saturating_mul(factor).min(self.max_delay)
	}
}

/// Per-call retry bookkeeping.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct RetryState {
	/// Attempts counted against the nominal budget.
	pub attempts: u32,
	/// Throttled responses seen so far.
	pub rate_limit_hits: u32,
}
impl RetryState {
	/// Marks the start of an attempt.
	pub fn begin_attempt(&mut self) {
		self.attempts += 1;
	}
}

/// Corrective action chosen by [`RetryPolicy::decide`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RetryDecision {
	/// Return the response as is.
	Finish,
	/// Try again immediately.
	Retry,
	/// Drop the pooled connection, then try again.
	ResetTransport,
	/// Refresh the bearer token, then try again.
	RefreshToken,
	/// Run the signature-expiry hook, then try again.
	RunExpiryHook,
	/// Wait, then try again.
	Backoff(Duration),
}
