//! Rate-limit quota tracking derived from response headers.
//!
//! The API reports its remaining per-second and per-day budget on every response. Each
//! [`Response`](crate::response::Response) carries the [`RateLimitSnapshot`] parsed from its
//! own headers, the [`RateLimitTracker`] remembers the latest one for the session, and the
//! [`RateLimitLog`] keeps a timeline of attempts for post-mortem inspection.

// std
use std::collections::VecDeque;
// self
use crate::{_prelude::*, http::HttpResponse, request::Method};

/// Header carrying the remaining per-second budget.
pub const REMAINING_PER_SECOND: &str = "X-RateLimit-Remaining-second";
/// Header carrying the remaining per-day budget.
pub const REMAINING_PER_DAY: &str = "X-RateLimit-Remaining-day";
/// Header carrying the per-second quota.
pub const LIMIT_PER_SECOND: &str = "X-RateLimit-Limit-second";
/// Header carrying the per-day quota.
pub const LIMIT_PER_DAY: &str = "X-RateLimit-Limit-day";

/// Remaining-quota counters reported by one response.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateLimitSnapshot {
	/// Calls left in the current second.
	pub remaining_per_second: Option<u32>,
	/// Calls left today.
	pub remaining_per_day: Option<u32>,
	/// Per-second quota.
	pub limit_per_second: Option<u32>,
	/// Per-day quota.
	pub limit_per_day: Option<u32>,
	/// The next call is likely to be throttled.
	pub near_limit: bool,
}
impl RateLimitSnapshot {
	/// Parses the rate-limit headers of `response`; absent or malformed headers stay `None`.
	pub fn from_response(response: &HttpResponse) -> Self {
		let read = |name: &str| response.header(name).and_then(|v| v.trim().parse::<u32>().ok());
		let remaining_per_second = read(REMAINING_PER_SECOND);
		let remaining_per_day = read(REMAINING_PER_DAY);

		Self {
			remaining_per_second,
			remaining_per_day,
			limit_per_second: read(LIMIT_PER_SECOND),
			limit_per_day: read(LIMIT_PER_DAY),
			near_limit: remaining_per_second.is_some_and(|sec| sec <= 1)
				|| remaining_per_day.is_some_and(|day| day == 0),
		}
	}

	/// Whether any rate-limit header was present.
	pub fn is_reported(&self) -> bool {
		self.remaining_per_second.is_some() || self.remaining_per_day.is_some()
	}

	/// Combines two snapshots keeping the smallest remaining values.
	pub fn tighter(self, other: Self) -> Self {
		fn min(a: Option<u32>, b: Option<u32>) -> Option<u32> {
			match (a, b) {
				(Some(a), Some(b)) => Some(a.min(b)),
				(a, b) => a.or(b),
			}
		}

		Self {
			remaining_per_second: min(self.remaining_per_second, other.remaining_per_second),
			remaining_per_day: min(self.remaining_per_day, other.remaining_per_day),
			limit_per_second: self.limit_per_second.or(other.limit_per_second),
			limit_per_day: self.limit_per_day.or(other.limit_per_day),
			near_limit: self.near_limit || other.near_limit,
		}
	}

	/// Most constrained snapshot across a set of responses.
	pub fn most_constrained<I>(snapshots: I) -> Self
	where
		I: IntoIterator<Item = Self>,
	{
		snapshots.into_iter().fold(Self::default(), Self::tighter)
	}
}
impl Display for RateLimitSnapshot {
	fn fmt(&self, f: &mut Formatter) -> FmtResult {
		match (self.remaining_per_day, self.limit_per_day) {
			(Some(remain), Some(total)) => write!(f, "API Rate Limit: {remain} of {total} remaining."),
			(Some(remain), None) => write!(f, "API Rate Limit: {remain} remaining today."),
			_ => f.write_str("API Rate Limit: not reported."),
		}
	}
}

/// Latest quota observed by the session.
#[derive(Debug, Default)]
pub struct RateLimitTracker {
	latest: RwLock<Option<RateLimitSnapshot>>,
}
impl RateLimitTracker {
	/// Records a snapshot if it carries quota data.
	pub fn update(&self, snapshot: RateLimitSnapshot) {
		if snapshot.is_reported() {
			*self.latest.write() = Some(snapshot);
		}
	}

	/// Most recent snapshot, if any response reported quota headers.
	pub fn latest(&self) -> Option<RateLimitSnapshot> {
		*self.latest.read()
	}
}

/// What a [`RateLimitLogEntry`] records.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RateLimitEvent {
	/// A call is about to be sent.
	Attempt,
	/// The call succeeded.
	Ok,
	/// The call succeeded but the per-second budget is nearly exhausted.
	NearLimit,
	/// The call was throttled (HTTP 429).
	RateLimitHit,
	/// The call failed for another reason.
	Failed,
}

/// One line of the rate-limit/timing log.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateLimitLogEntry {
	/// Time since the session was created.
	pub since_start: Duration,
	/// HTTP verb.
	pub method: Method,
	/// Request path and query.
	pub target: String,
	/// Attempt number for this target (1-based).
	pub try_number: u32,
	/// Logged event.
	pub event: RateLimitEvent,
	/// Per-second remaining budget when known.
	pub remaining_per_second: Option<u32>,
}
impl Display for RateLimitLogEntry {
	fn fmt(&self, f: &mut Formatter) -> FmtResult {
		let secs = self.since_start.as_secs_f64();

		match self.event {
			RateLimitEvent::Attempt => write!(
				f,
				"{secs:.2} [{}]{} Try: {}",
				self.method, self.target, self.try_number
			),
			event => write!(
				f,
				"{secs:.2} [{event:?}] p/s: {} {}",
				self.remaining_per_second.map(|v| v.to_string()).unwrap_or_else(|| "?".into()),
				self.target
			),
		}
	}
}

/// Entries kept by [`RateLimitLog::new`] before the oldest ones are dropped.
pub const RATE_LIMIT_LOG_CAPACITY: usize = 4_096;

/// Bounded timeline of attempts and their rate-limit outcome.
///
/// Once full, every new entry evicts the oldest one.
#[derive(Debug)]
pub struct RateLimitLog {
	started: Instant,
	capacity: usize,
	entries: Mutex<VecDeque<RateLimitLogEntry>>,
}
impl RateLimitLog {
	/// Creates an empty log anchored at the current instant.
	pub fn new() -> Self {
		Self::with_capacity(RATE_LIMIT_LOG_CAPACITY)
	}

	/// Creates an empty log keeping at most `capacity` entries.
	pub fn with_capacity(capacity: usize) -> Self {
		let capacity = capacity.max(1);

		Self {
			started: Instant::now(),
			capacity,
			entries: Mutex::new(VecDeque::with_capacity(capacity.min(RATE_LIMIT_LOG_CAPACITY))),
		}
	}

	/// Appends an entry stamped with the elapsed time since the log was created.
	pub fn record(
		&self,
		method: Method,
		target: &str,
		try_number: u32,
		event: RateLimitEvent,
		remaining_per_second: Option<u32>,
	) {
		let entry = RateLimitLogEntry {
			since_start: self.started.elapsed(),
			method,
			target: target.to_owned(),
			try_number,
			event,
			remaining_per_second,
		};

		tracing::trace!(entry = %entry, "Rate-limit log entry recorded.");

		let mut entries = self.entries.lock();

		if entries.len() == self.capacity {
			entries.pop_front();
		}

		entries.push_back(entry);
	}

	/// Number of earlier attempts at `target`.
	pub fn attempts_for(&self, target: &str) -> u32 {
		let count = self
			.entries
			.lock()
			.iter()
			.filter(|e| e.event == RateLimitEvent::Attempt && e.target == target)
			.count();

		u32::try_from(count).unwrap_or(u32::MAX)
	}

	/// Copy of the retained entries, oldest first.
	pub fn entries(&self) -> Vec<RateLimitLogEntry> {
		self.entries.lock().iter().cloned().collect()
	}
}
impl Default for RateLimitLog {
	fn default() -> Self {
		Self::new()
	}
}

#[cfg(test)]
mod tests {
	// self
	use super::*;

	#[test]
	fn snapshot_parses_headers_and_flags_near_limit() {
		let response = HttpResponse::new(200, Vec::new())
			.with_header("x-ratelimit-remaining-second", "1")
			.with_header("x-ratelimit-remaining-day", "4000")
			.with_header("x-ratelimit-limit-day", "5000");
		let snapshot = RateLimitSnapshot::from_response(&response);

		assert_eq!(snapshot.remaining_per_second, Some(1));
		assert_eq!(snapshot.remaining_per_day, Some(4000));
		assert!(snapshot.near_limit);
		assert_eq!(snapshot.to_string(), "API Rate Limit: 4000 of 5000 remaining.");
	}

	#[test]
	fn missing_headers_are_not_reported() {
		let snapshot = RateLimitSnapshot::from_response(&HttpResponse::new(200, Vec::new()));

		assert!(!snapshot.is_reported());
		assert!(!snapshot.near_limit);

		let tracker = RateLimitTracker::default();

		tracker.update(snapshot);

		assert_eq!(tracker.latest(), None);
	}

	#[test]
	fn most_constrained_takes_smallest_remaining() {
		let a = RateLimitSnapshot {
			remaining_per_second: Some(5),
			remaining_per_day: Some(100),
			..Default::default()
		};
		let b = RateLimitSnapshot {
			remaining_per_second: Some(2),
			remaining_per_day: None,
			..Default::default()
		};
		let c = RateLimitSnapshot {
			remaining_per_second: Some(4),
			remaining_per_day: Some(90),
			..Default::default()
		};
		let tightest = RateLimitSnapshot::most_constrained([a, b, c]);

		assert_eq!(tightest.remaining_per_second, Some(2));
		assert_eq!(tightest.remaining_per_day, Some(90));
	}

	#[test]
	fn log_counts_attempts_per_target() {
		let log = RateLimitLog::new();

		log.record(Method::Get, "/a", 1, RateLimitEvent::Attempt, None);
		log.record(Method::Get, "/a", 1, RateLimitEvent::RateLimitHit, Some(0));
		log.record(Method::Get, "/a", 2, RateLimitEvent::Attempt, None);
		log.record(Method::Get, "/b", 1, RateLimitEvent::Attempt, None);

		assert_eq!(log.attempts_for("/a"), 2);
		assert_eq!(log.attempts_for("/c"), 0);
		assert_eq!(log.entries().len(), 4);
	}

	#[test]
	fn full_log_drops_the_oldest_entries() {
		let log = RateLimitLog::with_capacity(3);

		for target in ["/a", "/b", "/c", "/d", "/e"] {
			log.record(Method::Get, target, 1, RateLimitEvent::Attempt, None);
		}

		let targets = log.entries().into_iter().map(|e| e.target).collect::<Vec<_>>();

		assert_eq!(targets, ["/c", "/d", "/e"]);
		assert_eq!(log.attempts_for("/a"), 0);
		assert_eq!(log.attempts_for("/e"), 1);
	}
}
