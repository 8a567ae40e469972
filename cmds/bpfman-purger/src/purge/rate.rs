//! Adaptive pacing of cluster API calls.
//!
//! Every call waits for a shared delay before it runs. Throttling seen by any
//! caller raises the delay for all of them; successes let it decay again.

use std::{
	fmt::Display,
	future::Future,
	sync::{LazyLock, Mutex, PoisonError},
	time::Duration,
};

use regex::Regex;
use tokio_util::sync::CancellationToken;

use crate::{config::RateLimitConfig, k8s::api::ApiError};

static RETRY_AFTER: LazyLock<Regex> = LazyLock::new(|| {
	Regex::new(r"(?i)retry-after:\s*(\d+(?:\.\d+)?)(ms|s)?").expect("retry-after pattern is valid")
});

/// Whether an error looks like server-side throttling.
///
/// This is a best-effort match on the error text, not on status codes, so it
/// works for any client error format that mentions the condition.
pub fn is_rate_limited(err: &impl Display) -> bool {
	let message = err.to_string().to_lowercase();
	["rate limit", "throttl", "too many requests", "429"]
		.iter()
		.any(|token| message.contains(token))
}

/// Extract a `retry-after: <duration>` hint from an error message.
///
/// The duration is a number with an optional `ms` or `s` unit; a bare number
/// is seconds. Returns `None` when there is no hint or it is zero.
pub fn retry_after(message: &str) -> Option<Duration> {
	let captures = RETRY_AFTER.captures(message)?;
	let value: f64 = captures.get(1)?.as_str().parse().ok()?;
	let seconds = match captures.get(2).map(|unit| unit.as_str().to_lowercase()) {
		Some(unit) if unit == "ms" => value / 1000.0,
		_ => value,
	};
	Duration::try_from_secs_f64(seconds)
		.ok()
		.filter(|d| !d.is_zero())
}

/// Shared delay plus retry policy for API calls.
#[derive(Debug)]
pub struct RateController {
	delay: Mutex<Duration>,
	min_delay: Duration,
	max_delay: Duration,
	max_attempts: u32,
	cancel: CancellationToken,
}

impl RateController {
	pub fn new(config: &RateLimitConfig, cancel: CancellationToken) -> Self {
		let min_delay = config.min_delay();
		let max_delay = config.max_delay();
		Self {
			delay: Mutex::new(config.initial_delay().clamp(min_delay, max_delay)),
			min_delay,
			max_delay,
			max_attempts: config.max_attempts.max(1),
			cancel,
		}
	}

	/// The delay the next call will wait before running.
	pub fn current_delay(&self) -> Duration {
		*self.delay.lock().unwrap_or_else(PoisonError::into_inner)
	}

	/// Token cancelling every wait and in-flight call of this controller.
	pub fn cancellation(&self) -> &CancellationToken {
		&self.cancel
	}

	/// Run `op`, pacing and retrying it on throttling.
	///
	/// Non-throttling errors are returned as-is. When every attempt was
	/// throttled, the last error comes back wrapped in
	/// [`ApiError::RetriesExhausted`].
	pub async fn execute<T, F, Fut>(&self, mut op: F) -> Result<T, ApiError>
	where
		F: FnMut() -> Fut,
		Fut: Future<Output = Result<T, ApiError>>,
	{
		let mut attempt = 0;
		loop {
			attempt += 1;
			self.wait().await?;

			let result = tokio::select! {
				biased;
				() = self.cancel.cancelled() => return Err(ApiError::Cancelled),
				result = op() => result,
			};

			let err = match result {
				Ok(value) => {
					self.record_success();
					return Ok(value);
				}
				Err(err) => err,
			};

			if !is_rate_limited(&err) {
				return Err(err);
			}

			self.record_throttle(retry_after(&err.to_string()));
			if attempt >= self.max_attempts {
				return Err(ApiError::RetriesExhausted(Box::new(err)));
			}

			tracing::debug!(
				error = %err,
				delay = ?self.current_delay(),
				attempt,
				max_attempts = self.max_attempts,
				"rate limited, retrying"
			);
		}
	}

	async fn wait(&self) -> Result<(), ApiError> {
		let delay = self.current_delay();
		tokio::select! {
			biased;
			() = self.cancel.cancelled() => Err(ApiError::Cancelled),
			() = tokio::time::sleep(delay) => Ok(()),
		}
	}

	fn record_success(&self) {
		let mut delay = self.delay.lock().unwrap_or_else(PoisonError::into_inner);
		// x0.9
		*delay = (*delay * 9 / 10).max(self.min_delay);
	}

	fn record_throttle(&self, retry_after: Option<Duration>) {
		let mut delay = self.delay.lock().unwrap_or_else(PoisonError::into_inner);
		*delay = match retry_after {
			Some(hint) => {
				let hint = hint.clamp(self.min_delay, self.max_delay);
				tracing::debug!(delay = ?hint, "adaptive delay set from server retry-after");
				hint
			}
			None => {
				// x1.5
				let raised = (*delay * 3 / 2).min(self.max_delay);
				tracing::debug!(delay = ?raised, "adaptive delay increased due to throttling");
				raised
			}
		};
	}
}
