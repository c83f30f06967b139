//! Distribution cursor protocol: the pull loop of one sync cycle.
//!
//! Every exchange is classified from the service-declared status code into a [`PullStep`]. The
//! classification is a pure function so the state machine can be tested without a network; the
//! [`CursorProtocol`] drives it against a [`DistributionGateway`], applying the inter-call delay and
//! the bounded retry with exponential backoff on transient failures.

use crate::config::DfeConfig;
use crate::ws::{DistributedItem, DistributionGateway, ExchangeResult, Nsu, ServiceStatus};
use backoff::ExponentialBackoffBuilder;
use backoff::future::retry_notify;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;
use tracing::{debug, info, warn};

/// Timing and bounds of the pull loop
#[derive(Debug, Clone)]
pub struct PullConfig {
	/// Pause between consecutive exchanges
	pub inter_call_delay: Duration,
	/// Retries after a transient failure before the cycle gives up
	pub max_attempts: u32,
	pub backoff_base: Duration,
	pub backoff_cap: Duration,
	/// Resume delay reported after a throttled stop
	pub throttle_wait: Duration,
	/// Cursor pulls allowed per cycle
	pub max_exchanges: u32,
}

impl Default for PullConfig {
	fn default() -> Self {
		Self::from(&DfeConfig::default())
	}
}

impl From<&DfeConfig> for PullConfig {
	fn from(config: &DfeConfig) -> Self {
		Self {
			inter_call_delay: config.inter_call_delay,
			max_attempts: config.max_attempts,
			backoff_base: config.backoff_base,
			backoff_cap: config.backoff_cap,
			throttle_wait: config.throttle_wait,
			max_exchanges: config.max_exchanges,
		}
	}
}

/// Why the loop stopped before catching up
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
	/// Authority-side outage (108/109)
	ServiceDown,
	/// Improper consumption (656)
	Throttled,
	/// Per-cycle exchange bound reached
	ExchangeLimit,
}

impl StopReason {
	pub fn as_str(&self) -> &'static str {
		match self {
			StopReason::ServiceDown => "service_down",
			StopReason::Throttled => "throttled",
			StopReason::ExchangeLimit => "exchange_limit",
		}
	}
}

/// Outcome of one exchange of the pull loop
#[derive(Debug, Clone)]
pub enum PullStep {
	/// Documents to persist. `caught_up` marks the last batch of the cycle.
	Batch {
		items: Vec<DistributedItem>,
		status_code: u16,
		status_reason: String,
		cursor_before: Nsu,
		cursor_after: Nsu,
		max_cursor: Nsu,
		caught_up: bool,
	},
	/// Nothing new (137)
	CaughtUp {
		status_reason: String,
		cursor: Nsu,
		max_cursor: Nsu,
	},
	/// Expected stop state, the caller reschedules
	Stopped {
		reason: StopReason,
		status_code: Option<u16>,
		status_reason: String,
		cursor: Nsu,
		max_cursor: Nsu,
		resume_after: Option<Duration>,
	},
	/// Cycle error
	Failed {
		kind: String,
		detail: String,
		cursor: Nsu,
		max_cursor: Nsu,
	},
}

impl PullStep {
	/// Whether the loop ends with this step
	pub fn is_terminal(&self) -> bool {
		match self {
			PullStep::Batch { caught_up, .. } => *caught_up,
			_ => true,
		}
	}

	/// Cursor to carry forward after this step
	pub fn cursor(&self) -> Nsu {
		match self {
			PullStep::Batch { cursor_after, .. } => *cursor_after,
			PullStep::CaughtUp { cursor, .. }
			| PullStep::Stopped { cursor, .. }
			| PullStep::Failed { cursor, .. } => *cursor,
		}
	}

	pub fn max_cursor(&self) -> Nsu {
		match self {
			PullStep::Batch { max_cursor, .. }
			| PullStep::CaughtUp { max_cursor, .. }
			| PullStep::Stopped { max_cursor, .. }
			| PullStep::Failed { max_cursor, .. } => *max_cursor,
		}
	}
}

/// Classify one distribution response.
///
/// # Arguments
/// * `response` - The parsed exchange.
/// * `request_cursor` - The cursor sent in the request.
/// * `throttle_wait` - Resume delay to report on a throttled stop.
pub fn classify(response: ExchangeResult, request_cursor: Nsu, throttle_wait: Duration) -> PullStep {
	let returned = response.cursor_after;
	let max_cursor = response.max_cursor_after;

	match response.status() {
		ServiceStatus::DocumentsFound => batch(response, request_cursor),
		ServiceStatus::NoDocuments if !response.items.is_empty() => {
			batch(response, request_cursor)
		}
		ServiceStatus::NoDocuments => PullStep::CaughtUp {
			status_reason: response.status_reason,
			cursor: returned.max(request_cursor),
			max_cursor,
		},
		ServiceStatus::Outage => PullStep::Stopped {
			reason: StopReason::ServiceDown,
			status_code: Some(response.status_code),
			status_reason: response.status_reason,
			cursor: returned,
			max_cursor,
			resume_after: None,
		},
		// the service requires the next pull to use the ultNSU of this very response
		ServiceStatus::Throttled => PullStep::Stopped {
			reason: StopReason::Throttled,
			status_code: Some(response.status_code),
			status_reason: response.status_reason,
			cursor: returned,
			max_cursor,
			resume_after: Some(throttle_wait),
		},
		ServiceStatus::Other(_) if !response.items.is_empty() => batch(response, request_cursor),
		ServiceStatus::Other(code) => PullStep::Failed {
			kind: "service_rejected".into(),
			detail: format!("cStat {}: {}", code, response.status_reason),
			cursor: request_cursor,
			max_cursor,
		},
	}
}

fn batch(response: ExchangeResult, request_cursor: Nsu) -> PullStep {
	let cursor_after = response.cursor_after;
	let max_cursor = response.max_cursor_after;
	// a cursor that does not move would make the next pull repeat this one
	let caught_up = cursor_after >= max_cursor || cursor_after <= request_cursor;

	PullStep::Batch {
		items: response.items,
		status_code: response.status_code,
		status_reason: response.status_reason,
		cursor_before: request_cursor,
		cursor_after: cursor_after.max(request_cursor),
		max_cursor,
		caught_up,
	}
}

/// Pull loop over one company's cursor.
///
/// Call [`CursorProtocol::next_step`] until it returns `None`; the loop always terminates within
/// `max_exchanges` cursor pulls.
pub struct CursorProtocol<'a> {
	gateway: &'a dyn DistributionGateway,
	config: &'a PullConfig,
	tax_id: &'a str,
	cursor: Nsu,
	max_cursor: Nsu,
	exchanges: u32,
	finished: bool,
}

impl<'a> CursorProtocol<'a> {
	pub fn new(
		gateway: &'a dyn DistributionGateway,
		config: &'a PullConfig,
		tax_id: &'a str,
		start: Nsu,
	) -> Self {
		Self {
			gateway,
			config,
			tax_id,
			cursor: start,
			max_cursor: start,
			exchanges: 0,
			finished: false,
		}
	}

	pub fn cursor(&self) -> Nsu {
		self.cursor
	}

	/// Cursor pulls performed so far
	pub fn exchanges(&self) -> u32 {
		self.exchanges
	}

	/// Perform the next exchange, or `None` once the loop has ended.
	pub async fn next_step(&mut self) -> Option<PullStep> {
		if self.finished {
			return None;
		}

		if self.exchanges >= self.config.max_exchanges {
			self.finished = true;
			info!(
				"Exchange limit of {} reached at NSU {}",
				self.config.max_exchanges, self.cursor
			);
			return Some(PullStep::Stopped {
				reason: StopReason::ExchangeLimit,
				status_code: None,
				status_reason: String::new(),
				cursor: self.cursor,
				max_cursor: self.max_cursor,
				resume_after: None,
			});
		}

		if self.exchanges > 0 {
			tokio::time::sleep(self.config.inter_call_delay).await;
		}

		let request_cursor = self.cursor;
		let response = match self.pull_with_retry(request_cursor).await {
			Ok(response) => response,
			Err(e) => {
				self.finished = true;
				return Some(PullStep::Failed {
					kind: e.kind().to_string(),
					detail: e.to_string(),
					cursor: self.cursor,
					max_cursor: self.max_cursor,
				});
			}
		};
		self.exchanges += 1;

		let step = classify(response, request_cursor, self.config.throttle_wait);
		self.cursor = self.cursor.max(step.cursor());
		self.max_cursor = step.max_cursor();
		self.finished = step.is_terminal();

		debug!(
			"Exchange {} from NSU {}: cursor={} max={} terminal={}",
			self.exchanges, request_cursor, self.cursor, self.max_cursor, self.finished
		);
		Some(step)
	}

	async fn pull_with_retry(
		&self,
		cursor: Nsu,
	) -> Result<ExchangeResult, crate::ws::ProtocolError> {
		let backoff = ExponentialBackoffBuilder::new()
			.with_initial_interval(self.config.backoff_base)
			.with_multiplier(2.0)
			.with_randomization_factor(0.5)
			.with_max_interval(self.config.backoff_cap)
			.with_max_elapsed_time(None)
			.build();
		let failures = AtomicU32::new(0);

		retry_notify(
			backoff,
			|| async {
				match self.gateway.pull_cursor(self.tax_id, cursor).await {
					Ok(response) => Ok(response),
					Err(e)
						if e.is_transient()
							&& failures.fetch_add(1, Ordering::SeqCst) < self.config.max_attempts =>
					{
						Err(backoff::Error::transient(e))
					}
					Err(e) => Err(backoff::Error::permanent(e)),
				}
			},
			|e, wait: Duration| {
				warn!(
					"Pull from NSU {} failed ({}), retrying in {:.1}s",
					cursor,
					e,
					wait.as_secs_f64()
				)
			},
		)
		.await
	}
}
