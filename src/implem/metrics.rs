use std::time::{Duration, Instant};

use crate::model::session::MetricsReport;

/// Fixed-window byte and frame accounting for one session.
pub struct MetricsAggregator {
	interval: Duration,
	window_start: Instant,
	bytes: u64,
	frames: u64,
	frames_total: u64,
	decode_errors: u64,
	session_start: Instant,
}

impl MetricsAggregator {
	pub fn new(interval: Duration) -> Self {
		Self::starting_at(interval, Instant::now())
	}

	pub fn starting_at(interval: Duration, now: Instant) -> Self {
		MetricsAggregator {
			interval,
			window_start: now,
			bytes: 0,
			frames: 0,
			frames_total: 0,
			decode_errors: 0,
			session_start: now,
		}
	}

	pub fn record_bytes(&mut self, n: usize) {
		self.bytes += n as u64;
	}

	pub fn record_frames(&mut self, n: usize) {
		self.frames += n as u64;
		self.frames_total += n as u64;
	}

	pub fn record_decode_error(&mut self) {
		self.decode_errors += 1;
	}

	/// Closes the window if it has run its course, returning the report and
	/// starting a fresh window.
	pub fn poll(&mut self, now: Instant) -> Option<MetricsReport> {
		let elapsed = now.saturating_duration_since(self.window_start);
		if elapsed < self.interval || elapsed.is_zero() {
			return None;
		}

		let secs = elapsed.as_secs_f64();
		let report = MetricsReport {
			bitrate_bps: (self.bytes * 8) as f64 / secs,
			fps: self.frames as f64 / secs,
			frames_decoded: self.frames_total,
			decode_errors: self.decode_errors,
		};

		self.window_start = now;
		self.bytes = 0;
		self.frames = 0;
		Some(report)
	}

	pub fn frames_total(&self) -> u64 {
		self.frames_total
	}

	pub fn decode_errors(&self) -> u64 {
		self.decode_errors
	}

	/// Average decode rate over the whole session
	pub fn average_fps(&self, now: Instant) -> f64 {
		let secs = now.saturating_duration_since(self.session_start).as_secs_f64();
		if secs > 0.0 {
			self.frames_total as f64 / secs
		} else {
			0.0
		}
	}
}
