use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::sync::mpsc::Receiver;
use tokio::sync::watch;
use tokio::time::{sleep, timeout};

use crate::implem::admission::SessionTicket;
use crate::implem::decode::{DecodeContext, Decoded, DecoderFactory};
use crate::implem::events::EventSink;
use crate::implem::metrics::MetricsAggregator;
use crate::implem::sink::{CameraOutput, SinkAdapter};
use crate::implem::stream::{StreamError, StreamReassembler};
use crate::model::session::{DrainReason, PeerEvent, SessionEvent};
use crate::model::settings::{Resolution, Rotation};
use crate::model::stream::{AccessUnit, OutputFrame, StreamEvent};
use crate::utils::{stop_requested, SnapshotSlot};

const READ_CHUNK: usize = 64 << 10;

#[derive(Clone, Debug)]
pub struct SessionConfig {
	pub fps: u32,
	/// Scale every frame to this size instead of following the stream
	pub fixed_size: Option<Resolution>,
	pub max_pending: usize,
	/// Idle tick; a quiet producer is not disconnected by it
	pub read_timeout: Duration,
	pub metrics_interval: Duration,
}

impl Default for SessionConfig {
	fn default() -> Self {
		SessionConfig {
			fps: 60,
			fixed_size: None,
			max_pending: 8 << 20,
			read_timeout: Duration::from_secs(5),
			metrics_interval: Duration::from_secs(5),
		}
	}
}

/// Collaborators every session is built from.
#[derive(Clone)]
pub struct Pipeline {
	pub config: SessionConfig,
	pub decoders: Arc<dyn DecoderFactory>,
	pub output: Arc<dyn CameraOutput>,
	pub events: EventSink,
	pub snapshot: SnapshotSlot,
}

/// One connected producer, from admission to teardown. Everything in here
/// is fresh per session and touched only by the session's own task.
pub struct Session {
	ticket: SessionTicket,
	rotation: Rotation,
	reassembler: StreamReassembler,
	decoder: Option<Box<dyn DecodeContext>>,
	sink: SinkAdapter,
	metrics: MetricsAggregator,
	events: EventSink,
}

impl Session {
	pub async fn open(ticket: SessionTicket, pipeline: &Pipeline) -> Self {
		// Chosen once; a failing hardware path is never retried mid-stream
		let decoder = match pipeline.decoders.acquire().await {
			Ok(decoder) => Some(decoder),
			Err(e) => {
				error!("No decoder available for {}, frames will not be produced: {}", ticket.peer(), e);
				None
			}
		};

		let name = decoder.as_ref().map(|d| d.name()).unwrap_or("none");
		info!("Session started for {} (decoder: {})", ticket.peer(), name);
		pipeline.events.emit(SessionEvent::Connected { peer: ticket.peer().to_string(), decoder: name });

		Session {
			ticket,
			rotation: Rotation::Normal,
			reassembler: StreamReassembler::new(pipeline.config.max_pending),
			decoder,
			sink: SinkAdapter::new(
				pipeline.output.clone(),
				pipeline.config.fps,
				pipeline.config.fixed_size,
				pipeline.events.clone(),
				pipeline.snapshot.clone(),
			),
			metrics: MetricsAggregator::new(pipeline.config.metrics_interval),
			events: pipeline.events.clone(),
		}
	}

	pub fn peer(&self) -> &str {
		self.ticket.peer()
	}

	#[cfg(test)]
	pub fn rotation(&self) -> Rotation {
		self.rotation
	}

	/// Runs one received chunk through demux, framing, decode and output
	pub async fn handle_chunk(&mut self, chunk: &[u8]) -> Result<(), StreamError> {
		self.metrics.record_bytes(chunk.len());
		for event in self.reassembler.push(chunk)? {
			self.handle_event(event).await;
		}
		Ok(())
	}

	async fn handle_event(&mut self, event: StreamEvent) {
		match event {
			StreamEvent::Unit(unit) => self.decode_unit(&unit).await,
			// Units already submitted keep the rotation they went in with
			StreamEvent::Control(msg) => {
				if msg.rotation != self.rotation {
					info!("Orientation for {} is now {} degrees", self.peer(), msg.rotation.degrees());
					self.events.emit(SessionEvent::Orientation(msg.rotation));
				}
				self.rotation = msg.rotation;
			}
		}
	}

	/// A bad unit is counted and skipped, never fatal
	pub async fn decode_unit(&mut self, unit: &AccessUnit) {
		let decoder = match self.decoder.as_mut() {
			Some(decoder) => decoder,
			None => return,
		};

		match decoder.submit(unit, self.rotation).await {
			Ok(decoded) => self.absorb(decoded).await,
			Err(e) => {
				debug!("Skipping undecodable unit (type {:?}, {} bytes): {}", unit.unit_code(), unit.len(), e);
				self.record_decode_error(unit.unit_code(), e.to_string());
			}
		}
	}

	pub fn record_bytes(&mut self, n: usize) {
		self.metrics.record_bytes(n);
	}

	fn record_decode_error(&mut self, unit_code: Option<u8>, message: String) {
		self.metrics.record_decode_error();
		self.events.emit(SessionEvent::DecodeError { unit_code, message });
	}

	/// Errors the decoder reported on its own can no longer be pinned to a unit
	async fn absorb(&mut self, decoded: Decoded) {
		for message in decoded.errors {
			debug!("Decoder reported: {}", message);
			self.record_decode_error(None, message);
		}
		self.forward(decoded.frames).await;
	}

	async fn forward(&mut self, frames: Vec<OutputFrame>) {
		self.metrics.record_frames(frames.len());
		for frame in frames {
			self.sink.deliver(frame).await;
		}
	}

	/// Housekeeping between reads: late frames and the metrics window
	pub async fn tick(&mut self) {
		let ready = self.decoder.as_mut().map(|d| d.poll()).unwrap_or_default();
		self.absorb(ready).await;

		if let Some(report) = self.metrics.poll(Instant::now()) {
			debug!("{}: {:.1} Mbps, {:.1} fps", self.peer(), report.bitrate_bps / 1_000_000.0, report.fps);
			self.events.emit(SessionEvent::Metrics(report));
		}
	}

	/// Reads from `reader` until the producer leaves, the stream breaks, or
	/// `stop` is raised. Decoder and device I/O are raced against `stop` too.
	pub async fn pump_stream<R: AsyncRead + Unpin>(&mut self, mut reader: R, stop: &mut watch::Receiver<bool>, read_timeout: Duration) -> DrainReason {
		let mut buf = vec![0u8; READ_CHUNK];

		loop {
			let read = tokio::select! {
				read = timeout(read_timeout, reader.read(&mut buf)) => read,
				_ = stop_requested(stop) => return DrainReason::Stopped,
			};

			let n = match read {
				// Quiet producer, still connected
				Err(_) => 0,
				Ok(Ok(0)) => return DrainReason::EndOfStream,
				Ok(Ok(n)) => n,
				Ok(Err(e)) => return DrainReason::TransportError(e.to_string()),
			};

			if n > 0 {
				let handled = tokio::select! {
					handled = self.handle_chunk(&buf[..n]) => handled,
					_ = stop_requested(stop) => return DrainReason::Stopped,
				};
				if let Err(e) = handled {
					warn!("Dropping {}: {}", self.peer(), e);
					return match e {
						StreamError::Overflow { pending, .. } => DrainReason::Overflow(pending),
					};
				}
			}

			tokio::select! {
				_ = self.tick() => {}
				_ = stop_requested(stop) => return DrainReason::Stopped,
			}
		}
	}

	/// Consumes transport events in arrival order until the peer goes away
	/// or `stop` is raised.
	pub async fn pump_peer(&mut self, peer_events: &mut Receiver<PeerEvent>, stop: &mut watch::Receiver<bool>, idle: Duration) -> DrainReason {
		loop {
			let event = tokio::select! {
				event = peer_events.recv() => event,
				_ = stop_requested(stop) => return DrainReason::Stopped,
				_ = sleep(idle) => {
					tokio::select! {
						_ = self.tick() => {}
						_ = stop_requested(stop) => return DrainReason::Stopped,
					}
					continue;
				}
			};

			match event {
				Some(PeerEvent::Sample(data)) => {
					self.record_bytes(data.len());
					let unit = AccessUnit::new(data);
					tokio::select! {
						_ = async {
							self.decode_unit(&unit).await;
							self.tick().await;
						} => {}
						_ = stop_requested(stop) => return DrainReason::Stopped,
					}
				}
				Some(PeerEvent::State(state)) => {
					debug!("{} peer state {:?}", self.peer(), state);
					if state.is_terminal() {
						return DrainReason::PeerClosed;
					}
				}
				Some(PeerEvent::TrackEnded) => return DrainReason::EndOfStream,
				None => return DrainReason::PeerClosed,
			}
		}
	}

	/// `Active -> Draining -> Accepting`: flushes what is still buffered,
	/// releases the decoder and the output device, then gives up admission.
	pub async fn close(mut self, reason: DrainReason) {
		self.ticket.drain();

		if reason == DrainReason::EndOfStream {
			for event in self.reassembler.finish() {
				self.handle_event(event).await;
			}
		}

		if let Some(mut decoder) = self.decoder.take() {
			match decoder.flush().await {
				Ok(decoded) if decoded.is_empty() => {}
				Ok(decoded) => {
					debug!("{} frames were still in the decoder", decoded.frames.len());
					self.absorb(decoded).await;
				}
				Err(e) => debug!("Decoder flush failed: {}", e),
			}
		}
		if self.sink.is_degraded() {
			warn!("Virtual camera was unavailable when {} left", self.peer());
		}
		self.sink.close().await;

		let now = Instant::now();
		info!(
			"Session ended for {}: {} ({} frames, {:.1} fps, {} decode errors, {} control false positives, {} camera reinitialisations, {} frames dropped)",
			self.peer(),
			reason,
			self.metrics.frames_total(),
			self.metrics.average_fps(now),
			self.metrics.decode_errors(),
			self.reassembler.false_positives(),
			self.sink.reinitialisations(),
			self.sink.dropped(),
		);
		self.events.emit(SessionEvent::Disconnected { peer: self.peer().to_string(), reason });
		// the ticket drops with self, reopening admission
	}
}
