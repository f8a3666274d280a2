use std::io;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use image::imageops::{self, FilterType};
use image::RgbImage;
use thiserror::Error;

use crate::implem::events::EventSink;
use crate::implem::orientation;
use crate::model::session::{SessionEvent, SinkGeometry};
use crate::model::settings::Resolution;
use crate::model::stream::OutputFrame;
use crate::utils::SnapshotSlot;

pub mod ffmpeg;

/// How long a failed device stays untouched before the adapter tries again
const REOPEN_BACKOFF: Duration = Duration::from_secs(2);

#[derive(Debug, Error)]
pub enum SinkError {
	#[error("output device {0} does not exist")]
	DeviceMissing(String),
	#[error("output device rejected the frame: {0}")]
	Rejected(String),
	#[error("output i/o: {0}")]
	Io(#[from] io::Error),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PixelFormat {
	Rgb24,
}

impl PixelFormat {
	pub fn ffmpeg_name(&self) -> &'static str {
		match self {
			PixelFormat::Rgb24 => "rgb24",
		}
	}
}

/// Opens the virtual camera device.
pub trait CameraOutput: Send + Sync {
	fn open(&self, geometry: SinkGeometry, format: PixelFormat) -> Result<Box<dyn CameraHandle>, SinkError>;
}

/// An open virtual camera accepting frames of exactly its geometry.
#[async_trait]
pub trait CameraHandle: Send {
	fn device(&self) -> &str;
	async fn send(&mut self, frame: &RgbImage) -> Result<(), SinkError>;
	async fn close(self: Box<Self>);
}

/// Accepts everything, shows nothing.
pub struct NullOutput;

struct NullHandle;

impl CameraOutput for NullOutput {
	fn open(&self, _: SinkGeometry, _: PixelFormat) -> Result<Box<dyn CameraHandle>, SinkError> {
		Ok(Box::new(NullHandle))
	}
}

#[async_trait]
impl CameraHandle for NullHandle {
	fn device(&self) -> &str {
		"null"
	}

	async fn send(&mut self, _: &RgbImage) -> Result<(), SinkError> {
		Ok(())
	}

	async fn close(self: Box<Self>) {}
}

/// Keeps the output device's geometry in step with the frames of one
/// session.
///
/// The device is opened lazily with the first frame's geometry, and closed
/// and reopened whenever a frame arrives whose rotated dimensions differ.
/// In fixed-size mode frames are scaled to the configured size instead and
/// the device is never reopened. When the device cannot be opened the
/// adapter is degraded: frames are dropped (but still reach the snapshot
/// slot) and the open is retried after a backoff.
pub struct SinkAdapter {
	output: Arc<dyn CameraOutput>,
	fps: u32,
	fixed: Option<Resolution>,
	handle: Option<Box<dyn CameraHandle>>,
	geometry: Option<SinkGeometry>,
	failed: Option<(SinkGeometry, Instant)>,
	events: EventSink,
	snapshot: SnapshotSlot,
	reinitialisations: u64,
	dropped: u64,
}

impl SinkAdapter {
	pub fn new(output: Arc<dyn CameraOutput>, fps: u32, fixed: Option<Resolution>, events: EventSink, snapshot: SnapshotSlot) -> Self {
		SinkAdapter {
			output,
			fps,
			fixed,
			handle: None,
			geometry: None,
			failed: None,
			events,
			snapshot,
			reinitialisations: 0,
			dropped: 0,
		}
	}

	pub async fn deliver(&mut self, frame: OutputFrame) {
		let mut frame = orientation::apply(frame.image, frame.rotation);

		let target = match self.fixed {
			Some(res) => {
				if frame.dimensions() != (res.width, res.height) {
					frame = imageops::resize(&frame, res.width, res.height, FilterType::Triangle);
				}
				SinkGeometry { width: res.width, height: res.height, fps: self.fps }
			}
			None => SinkGeometry { width: frame.width(), height: frame.height(), fps: self.fps },
		};

		if self.handle.is_none() || self.geometry != Some(target) {
			self.reconfigure(target).await;
		}

		let sent = match self.handle.as_mut() {
			Some(handle) => Some(handle.send(&frame).await),
			None => None,
		};
		match sent {
			Some(Ok(())) => {}
			Some(Err(e)) => {
				warn!("Output device failed, dropping it: {}", e);
				self.close_device().await;
				self.failed = Some((target, Instant::now()));
				self.dropped += 1;
				self.events.emit(SessionEvent::SinkDegraded(e.to_string()));
			}
			None => self.dropped += 1,
		}

		if let Ok(mut slot) = self.snapshot.lock() {
			*slot = Some(frame);
		}
	}

	/// Close-and-open. Nothing is delivered until it returns.
	async fn reconfigure(&mut self, target: SinkGeometry) {
		if let Some((geometry, at)) = self.failed {
			if geometry == target && at.elapsed() < REOPEN_BACKOFF {
				return;
			}
		}

		if let Some(current) = self.geometry {
			info!("Output geometry changed from {} to {}, reinitialising", current, target);
			self.reinitialisations += 1;
		}
		self.close_device().await;

		match self.output.open(target, PixelFormat::Rgb24) {
			Ok(handle) => {
				info!("Virtual camera opened: {} {}", handle.device(), target);
				self.events.emit(SessionEvent::SinkOpened { geometry: target, device: handle.device().to_string() });
				if self.failed.take().is_some() {
					self.events.emit(SessionEvent::SinkRestored);
				}
				self.handle = Some(handle);
				self.geometry = Some(target);
			}
			Err(e) => {
				if self.failed.is_none() {
					error!("Failed to open virtual camera at {}: {}", target, e);
				}
				self.failed = Some((target, Instant::now()));
				self.events.emit(SessionEvent::SinkDegraded(e.to_string()));
			}
		}
	}

	async fn close_device(&mut self) {
		if let Some(handle) = self.handle.take() {
			handle.close().await;
			self.events.emit(SessionEvent::SinkClosed);
		}
		self.geometry = None;
	}

	/// Releases the device at session end so the next session starts clean
	pub async fn close(&mut self) {
		if self.handle.is_some() {
			info!("Virtual camera closed");
		}
		self.close_device().await;
		self.failed = None;
	}

	#[cfg(test)]
	pub fn geometry(&self) -> Option<SinkGeometry> {
		self.geometry
	}

	pub fn is_degraded(&self) -> bool {
		self.failed.is_some()
	}

	pub fn reinitialisations(&self) -> u64 {
		self.reinitialisations
	}

	pub fn dropped(&self) -> u64 {
		self.dropped
	}
}
