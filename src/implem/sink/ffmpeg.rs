use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use image::RgbImage;
use tokio::io::AsyncWriteExt;
use tokio::process::{Child, ChildStdin, Command};
use tokio::time::timeout;

use crate::implem::sink::{CameraHandle, CameraOutput, PixelFormat, SinkError};
use crate::model::session::SinkGeometry;

/// Time ffmpeg gets to release the device after its input closes
const CLOSE_GRACE: Duration = Duration::from_secs(2);

/// Feeds a v4l2loopback device through an ffmpeg child process, which
/// performs the pixel format conversion the loopback consumers expect.
pub struct V4l2LoopbackOutput {
	ffmpeg: PathBuf,
	device: PathBuf,
}

impl V4l2LoopbackOutput {
	pub fn new(ffmpeg: PathBuf, device: PathBuf) -> Self {
		V4l2LoopbackOutput { ffmpeg, device }
	}

	fn args(&self, geometry: SinkGeometry, format: PixelFormat) -> Vec<String> {
		let mut args = ["-hide_banner", "-loglevel", "error", "-nostdin"]
			.into_iter()
			.map(str::to_string)
			.collect::<Vec<_>>();

		args.extend([
			"-f".to_string(), "rawvideo".to_string(),
			"-pix_fmt".to_string(), format.ffmpeg_name().to_string(),
			"-s".to_string(), format!("{}x{}", geometry.width, geometry.height),
			"-r".to_string(), geometry.fps.to_string(),
			"-i".to_string(), "pipe:0".to_string(),
			"-f".to_string(), "v4l2".to_string(),
			"-pix_fmt".to_string(), "yuv420p".to_string(),
			self.device.display().to_string(),
		]);
		return args;
	}
}

impl CameraOutput for V4l2LoopbackOutput {
	fn open(&self, geometry: SinkGeometry, format: PixelFormat) -> Result<Box<dyn CameraHandle>, SinkError> {
		if !self.device.exists() {
			return Err(SinkError::DeviceMissing(self.device.display().to_string()));
		}

		let mut child = Command::new(&self.ffmpeg)
			.args(self.args(geometry, format))
			.stdin(Stdio::piped())
			.stdout(Stdio::null())
			.stderr(Stdio::inherit())
			.kill_on_drop(true)
			.spawn()?;

		let stdin = match child.stdin.take() {
			Some(stdin) => stdin,
			None => return Err(SinkError::Rejected("ffmpeg stdin unavailable".to_string())),
		};

		Ok(Box::new(V4l2LoopbackHandle {
			device: self.device.display().to_string(),
			child,
			stdin: Some(stdin),
		}))
	}
}

struct V4l2LoopbackHandle {
	device: String,
	child: Child,
	stdin: Option<ChildStdin>,
}

#[async_trait]
impl CameraHandle for V4l2LoopbackHandle {
	fn device(&self) -> &str {
		&self.device
	}

	async fn send(&mut self, frame: &RgbImage) -> Result<(), SinkError> {
		match self.stdin.as_mut() {
			Some(stdin) => Ok(stdin.write_all(frame.as_raw()).await?),
			None => Err(SinkError::Rejected("device already closed".to_string())),
		}
	}

	async fn close(mut self: Box<Self>) {
		// EOF lets ffmpeg finish cleanly and release the device
		drop(self.stdin.take());
		match timeout(CLOSE_GRACE, self.child.wait()).await {
			Ok(Ok(_)) => {}
			Ok(Err(e)) => warn!("Waiting on {} writer failed: {}", self.device, e),
			Err(_) => {
				warn!("{} writer did not exit within {:?}, killing it", self.device, CLOSE_GRACE);
				let _ = self.child.kill().await;
			}
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn missing_device_is_reported() {
		let output = V4l2LoopbackOutput::new(PathBuf::from("ffmpeg"), PathBuf::from("/dev/definitely-not-a-camera"));
		let geometry = SinkGeometry { width: 640, height: 480, fps: 30 };

		match output.open(geometry, PixelFormat::Rgb24) {
			Err(SinkError::DeviceMissing(dev)) => assert_eq!(dev, "/dev/definitely-not-a-camera"),
			_ => panic!("expected a missing device"),
		}
	}

	#[test]
	fn writer_is_configured_for_the_geometry() {
		let output = V4l2LoopbackOutput::new(PathBuf::from("ffmpeg"), PathBuf::from("/dev/video10"));
		let args = output.args(SinkGeometry { width: 1080, height: 1920, fps: 60 }, PixelFormat::Rgb24);

		assert!(args.windows(2).any(|w| w[0] == "-s" && w[1] == "1080x1920"));
		assert!(args.windows(2).any(|w| w[0] == "-r" && w[1] == "60"));
		assert!(args.windows(2).any(|w| w[0] == "-pix_fmt" && w[1] == "rgb24"));
		assert_eq!(args.last().map(String::as_str), Some("/dev/video10"));
	}
}
