use std::io;
use std::net::{SocketAddr, SocketAddrV4};
use std::path::PathBuf;
use std::time::Duration;

use hyper::Server;
use hyper::server::Builder;
use hyper::server::conn::AddrIncoming;
use tokio::net::TcpListener;

use crate::implem::session::SessionConfig;
use crate::model::settings::{DecoderPreference, OutputTarget, Resolution, StreamMode};

#[derive(FromArgs)]
/// receive a phone's H.264 camera stream and expose it as a virtual camera
pub struct CliArgs {
	#[argh(option, short = 'm', default = "Default::default()")]
	/// transport to ingest from (available options: "stream", "signaling") (default: "stream")
	pub mode: StreamMode,
	#[argh(option, short = 'o', default = "SocketAddrV4::new([0, 0, 0, 0].into(), 5000)")]
	/// the host (ipv4) to bind to for the raw H.264 stream (default: 0.0.0.0:5000)
	pub video_host: SocketAddrV4,
	#[argh(option, short = 'h', default = "SocketAddrV4::new([0, 0, 0, 0].into(), 8000)")]
	/// the host (ipv4) to bind to for the viewer, status, snapshot and offer http server (default: 0.0.0.0:8000)
	pub http_host: SocketAddrV4,
	#[argh(option, short = 'f', default = "60")]
	/// frame rate announced to the virtual camera (default: 60)
	pub fps: u32,
	#[argh(option, short = 'd', default = "Default::default()")]
	/// the virtual camera device, or "null" to discard frames (default: /dev/video10)
	pub output: OutputTarget,
	#[argh(option, short = 's')]
	/// scale every frame to WxH instead of following the stream geometry
	pub output_size: Option<Resolution>,
	#[argh(option, default = "Default::default()")]
	/// decoder to use (available options: "auto", "hardware", "software") (default: "auto")
	pub decoder: DecoderPreference,
	#[argh(option, default = "8 << 20")]
	/// bytes buffered without a start code before the connection is dropped (default: 8388608)
	pub max_pending: usize,
	#[argh(option, default = "5000")]
	/// idle read tick in milliseconds; a quiet producer stays connected (default: 5000)
	pub read_timeout_ms: u64,
	#[argh(option, default = "5000")]
	/// bitrate and fps reporting window in milliseconds (default: 5000)
	pub metrics_interval_ms: u64,
	#[argh(option)]
	/// STUN server url for signaling mode, e.g. stun:stun.l.google.com:19302
	pub stun: Option<String>,
	#[argh(option, default = "PathBuf::from(\"ffmpeg\")")]
	/// the ffmpeg executable used for decoding and the virtual camera (default: ffmpeg)
	pub ffmpeg: PathBuf,
}

impl CliArgs {
	pub async fn start_listening_for_video(&self) -> io::Result<TcpListener> {
		TcpListener::bind(&self.video_host).await
	}

	pub fn start_listening_for_http(&self) -> hyper::Result<Builder<AddrIncoming>> {
		Server::try_bind(&SocketAddr::V4(self.http_host))
	}

	pub fn session_config(&self) -> SessionConfig {
		SessionConfig {
			fps: self.fps.max(1),
			fixed_size: self.output_size,
			max_pending: self.max_pending,
			read_timeout: Duration::from_millis(self.read_timeout_ms.max(1)),
			metrics_interval: Duration::from_millis(self.metrics_interval_ms.max(1)),
		}
	}
}

#[cfg(test)]
mod tests {
	use argh::FromArgs;

	use super::*;

	fn parse(args: &[&str]) -> CliArgs {
		CliArgs::from_args(&["phonecam-receiver"], args).unwrap()
	}

	#[test]
	fn defaults() {
		let args = parse(&[]);
		assert_eq!(args.mode, StreamMode::Stream);
		assert_eq!(args.video_host.port(), 5000);
		assert_eq!(args.http_host.port(), 8000);
		assert_eq!(args.output, OutputTarget::Device(PathBuf::from("/dev/video10")));
		assert_eq!(args.output_size, None);

		let config = args.session_config();
		assert_eq!(config.fps, 60);
		assert_eq!(config.max_pending, 8 << 20);
		assert_eq!(config.read_timeout, Duration::from_secs(5));
	}

	#[test]
	fn overrides() {
		let args = parse(&["--mode", "signaling", "--output", "null", "--output-size", "1280x720", "--fps", "30"]);
		assert_eq!(args.mode, StreamMode::Signaling);
		assert_eq!(args.output, OutputTarget::Null);
		assert_eq!(args.session_config().fixed_size, Some(Resolution { width: 1280, height: 720 }));
		assert_eq!(args.session_config().fps, 30);
	}
}
