use std::fmt;

use serde::Serialize;

use crate::model::settings::Rotation;

/// Admission state shared between the accepting context and the session task.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum AdmissionState {
	Idle,
	Accepting,
	Active { peer: String },
	Draining { peer: String },
}

impl AdmissionState {
	pub fn name(&self) -> &'static str {
		match self {
			AdmissionState::Idle => "idle",
			AdmissionState::Accepting => "accepting",
			AdmissionState::Active { .. } => "active",
			AdmissionState::Draining { .. } => "draining",
		}
	}
}

/// Geometry currently configured on the output device.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub struct SinkGeometry {
	pub width: u32,
	pub height: u32,
	pub fps: u32,
}

impl fmt::Display for SinkGeometry {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "{}x{}@{}fps", self.width, self.height, self.fps)
	}
}

/// Why a session left `Active`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum DrainReason {
	EndOfStream,
	TransportError(String),
	Overflow(usize),
	PeerClosed,
	Stopped,
}

impl fmt::Display for DrainReason {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		match self {
			DrainReason::EndOfStream => write!(f, "end of stream"),
			DrainReason::TransportError(e) => write!(f, "transport error: {}", e),
			DrainReason::Overflow(n) => write!(f, "{} bytes pending without a start code", n),
			DrainReason::PeerClosed => write!(f, "peer connection closed"),
			DrainReason::Stopped => write!(f, "stop requested"),
		}
	}
}

/// Everything an observer may learn about a session. Sent best-effort.
#[derive(Clone, Debug, PartialEq)]
pub enum SessionEvent {
	Connected { peer: String, decoder: &'static str },
	Disconnected { peer: String, reason: DrainReason },
	Orientation(Rotation),
	DecodeError { unit_code: Option<u8>, message: String },
	SinkOpened { geometry: SinkGeometry, device: String },
	SinkClosed,
	SinkDegraded(String),
	SinkRestored,
	Metrics(MetricsReport),
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize)]
pub struct MetricsReport {
	pub bitrate_bps: f64,
	pub fps: f64,
	pub frames_decoded: u64,
	pub decode_errors: u64,
}

/// Connection states reported by the signaling transport
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PeerState {
	New,
	Connecting,
	Connected,
	Disconnected,
	Failed,
	Closed,
}

impl PeerState {
	/// States from which the peer will not deliver media again.
	/// `Disconnected` can still recover through ICE restarts.
	pub fn is_terminal(&self) -> bool {
		matches!(self, PeerState::Failed | PeerState::Closed)
	}
}

/// Transport callbacks are turned into these and queued to the session task.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum PeerEvent {
	State(PeerState),
	/// One depacketised Annex-B access unit
	Sample(bytes::Bytes),
	TrackEnded,
}
