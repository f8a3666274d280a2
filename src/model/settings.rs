use std::path::PathBuf;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StreamMode {
	/// Raw Annex-B H.264 over a plain TCP socket
	Stream,
	/// SDP offer/answer over HTTP, media over WebRTC
	Signaling,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DecoderPreference {
	Auto,
	Hardware,
	Software,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum OutputTarget {
	/// Accept frames and drop them
	Null,
	/// A v4l2loopback device node
	Device(PathBuf),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Resolution {
	pub width: u32,
	pub height: u32,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Rotation {
	Normal,
	Clockwise90,
	UpsideDown,
	Anticlockwise90,
}
