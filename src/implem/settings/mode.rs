use std::str::FromStr;

use crate::model::settings::{DecoderPreference, StreamMode};

impl Default for StreamMode {
	fn default() -> Self {
		StreamMode::Stream
	}
}

impl FromStr for StreamMode {
	type Err = String;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		match s.to_lowercase().as_str() {
			"stream" | "tcp" => Ok(StreamMode::Stream),
			"signaling" | "webrtc" => Ok(StreamMode::Signaling),
			_ => Err(format!("unrecognized mode: {}", s)),
		}
	}
}

impl StreamMode {
	pub fn name(&self) -> &'static str {
		match self {
			StreamMode::Stream => "stream",
			StreamMode::Signaling => "signaling",
		}
	}
}

impl Default for DecoderPreference {
	fn default() -> Self {
		DecoderPreference::Auto
	}
}

impl FromStr for DecoderPreference {
	type Err = String;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		match s.to_lowercase().as_str() {
			"auto" => Ok(DecoderPreference::Auto),
			"hardware" | "nvdec" | "cuvid" => Ok(DecoderPreference::Hardware),
			"software" | "cpu" => Ok(DecoderPreference::Software),
			_ => Err(format!("unrecognized decoder: {}", s)),
		}
	}
}
