use bytes::Bytes;
use image::RgbImage;

use crate::model::settings::Rotation;

/// Annex-B start code delimiting access units
pub const START_CODE: [u8; 4] = [0x00, 0x00, 0x00, 0x01];

/// `\xFF R T`
pub const CONTROL_PREFIX: [u8; 3] = [0xFF, 0x52, 0x54];
pub const CONTROL_SUFFIX: u8 = 0xAA;
pub const CONTROL_LEN: usize = 5;

/// One coded unit, leading start code included.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AccessUnit {
	pub raw_bytes: Bytes,
}

impl AccessUnit {
	pub fn new(raw_bytes: Bytes) -> Self {
		AccessUnit { raw_bytes }
	}

	/// NAL unit type of the first NAL in the unit, if the unit carries a header byte
	pub fn unit_code(&self) -> Option<u8> {
		// There's 32 possible NAL unit codes for H264
		self.raw_bytes.get(START_CODE.len()).map(|b| b & 0x1f)
	}

	/// Whether the unit holds the first slice of a coded picture: a slice NAL
	/// whose `first_mb_in_slice` is 0, which Exp-Golomb codes as a single set
	/// bit. NALs after the first may use three byte start codes.
	pub fn starts_picture(&self) -> bool {
		self.raw_bytes
			.windows(5)
			.filter(|w| w[..3] == [0, 0, 1])
			.any(|w| matches!(w[3] & 0x1f, 1 | 5) && w[4] & 0x80 != 0)
	}

	pub fn len(&self) -> usize {
		self.raw_bytes.len()
	}
}

/// A decoded picture and the orientation that was in effect when its unit
/// went into the decoder.
#[derive(Clone, Debug, PartialEq)]
pub struct OutputFrame {
	pub image: RgbImage,
	pub rotation: Rotation,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ControlMessage {
	pub rotation: Rotation,
}

/// What the reassembler hands to the session, in stream order.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum StreamEvent {
	Unit(AccessUnit),
	Control(ControlMessage),
}
