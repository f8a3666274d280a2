use crate::model::settings::Rotation;

impl Rotation {
	/// Maps the control channel payload (quarter turns) to a rotation
	pub fn from_code(code: u8) -> Option<Self> {
		Some(match code {
			0 => Rotation::Normal,
			1 => Rotation::Clockwise90,
			2 => Rotation::UpsideDown,
			3 => Rotation::Anticlockwise90,
			_ => return None
		})
	}

	pub fn degrees(&self) -> u16 {
		match self {
			Rotation::Normal => 0,
			Rotation::Clockwise90 => 90,
			Rotation::UpsideDown => 180,
			Rotation::Anticlockwise90 => 270,
		}
	}
}
