use std::path::PathBuf;
use std::str::FromStr;

use crate::model::settings::OutputTarget;

impl Default for OutputTarget {
	fn default() -> Self {
		OutputTarget::Device(PathBuf::from("/dev/video10"))
	}
}

impl FromStr for OutputTarget {
	type Err = String;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		if s.is_empty() {
			return Err("empty output target".to_string());
		}
		if s.eq_ignore_ascii_case("null") || s.eq_ignore_ascii_case("none") {
			return Ok(OutputTarget::Null);
		}

		Ok(OutputTarget::Device(PathBuf::from(s)))
	}
}

impl OutputTarget {
	pub fn describe(&self) -> String {
		match self {
			OutputTarget::Null => "null".to_string(),
			OutputTarget::Device(p) => p.display().to_string(),
		}
	}
}
