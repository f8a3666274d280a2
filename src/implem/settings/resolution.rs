use std::str::FromStr;

use crate::model::settings::Resolution;

impl FromStr for Resolution {
	type Err = String;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		let (width, height) = s.split_once('x')
			.ok_or_else(|| format!("failed to split the resolution {} by the delimiter 'x'", s))?;

		let width = width.parse().map_err(|e| format!("bad width {}: {}", width, e))?;
		let height = height.parse().map_err(|e| format!("bad height {}: {}", height, e))?;
		if width == 0 || height == 0 {
			return Err(format!("resolution {} has a zero dimension", s));
		}

		Ok(Resolution { width, height })
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn parses_width_by_height() {
		assert_eq!("1280x720".parse::<Resolution>().unwrap(), Resolution { width: 1280, height: 720 });
		assert!("1280".parse::<Resolution>().is_err());
		assert!("0x720".parse::<Resolution>().is_err());
	}
}
