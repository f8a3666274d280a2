use crate::model::stream::START_CODE;

/// Store-and-forward splitting of an Annex-B byte stream.
///
/// A unit is only handed out once the start code that follows it has arrived,
/// so the decoder never sees a truncated unit while the stream is live.
pub struct Framer {
	/// Offset of the start code opening the unit being assembled
	first: Option<usize>,
	/// Where the next start code search resumes
	scan_from: usize,
}

impl Framer {
	pub fn new() -> Self {
		Framer {
			first: None,
			scan_from: 0,
		}
	}

	/// Finds the next complete unit in `data` as `(first, next)`: the unit is
	/// `data[first..next]`. The caller must drain `next` bytes before calling
	/// again.
	pub fn split(&mut self, data: &[u8]) -> Option<(usize, usize)> {
		let first = match self.first {
			Some(first) => first,
			None => match find_start_code(data, self.scan_from) {
				Some(first) => {
					self.first = Some(first);
					first
				}
				None => {
					self.scan_from = self.scan_from.max(data.len().saturating_sub(START_CODE.len() - 1));
					return None;
				}
			}
		};

		let from = self.scan_from.max(first + START_CODE.len());
		match find_start_code(data, from) {
			Some(next) => {
				// The next unit's start code sits at 0 once the caller drains
				self.first = None;
				self.scan_from = 0;
				Some((first, next))
			}
			None => {
				self.scan_from = from.max(data.len().saturating_sub(START_CODE.len() - 1));
				None
			}
		}
	}

	/// Offset of the start code opening the unit still being assembled
	pub fn unit_start(&self) -> Option<usize> {
		self.first
	}

	/// Bytes at or after `offset` changed underneath us.
	pub fn rewind(&mut self, offset: usize) {
		match self.first {
			Some(first) if offset <= first => {
				self.first = None;
				self.scan_from = 0;
			}
			Some(first) => {
				self.scan_from = self.scan_from
					.min(offset.saturating_sub(START_CODE.len() - 1))
					.max(first + START_CODE.len());
			}
			None => {
				self.scan_from = self.scan_from.min(offset.saturating_sub(START_CODE.len() - 1));
			}
		}
	}

	pub fn reset(&mut self) {
		self.first = None;
		self.scan_from = 0;
	}
}

pub fn find_start_code(data: &[u8], from: usize) -> Option<usize> {
	if from >= data.len() {
		return None;
	}

	data[from..]
		.windows(START_CODE.len())
		.position(|w| w == START_CODE)
		.map(|i| i + from)
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn finds_start_codes() {
		let data = [0x09, 0x00, 0x00, 0x00, 0x01, 0x67, 0x00, 0x00, 0x00, 0x01];
		assert_eq!(find_start_code(&data, 0), Some(1));
		assert_eq!(find_start_code(&data, 2), Some(6));
		assert_eq!(find_start_code(&data, 7), None);
		assert_eq!(find_start_code(&data, 100), None);
	}

	#[test]
	fn waits_for_the_following_start_code() {
		let mut framer = Framer::new();
		let mut data = vec![0x00, 0x00, 0x00, 0x01, 0x65, 0x88];
		assert_eq!(framer.split(&data), None);

		data.extend_from_slice(&[0x00, 0x00]);
		assert_eq!(framer.split(&data), None);

		data.extend_from_slice(&[0x00, 0x01, 0x41]);
		assert_eq!(framer.split(&data), Some((0, 6)));
	}

	#[test]
	fn three_byte_start_codes_do_not_split() {
		let mut framer = Framer::new();
		let data = [0x00, 0x00, 0x00, 0x01, 0x65, 0x00, 0x00, 0x01, 0x41];
		assert_eq!(framer.split(&data), None);
	}

	#[test]
	fn rewind_before_first_rescans() {
		let mut framer = Framer::new();
		let data = [0x00, 0x00, 0x00, 0x01, 0x65];
		assert_eq!(framer.split(&data), None);

		framer.rewind(0);
		let data = [0x00, 0x00, 0x00, 0x01, 0x00, 0x00, 0x00, 0x01];
		assert_eq!(framer.split(&data), Some((0, 4)));
	}
}
