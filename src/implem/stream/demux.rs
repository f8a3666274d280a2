use std::collections::VecDeque;

use bytes::BytesMut;

use crate::model::settings::Rotation;
use crate::model::stream::{CONTROL_LEN, CONTROL_PREFIX, CONTROL_SUFFIX, ControlMessage, StreamEvent};

/// Pulls `FF 52 54 <rot> AA` records out of the media byte stream.
///
/// The prefix can occur inside compressed video, so every match is only a
/// candidate. A candidate is accepted when the payload is a quarter-turn code
/// and the suffix is the sentinel; otherwise the three prefix bytes are cut
/// and scanning resumes at the byte that followed them. Media that happens to
/// contain a well-formed record will be misread as one. There is no escaping
/// in the wire protocol, so this is a known limitation rather than a bug.
pub struct ControlDemuxer {
	/// Everything before this offset has been classified as media.
	cursor: usize,
	/// Accepted messages, keyed by the buffer offset they were cut from.
	pending: VecDeque<(usize, ControlMessage)>,
	false_positives: u64,
}

impl ControlDemuxer {
	pub fn new() -> Self {
		ControlDemuxer {
			cursor: 0,
			pending: VecDeque::new(),
			false_positives: 0,
		}
	}

	/// Scans the unclassified tail of `buffer`, cutting out control records.
	/// Returns the lowest offset that was edited, if any.
	pub fn scan(&mut self, buffer: &mut BytesMut) -> Option<usize> {
		let mut edited = None;
		let mut pos = self.cursor;

		loop {
			let p = match find_control_prefix(buffer, pos) {
				Some(p) => p,
				None => {
					// A prefix may still be completing in the last two bytes
					self.cursor = pos.max(buffer.len().saturating_sub(CONTROL_PREFIX.len() - 1));
					break;
				}
			};

			if buffer.len() - p < CONTROL_LEN {
				// Wait for the payload and suffix before classifying
				self.cursor = p;
				break;
			}

			let payload = buffer[p + CONTROL_PREFIX.len()];
			let suffix = buffer[p + CONTROL_PREFIX.len() + 1];
			match Rotation::from_code(payload) {
				Some(rotation) if suffix == CONTROL_SUFFIX => {
					excise(buffer, p, CONTROL_LEN);
					self.pending.push_back((p, ControlMessage { rotation }));
				}
				_ => {
					excise(buffer, p, CONTROL_PREFIX.len());
					self.false_positives += 1;
					debug!("Control prefix at {} rejected (payload {:#04x}, suffix {:#04x})", p, payload, suffix);
				}
			}

			edited.get_or_insert(p);
			pos = p;
		}

		return edited;
	}

	/// Moves every control message cut at or before `offset` into `events`.
	pub fn release_through(&mut self, offset: usize, events: &mut Vec<StreamEvent>) {
		while let Some((at, _)) = self.pending.front() {
			if *at > offset {
				break;
			}
			if let Some((_, msg)) = self.pending.pop_front() {
				events.push(StreamEvent::Control(msg));
			}
		}
	}

	/// Accounts for `n` bytes drained from the front of the buffer.
	pub fn consume(&mut self, n: usize) {
		self.cursor = self.cursor.saturating_sub(n);
		for (at, _) in self.pending.iter_mut() {
			*at = at.saturating_sub(n);
		}
	}

	pub fn false_positives(&self) -> u64 {
		self.false_positives
	}

	pub fn reset(&mut self) {
		self.cursor = 0;
		self.pending.clear();
	}
}

fn find_control_prefix(data: &[u8], from: usize) -> Option<usize> {
	if from >= data.len() {
		return None;
	}

	data[from..]
		.windows(CONTROL_PREFIX.len())
		.position(|w| w == CONTROL_PREFIX)
		.map(|i| i + from)
}

/// Removes `len` bytes at `at`, keeping the order of everything else.
fn excise(buffer: &mut BytesMut, at: usize, len: usize) {
	let end = buffer.len();
	buffer.copy_within(at + len..end, at);
	buffer.truncate(end - len);
}

#[cfg(test)]
mod tests {
	use super::*;

	fn scan_all(bytes: &[u8]) -> (BytesMut, ControlDemuxer) {
		let mut buffer = BytesMut::from(bytes);
		let mut demux = ControlDemuxer::new();
		demux.scan(&mut buffer);
		(buffer, demux)
	}

	fn drain(demux: &mut ControlDemuxer) -> Vec<StreamEvent> {
		let mut events = vec![];
		demux.release_through(usize::MAX, &mut events);
		events
	}

	#[test]
	fn valid_record_is_cut_and_preserves_neighbours() {
		let (buffer, mut demux) = scan_all(&[0x11, 0x22, 0xFF, 0x52, 0x54, 0x02, 0xAA, 0x33, 0x44]);

		assert_eq!(&buffer[..], &[0x11, 0x22, 0x33, 0x44]);
		assert_eq!(drain(&mut demux), vec![StreamEvent::Control(ControlMessage { rotation: Rotation::UpsideDown })]);
	}

	#[test]
	fn bad_payload_only_drops_prefix() {
		let (buffer, mut demux) = scan_all(&[0x11, 0xFF, 0x52, 0x54, 0x09, 0xAA, 0x33]);

		assert_eq!(&buffer[..], &[0x11, 0x09, 0xAA, 0x33]);
		assert!(drain(&mut demux).is_empty());
		assert_eq!(demux.false_positives(), 1);
	}

	#[test]
	fn bad_suffix_only_drops_prefix() {
		let (buffer, mut demux) = scan_all(&[0xFF, 0x52, 0x54, 0x01, 0x00, 0x00, 0x00, 0x01]);

		assert_eq!(&buffer[..], &[0x01, 0x00, 0x00, 0x00, 0x01]);
		assert!(drain(&mut demux).is_empty());
	}

	#[test]
	fn record_following_a_false_positive_is_found() {
		let (buffer, mut demux) = scan_all(&[0xFF, 0x52, 0x54, 0xFF, 0x52, 0x54, 0x03, 0xAA, 0x77]);

		assert_eq!(&buffer[..], &[0x77]);
		assert_eq!(drain(&mut demux), vec![StreamEvent::Control(ControlMessage { rotation: Rotation::Anticlockwise90 })]);
	}

	#[test]
	fn incomplete_candidate_waits_for_more_bytes() {
		let mut buffer = BytesMut::from(&[0x10, 0xFF, 0x52][..]);
		let mut demux = ControlDemuxer::new();
		assert_eq!(demux.scan(&mut buffer), None);
		assert_eq!(buffer.len(), 3);

		buffer.extend_from_slice(&[0x54, 0x01]);
		assert_eq!(demux.scan(&mut buffer), None);
		assert_eq!(buffer.len(), 5);

		buffer.extend_from_slice(&[0xAA, 0x20]);
		assert_eq!(demux.scan(&mut buffer), Some(1));
		assert_eq!(&buffer[..], &[0x10, 0x20]);
		assert_eq!(drain(&mut demux), vec![StreamEvent::Control(ControlMessage { rotation: Rotation::Clockwise90 })]);
	}

	#[test]
	fn release_respects_offsets() {
		let (_, mut demux) = scan_all(&[0x01, 0x02, 0x03, 0xFF, 0x52, 0x54, 0x01, 0xAA, 0x04]);
		let mut events = vec![];

		demux.release_through(2, &mut events);
		assert!(events.is_empty());

		demux.consume(2);
		demux.release_through(1, &mut events);
		assert_eq!(events.len(), 1);
	}
}
