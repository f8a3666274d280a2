use bytes::BytesMut;
use thiserror::Error;

use crate::implem::stream::demux::ControlDemuxer;
use crate::implem::stream::framer::{find_start_code, Framer};
use crate::model::stream::{AccessUnit, START_CODE, StreamEvent};

pub mod demux;
pub mod framer;

#[derive(Debug, Error)]
pub enum StreamError {
	#[error("{pending} bytes pending without a complete unit (limit {limit})")]
	Overflow { pending: usize, limit: usize },
}

/// Owns one session's byte buffer. Control records are cut out of each
/// chunk before the framer looks for start codes, and orientation changes
/// come back interleaved with units in the order they appeared on the wire.
pub struct StreamReassembler {
	buffer: BytesMut,
	demux: ControlDemuxer,
	framer: Framer,
	max_pending: usize,
}

impl StreamReassembler {
	pub fn new(max_pending: usize) -> Self {
		StreamReassembler {
			buffer: BytesMut::with_capacity(1 << 20),
			demux: ControlDemuxer::new(),
			framer: Framer::new(),
			max_pending,
		}
	}

	pub fn push(&mut self, chunk: &[u8]) -> Result<Vec<StreamEvent>, StreamError> {
		self.buffer.extend_from_slice(chunk);

		if let Some(edited) = self.demux.scan(&mut self.buffer) {
			self.framer.rewind(edited);
		}

		let mut events = Vec::new();
		while let Some((first, next)) = self.framer.split(&self.buffer) {
			self.demux.release_through(first, &mut events);

			let unit = self.buffer.split_to(next).freeze().slice(first..);
			// A start code directly followed by another carries nothing
			if unit.len() > START_CODE.len() {
				events.push(StreamEvent::Unit(AccessUnit::new(unit)));
			}

			self.demux.release_through(next, &mut events);
			self.demux.consume(next);
		}

		// Controls ahead of any unit in progress can't be overtaken by one
		let boundary = self.framer.unit_start().unwrap_or(usize::MAX);
		self.demux.release_through(boundary, &mut events);

		if self.buffer.len() > self.max_pending {
			return Err(StreamError::Overflow {
				pending: self.buffer.len(),
				limit: self.max_pending,
			});
		}

		Ok(events)
	}

	/// Flushes the trailing unit at end of stream. The reassembler is empty
	/// afterwards.
	pub fn finish(&mut self) -> Vec<StreamEvent> {
		let rest = self.buffer.split().freeze();
		let mut events = Vec::new();

		if let Some(first) = find_start_code(&rest, 0) {
			self.demux.release_through(first, &mut events);
			if rest.len() - first > START_CODE.len() {
				events.push(StreamEvent::Unit(AccessUnit::new(rest.slice(first..))));
			}
		}
		self.demux.release_through(usize::MAX, &mut events);

		self.demux.reset();
		self.framer.reset();
		events
	}

	#[cfg(test)]
	pub fn pending(&self) -> usize {
		self.buffer.len()
	}

	pub fn false_positives(&self) -> u64 {
		self.demux.false_positives()
	}
}

#[cfg(test)]
mod tests {
	use proptest::prelude::*;

	use super::*;
	use crate::model::settings::Rotation;
	use crate::model::stream::{ControlMessage, CONTROL_LEN, CONTROL_SUFFIX};

	fn unit(payload: &[u8]) -> Vec<u8> {
		let mut v = START_CODE.to_vec();
		v.extend_from_slice(payload);
		v
	}

	fn units(events: &[StreamEvent]) -> Vec<Vec<u8>> {
		events.iter()
			.filter_map(|e| match e {
				StreamEvent::Unit(u) => Some(u.raw_bytes.to_vec()),
				_ => None,
			})
			.collect()
	}

	fn push_chunked(stream: &[u8], sizes: &[usize]) -> Vec<StreamEvent> {
		push_chunked_into(&mut StreamReassembler::new(1 << 20), stream, sizes)
	}

	fn push_chunked_into(reassembler: &mut StreamReassembler, stream: &[u8], sizes: &[usize]) -> Vec<StreamEvent> {
		let mut events = vec![];
		let mut rest = stream;
		let mut i = 0;
		while !rest.is_empty() {
			let n = sizes[i % sizes.len()].min(rest.len()).max(1);
			events.extend(reassembler.push(&rest[..n]).unwrap());
			rest = &rest[n..];
			i += 1;
		}
		events
	}

	#[test]
	fn emits_units_in_order() {
		let mut stream = vec![];
		stream.extend(unit(&[0x67, 0x42]));
		stream.extend(unit(&[0x68, 0xCE]));
		stream.extend(unit(&[0x65, 0x88, 0x84]));
		stream.extend(START_CODE);

		let events = push_chunked(&stream, &[stream.len()]);
		assert_eq!(units(&events), vec![unit(&[0x67, 0x42]), unit(&[0x68, 0xCE]), unit(&[0x65, 0x88, 0x84])]);
	}

	#[test]
	fn one_byte_at_a_time() {
		let mut stream = vec![];
		stream.extend(unit(&[0x67, 0x42, 0x00, 0x1f]));
		stream.extend(unit(&[0x65, 0xFF, 0x52, 0x10]));
		stream.extend(START_CODE);

		let events = push_chunked(&stream, &[1]);
		assert_eq!(units(&events), vec![unit(&[0x67, 0x42, 0x00, 0x1f]), unit(&[0x65, 0xFF, 0x52, 0x10])]);
	}

	#[test]
	fn control_record_is_removed_and_ordered() {
		let au1 = unit(&[0x65, 0x11, 0x22]);
		let au2 = unit(&[0x41, 0x33, 0x44]);
		let mut stream = vec![];
		stream.extend(&au1);
		stream.extend(START_CODE);
		stream.extend([0xFF, 0x52, 0x54, 0x01, 0xAA]);
		stream.extend(&au2);
		stream.extend(START_CODE);

		let events = push_chunked(&stream, &[stream.len()]);
		assert_eq!(events, vec![
			StreamEvent::Unit(AccessUnit::new(au1.into())),
			StreamEvent::Control(ControlMessage { rotation: Rotation::Clockwise90 }),
			StreamEvent::Unit(AccessUnit::new(au2.into())),
		]);
	}

	#[test]
	fn control_inside_a_unit_keeps_surrounding_bytes() {
		let mut stream = unit(&[0x65, 0x11]);
		stream.extend([0xFF, 0x52, 0x54, 0x02, 0xAA]);
		stream.extend([0x22, 0x33]);
		stream.extend(START_CODE);

		let events = push_chunked(&stream, &[3]);
		assert_eq!(events, vec![
			StreamEvent::Unit(AccessUnit::new(unit(&[0x65, 0x11, 0x22, 0x33]).into())),
			StreamEvent::Control(ControlMessage { rotation: Rotation::UpsideDown }),
		]);
	}

	#[test]
	fn false_positive_prefix_is_media() {
		let mut stream = unit(&[0x65, 0xFF, 0x52, 0x54, 0x09, 0xAA, 0x10]);
		stream.extend(START_CODE);

		let events = push_chunked(&stream, &[2]);
		assert_eq!(events, vec![StreamEvent::Unit(AccessUnit::new(unit(&[0x65, 0x09, 0xAA, 0x10]).into()))]);
	}

	#[test]
	fn control_record_can_complete_a_start_code() {
		// 00 00 | record | 00 01 is a start code once the record is gone
		let mut stream = unit(&[0x65, 0x10, 0x00, 0x00]);
		stream.extend([0xFF, 0x52, 0x54, 0x00, 0xAA]);
		stream.extend([0x00, 0x01, 0x41, 0x20]);
		stream.extend(START_CODE);

		let events = push_chunked(&stream, &[1]);
		assert_eq!(units(&events), vec![unit(&[0x65, 0x10]), unit(&[0x41, 0x20])]);
	}

	#[test]
	fn lone_control_record_is_released() {
		let mut reassembler = StreamReassembler::new(1 << 20);
		let events = reassembler.push(&[0xFF, 0x52, 0x54, 0x03, 0xAA]).unwrap();
		assert_eq!(events, vec![StreamEvent::Control(ControlMessage { rotation: Rotation::Anticlockwise90 })]);
		assert_eq!(reassembler.pending(), 0);
	}

	#[test]
	fn finish_flushes_trailing_unit() {
		let mut reassembler = StreamReassembler::new(1 << 20);
		let events = reassembler.push(&unit(&[0x65, 0x01, 0x02])).unwrap();
		assert!(events.is_empty());

		let events = reassembler.finish();
		assert_eq!(units(&events), vec![unit(&[0x65, 0x01, 0x02])]);
		assert_eq!(reassembler.pending(), 0);
	}

	#[test]
	fn leading_garbage_is_dropped() {
		let mut stream = vec![0x42, 0x42];
		stream.extend(unit(&[0x67]));
		stream.extend(START_CODE);

		let events = push_chunked(&stream, &[4]);
		assert_eq!(units(&events), vec![unit(&[0x67])]);
	}

	#[test]
	fn overflow_is_fatal() {
		let mut reassembler = StreamReassembler::new(16);
		let mut data = unit(&[0x65]);
		data.extend([0x10; 32]);

		match reassembler.push(&data) {
			Err(StreamError::Overflow { pending, limit }) => {
				assert_eq!(pending, 37);
				assert_eq!(limit, 16);
			}
			other => panic!("expected overflow, got {:?}", other.map(|e| e.len())),
		}
	}

	proptest! {
		#[test]
		fn chunking_does_not_change_units(
			payloads in prop::collection::vec(prop::collection::vec(0x02u8..=0xFE, 1..48), 1..10),
			sizes in prop::collection::vec(1usize..40, 1..8),
		) {
			let mut stream = vec![];
			let mut expected = vec![];
			for p in &payloads {
				let u = unit(p);
				stream.extend(&u);
				expected.push(u);
			}
			stream.extend(START_CODE);

			let events = push_chunked(&stream, &sizes);
			prop_assert_eq!(units(&events), expected);
		}

		#[test]
		fn embedded_controls_are_excised_under_any_chunking(
			payloads in prop::collection::vec(prop::collection::vec(0x02u8..=0xFE, 1..32), 1..8),
			records in prop::collection::vec((any::<prop::sample::Index>(), any::<prop::sample::Index>(), control_record()), 0..6),
			sizes in prop::collection::vec(1usize..40, 1..8),
		) {
			let mut stream = vec![];
			let mut expected_units = vec![];
			let mut expected_controls = vec![];
			let mut rejected = 0;

			for (i, payload) in payloads.iter().enumerate() {
				let mut placed: Vec<(usize, &[u8; CONTROL_LEN])> = records.iter()
					.filter(|(at_unit, _, _)| at_unit.index(payloads.len()) == i)
					.map(|(_, at, record)| (at.index(payload.len() + 1), record))
					.collect();
				placed.sort_by_key(|(offset, _)| *offset);

				let mut wire = START_CODE.to_vec();
				let mut media = START_CODE.to_vec();
				let mut next = 0;
				for (offset, record) in placed {
					wire.extend(&payload[next..offset]);
					media.extend(&payload[next..offset]);
					next = offset;

					wire.extend(record);
					match Rotation::from_code(record[3]) {
						Some(rotation) if record[4] == CONTROL_SUFFIX => expected_controls.push(rotation),
						// only the prefix goes, the rest stays media
						_ => {
							rejected += 1;
							media.extend(&record[3..]);
						}
					}
				}
				wire.extend(&payload[next..]);
				media.extend(&payload[next..]);

				stream.extend(wire);
				expected_units.push(media);
			}
			stream.extend(START_CODE);

			let mut reassembler = StreamReassembler::new(1 << 20);
			let events = push_chunked_into(&mut reassembler, &stream, &sizes);
			let controls: Vec<Rotation> = events.iter()
				.filter_map(|e| match e {
					StreamEvent::Control(msg) => Some(msg.rotation),
					_ => None,
				})
				.collect();

			prop_assert_eq!(units(&events), expected_units);
			prop_assert_eq!(controls, expected_controls);
			prop_assert_eq!(reassembler.false_positives(), rejected);
		}
	}

	/// Well-formed records, and records with a bad code or a bad suffix
	fn control_record() -> impl Strategy<Value = [u8; CONTROL_LEN]> {
		prop_oneof![
			(0u8..4).prop_map(|code| [0xFF, 0x52, 0x54, code, CONTROL_SUFFIX]),
			(4u8..=0xFE).prop_map(|code| [0xFF, 0x52, 0x54, code, CONTROL_SUFFIX]),
			(0u8..4, 0x02u8..=0xFE)
				.prop_filter("suffix must be wrong", |(_, suffix)| *suffix != CONTROL_SUFFIX)
				.prop_map(|(code, suffix)| [0xFF, 0x52, 0x54, code, suffix]),
		]
	}
}
