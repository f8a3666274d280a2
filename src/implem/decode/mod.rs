use std::io;
use std::path::PathBuf;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::OnceCell;

use crate::implem::decode::ffmpeg::{Backend, FfmpegDecoder};
use crate::model::settings::{DecoderPreference, Rotation};
use crate::model::stream::{AccessUnit, OutputFrame};

pub mod ffmpeg;

#[derive(Debug, Error)]
pub enum DecodeError {
	#[error("decoder unavailable: {0}")]
	Unavailable(String),
	#[error("decoder rejected unit: {0}")]
	Rejected(String),
	#[error("decoder i/o: {0}")]
	Io(#[from] io::Error),
}

/// Whatever a decoder has to hand back: finished frames in decode order, and
/// errors it reported on units it had already accepted.
#[derive(Debug, Default)]
pub struct Decoded {
	pub frames: Vec<OutputFrame>,
	pub errors: Vec<String>,
}

impl Decoded {
	pub fn is_empty(&self) -> bool {
		self.frames.is_empty() && self.errors.is_empty()
	}

	fn append(&mut self, mut other: Decoded) {
		self.frames.append(&mut other.frames);
		self.errors.append(&mut other.errors);
	}
}

/// A decoder instance owned by one session.
#[async_trait]
pub trait DecodeContext: Send {
	fn name(&self) -> &'static str;

	/// Feeds one access unit. Frames of this unit carry `rotation` whenever
	/// they come out, so orientation is bound at submission.
	async fn submit(&mut self, unit: &AccessUnit, rotation: Rotation) -> Result<Decoded, DecodeError>;

	/// Output that became ready without new input
	fn poll(&mut self) -> Decoded {
		Decoded::default()
	}

	/// Signals end of stream and drains buffered frames. The context is spent
	/// afterwards.
	async fn flush(&mut self) -> Result<Decoded, DecodeError>;
}

/// Picks the decode context for a session, once, at session start.
#[async_trait]
pub trait DecoderFactory: Send + Sync {
	async fn acquire(&self) -> Result<Box<dyn DecodeContext>, DecodeError>;
}

/// Tries the hardware path first and falls back to software when it cannot
/// be acquired. Whether the hardware path exists is probed once.
pub struct FfmpegDecoderFactory {
	preference: DecoderPreference,
	ffmpeg: PathBuf,
	hardware: OnceCell<bool>,
}

impl FfmpegDecoderFactory {
	pub fn new(preference: DecoderPreference, ffmpeg: PathBuf) -> Self {
		FfmpegDecoderFactory {
			preference,
			ffmpeg,
			hardware: OnceCell::new(),
		}
	}

	async fn hardware_usable(&self) -> bool {
		let path = &self.ffmpeg;
		*self.hardware
			.get_or_init(|| async move {
				let usable = ffmpeg::decoder_listed(path, Backend::Cuvid.name()).await && ffmpeg::cuda_device_usable(path).await;
				info!("Hardware decoding {}", if usable { "available" } else { "not available" });
				usable
			})
			.await
	}
}

#[async_trait]
impl DecoderFactory for FfmpegDecoderFactory {
	async fn acquire(&self) -> Result<Box<dyn DecodeContext>, DecodeError> {
		if self.preference != DecoderPreference::Software {
			let hardware = if self.hardware_usable().await {
				FfmpegDecoder::spawn(&self.ffmpeg, Backend::Cuvid)
			} else {
				Err(DecodeError::Unavailable(format!("{} is not usable on this machine", Backend::Cuvid.name())))
			};

			match hardware {
				Ok(decoder) => return Ok(Box::new(decoder)),
				Err(e) if self.preference == DecoderPreference::Hardware => {
					warn!("Hardware decoding was requested but is unavailable ({}), falling back to software", e);
				}
				Err(e) => info!("Hardware decoding unavailable ({}), using software", e),
			}
		}

		Ok(Box::new(FfmpegDecoder::spawn(&self.ffmpeg, Backend::Software)?))
	}
}
