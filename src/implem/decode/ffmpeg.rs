use std::collections::VecDeque;
use std::io::{self, ErrorKind};
use std::mem;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use image::{ImageFormat, RgbImage};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, Command};
use tokio::sync::mpsc;
use tokio::time::timeout;

use crate::implem::decode::{DecodeContext, DecodeError, Decoded};
use crate::model::settings::Rotation;
use crate::model::stream::{AccessUnit, OutputFrame, START_CODE};

// A 4K BGR bitmap is ~25MiB
const MAX_BITMAP: usize = 64 << 20;
const FRAME_QUEUE: usize = 16;
const ERROR_QUEUE: usize = 64;
/// Pictures submitted but not yet seen on the output. ffmpeg may drop a
/// broken picture, so the oldest tag goes once this many are outstanding.
const MAX_IN_FLIGHT: usize = 8;
const FLUSH_GRACE: Duration = Duration::from_secs(2);
const PROBE_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Backend {
	/// NVDEC through ffmpeg's h264_cuvid
	Cuvid,
	/// libavcodec's h264 with slice threading
	Software,
}

impl Backend {
	pub fn name(&self) -> &'static str {
		match self {
			Backend::Cuvid => "h264_cuvid",
			Backend::Software => "h264",
		}
	}

	fn args(&self) -> Vec<&'static str> {
		let mut args = vec!["-hide_banner", "-loglevel", "error", "-nostats", "-nostdin"];

		// Don't sit on input while probing, emit each picture as soon as it is complete
		args.extend(["-probesize", "32", "-analyzeduration", "0", "-fflags", "nobuffer", "-flags", "low_delay"]);
		match self {
			Backend::Cuvid => args.extend(["-c:v", "h264_cuvid"]),
			Backend::Software => args.extend(["-threads", "0", "-thread_type", "slice", "-c:v", "h264"]),
		}

		args.extend([
			"-f", "h264",
			"-i", "pipe:0",
			"-pix_fmt", "bgr24",
			"-f", "image2pipe",
			"-c:v", "bmp",
			"pipe:1",
		]);
		return args;
	}
}

/// Whether this ffmpeg build lists `name` among its decoders
pub async fn decoder_listed(ffmpeg: &Path, name: &str) -> bool {
	let out = Command::new(ffmpeg)
		.args(["-hide_banner", "-decoders"])
		.stdin(Stdio::null())
		.stdout(Stdio::piped())
		.stderr(Stdio::null())
		.kill_on_drop(true)
		.output();

	match timeout(PROBE_TIMEOUT, out).await {
		Ok(Ok(out)) if out.status.success() => String::from_utf8_lossy(&out.stdout)
			.lines()
			.any(|l| l.split_whitespace().nth(1) == Some(name)),
		_ => false,
	}
}

/// Whether a CUDA device can actually be opened
pub async fn cuda_device_usable(ffmpeg: &Path) -> bool {
	let status = Command::new(ffmpeg)
		.args(["-hide_banner", "-loglevel", "error", "-init_hw_device", "cuda", "-f", "lavfi", "-i", "nullsrc=s=16x16", "-frames:v", "1", "-f", "null", "-"])
		.stdin(Stdio::null())
		.stdout(Stdio::null())
		.stderr(Stdio::null())
		.kill_on_drop(true)
		.status();

	matches!(timeout(PROBE_TIMEOUT, status).await, Ok(Ok(status)) if status.success())
}

struct Process {
	child: Child,
	stdin: Option<ChildStdin>,
	frames: mpsc::Receiver<RgbImage>,
	errors: mpsc::Receiver<String>,
}

impl Process {
	fn spawn(program: &Path, args: &[String], name: &'static str) -> io::Result<Self> {
		let mut child = Command::new(program)
			.args(args)
			.stdin(Stdio::piped())
			.stdout(Stdio::piped())
			.stderr(Stdio::piped())
			.kill_on_drop(true)
			.spawn()?;

		let stdin = child.stdin.take();
		let (stdout, stderr) = match (child.stdout.take(), child.stderr.take()) {
			(Some(stdout), Some(stderr)) => (stdout, stderr),
			_ => return Err(io::Error::new(ErrorKind::BrokenPipe, "decoder pipes unavailable")),
		};

		let (frame_tx, frames) = mpsc::channel(FRAME_QUEUE);
		tokio::spawn(async move {
			if let Err(e) = pump_bitmaps(BufReader::new(stdout), frame_tx).await {
				warn!("{} output stream broke: {}", name, e);
			}
		});

		let (error_tx, errors) = mpsc::channel(ERROR_QUEUE);
		tokio::spawn(pump_errors(BufReader::new(stderr), error_tx));

		Ok(Process {
			child,
			stdin,
			frames,
			errors,
		})
	}

	/// Writes one unit, taking frames off the output meanwhile so that a full
	/// stdout can never stall ffmpeg's reads.
	async fn write(&mut self, bytes: &[u8], received: &mut Vec<RgbImage>) -> io::Result<()> {
		let stdin = match self.stdin.as_mut() {
			Some(stdin) => stdin,
			None => return Err(io::Error::new(ErrorKind::BrokenPipe, "decoder input already closed")),
		};
		let frames = &mut self.frames;

		let write = stdin.write_all(bytes);
		tokio::pin!(write);
		loop {
			tokio::select! {
				written = &mut write => return written,
				Some(image) = frames.recv() => received.push(image),
			}
		}
	}

	fn ready(&mut self) -> (Vec<RgbImage>, Vec<String>) {
		let mut frames = vec![];
		while let Ok(frame) = self.frames.try_recv() {
			frames.push(frame);
		}
		let mut errors = vec![];
		while let Ok(error) = self.errors.try_recv() {
			errors.push(error);
		}
		return (frames, errors);
	}

	/// Closes ffmpeg's input and collects what it still emits, giving up
	/// after `FLUSH_GRACE`.
	async fn finish(mut self, name: &str) -> (Vec<RgbImage>, Vec<String>) {
		drop(self.stdin.take());

		let mut frames = vec![];
		let drained = timeout(FLUSH_GRACE, async {
			while let Some(frame) = self.frames.recv().await {
				frames.push(frame);
			}
		})
		.await;
		if drained.is_err() {
			warn!("{} did not finish within {:?}, killing it", name, FLUSH_GRACE);
		}

		let _ = self.child.start_kill();
		let _ = timeout(FLUSH_GRACE, self.child.wait()).await;

		let mut errors = vec![];
		let _ = timeout(FLUSH_GRACE, async {
			while let Some(error) = self.errors.recv().await {
				errors.push(error);
			}
		})
		.await;
		return (frames, errors);
	}
}

/// Decodes by piping access units through an ffmpeg child process and
/// reading back a stream of bitmaps.
///
/// ffmpeg reorders and delays pictures, so every picture submitted pushes the
/// rotation it was submitted under and every bitmap that comes back takes the
/// oldest one.
pub struct FfmpegDecoder {
	name: &'static str,
	program: PathBuf,
	args: Vec<String>,
	process: Option<Process>,
	in_flight: VecDeque<Rotation>,
	submitted: Rotation,
	ready: Decoded,
}

impl FfmpegDecoder {
	pub fn spawn(ffmpeg: &Path, backend: Backend) -> Result<Self, DecodeError> {
		let args = backend.args().into_iter().map(String::from).collect();
		Self::start(backend.name(), ffmpeg.to_path_buf(), args)
	}

	/// Runs `program` as the decoder. It must read Annex-B on stdin and
	/// write concatenated bitmaps on stdout.
	pub fn start(name: &'static str, program: PathBuf, args: Vec<String>) -> Result<Self, DecodeError> {
		let mut decoder = FfmpegDecoder {
			name,
			program,
			args,
			process: None,
			in_flight: VecDeque::new(),
			submitted: Rotation::Normal,
			ready: Decoded::default(),
		};
		decoder.process = Some(decoder.launch()?);

		info!("Started {} decoder", name);
		Ok(decoder)
	}

	fn launch(&self) -> Result<Process, DecodeError> {
		Process::spawn(&self.program, &self.args, self.name)
			.map_err(|e| DecodeError::Unavailable(format!("cannot start {}: {}", self.program.display(), e)))
	}

	fn absorb(&mut self, frames: Vec<RgbImage>, errors: Vec<String>) {
		for image in frames {
			let rotation = self.in_flight.pop_front().unwrap_or(self.submitted);
			self.ready.frames.push(OutputFrame { image, rotation });
		}
		self.ready.errors.extend(errors);
	}
}

#[async_trait]
impl DecodeContext for FfmpegDecoder {
	fn name(&self) -> &'static str {
		self.name
	}

	async fn submit(&mut self, unit: &AccessUnit, rotation: Rotation) -> Result<Decoded, DecodeError> {
		// ffmpeg would silently resync past it and lose the following unit too
		if !unit.raw_bytes.starts_with(&START_CODE) || unit.unit_code().is_none() {
			return Err(DecodeError::Rejected(format!("{} bytes without a start code and NAL header", unit.len())));
		}

		let mut process = match self.process.take() {
			Some(process) => process,
			None => self.launch()?,
		};

		self.submitted = rotation;
		if unit.starts_picture() {
			if self.in_flight.len() == MAX_IN_FLIGHT {
				debug!("{} lost track of a picture, dropping its rotation", self.name);
				self.in_flight.pop_front();
			}
			self.in_flight.push_back(rotation);
		}

		let mut received = vec![];
		let written = process.write(&unit.raw_bytes, &mut received).await;
		self.absorb(received, vec![]);

		if let Err(e) = written {
			// The unit is lost but the session keeps its decoder
			warn!("{} decoder process died ({}), restarting it", self.name, e);
			let (frames, errors) = process.ready();
			self.absorb(frames, errors);
			drop(process);
			self.in_flight.clear();
			self.process = match self.launch() {
				Ok(process) => Some(process),
				Err(e) => {
					error!("Could not restart {} decoder: {}", self.name, e);
					None
				}
			};
			return Err(DecodeError::Io(e));
		}

		self.process = Some(process);
		Ok(self.poll())
	}

	fn poll(&mut self) -> Decoded {
		if let Some((frames, errors)) = self.process.as_mut().map(Process::ready) {
			self.absorb(frames, errors);
		}
		mem::take(&mut self.ready)
	}

	async fn flush(&mut self) -> Result<Decoded, DecodeError> {
		let mut out = self.poll();
		if let Some(process) = self.process.take() {
			let (frames, errors) = process.finish(self.name).await;
			self.absorb(frames, errors);
			out.append(mem::take(&mut self.ready));
		}
		self.in_flight.clear();
		Ok(out)
	}
}

/// Splits ffmpeg's `image2pipe` bitmap output and forwards decoded frames
/// until the pipe closes or the receiver goes away.
async fn pump_bitmaps<R: AsyncRead + Unpin>(mut reader: R, frames: mpsc::Sender<RgbImage>) -> io::Result<()> {
	// "BM" magic followed by the little-endian file size
	let mut header = [0u8; 6];

	loop {
		match reader.read_exact(&mut header).await {
			Ok(_) => {}
			Err(e) if e.kind() == ErrorKind::UnexpectedEof => return Ok(()),
			Err(e) => return Err(e),
		}

		if &header[..2] != b"BM" {
			return Err(io::Error::new(ErrorKind::InvalidData, "decoder output is not a bitmap stream"));
		}

		let size = u32::from_le_bytes([header[2], header[3], header[4], header[5]]) as usize;
		if size <= header.len() || size > MAX_BITMAP {
			return Err(io::Error::new(ErrorKind::InvalidData, format!("implausible bitmap size {}", size)));
		}

		let mut bitmap = vec![0u8; size];
		bitmap[..header.len()].copy_from_slice(&header);
		reader.read_exact(&mut bitmap[header.len()..]).await?;

		match image::load_from_memory_with_format(&bitmap, ImageFormat::Bmp) {
			Ok(img) => {
				if frames.send(img.to_rgb8()).await.is_err() {
					return Ok(());
				}
			}
			Err(e) => warn!("Dropping undecodable bitmap: {}", e),
		}
	}
}

/// With `-loglevel error` every stderr line is a decode problem. Lines are
/// dropped when nobody keeps up, but stderr is always read to the end.
async fn pump_errors<R: AsyncBufRead + Unpin>(reader: R, errors: mpsc::Sender<String>) {
	let mut lines = reader.lines();
	while let Ok(Some(line)) = lines.next_line().await {
		let line = line.trim();
		if line.is_empty() {
			continue;
		}
		debug!("decoder: {}", line);
		let _ = errors.try_send(line.to_string());
	}
}
