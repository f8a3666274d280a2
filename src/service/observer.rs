use serde::Serialize;
use tokio::sync::mpsc::Receiver;

use crate::implem::admission::Admission;
use crate::model::session::{MetricsReport, SessionEvent, SinkGeometry};
use crate::model::settings::StreamMode;
use crate::utils::{am, Am};

/// What the observer has learned from the event stream so far.
#[derive(Clone, Debug, Default)]
struct Board {
	peer: Option<String>,
	decoder: Option<&'static str>,
	camera_device: Option<String>,
	geometry: Option<SinkGeometry>,
	orientation: u16,
	sink_degraded: Option<String>,
	metrics: MetricsReport,
}

#[derive(Debug, Serialize)]
pub struct Status {
	pub mode: &'static str,
	pub state: &'static str,
	pub peers: usize,
	pub peer: Option<String>,
	pub decoder: Option<&'static str>,
	pub connection_active: bool,
	pub camera_active: bool,
	pub camera_device: Option<String>,
	pub geometry: Option<SinkGeometry>,
	pub orientation: u16,
	pub sink_degraded: Option<String>,
	pub bitrate_bps: f64,
	pub fps: f64,
	pub frames_decoded: u64,
	pub decode_errors: u64,
}

#[derive(Clone)]
pub struct StatusBoard {
	mode: StreamMode,
	admission: Admission,
	board: Am<Board>,
}

impl StatusBoard {
	pub fn new(mode: StreamMode, admission: Admission) -> Self {
		StatusBoard {
			mode,
			admission,
			board: am(Board::default()),
		}
	}

	pub async fn status(&self) -> Status {
		let board = self.board.lock().await.clone();
		let state = self.admission.state();
		let connection_active = self.admission.is_active();

		Status {
			mode: self.mode.name(),
			state: state.name(),
			peers: if board.peer.is_some() { 1 } else { 0 },
			peer: board.peer,
			decoder: board.decoder,
			connection_active,
			camera_active: board.geometry.is_some(),
			camera_device: board.camera_device,
			geometry: board.geometry,
			orientation: board.orientation,
			sink_degraded: board.sink_degraded,
			bitrate_bps: board.metrics.bitrate_bps,
			fps: board.metrics.fps,
			frames_decoded: board.metrics.frames_decoded,
			decode_errors: board.metrics.decode_errors,
		}
	}

	async fn apply(&self, event: SessionEvent) {
		let mut board = self.board.lock().await;
		match event {
			SessionEvent::Connected { peer, decoder } => {
				*board = Board::default();
				board.peer = Some(peer);
				board.decoder = Some(decoder);
			}
			SessionEvent::Disconnected { .. } => {
				board.peer = None;
				board.decoder = None;
				board.geometry = None;
				board.sink_degraded = None;
				board.metrics.bitrate_bps = 0.0;
				board.metrics.fps = 0.0;
			}
			SessionEvent::Orientation(rotation) => board.orientation = rotation.degrees(),
			SessionEvent::DecodeError { .. } => board.metrics.decode_errors += 1,
			SessionEvent::SinkOpened { geometry, device } => {
				board.geometry = Some(geometry);
				board.camera_device = Some(device);
			}
			SessionEvent::SinkClosed => board.geometry = None,
			SessionEvent::SinkDegraded(reason) => board.sink_degraded = Some(reason),
			SessionEvent::SinkRestored => board.sink_degraded = None,
			SessionEvent::Metrics(report) => board.metrics = report,
		}
	}
}

/// Logs every session event and folds it into `board`. Runs until all
/// senders are gone.
pub async fn observe_session_events(mut rx: Receiver<SessionEvent>, board: StatusBoard) {
	while let Some(event) = rx.recv().await {
		match &event {
			SessionEvent::Connected { peer, decoder } => info!("[observer] {} connected, decoding with {}", peer, decoder),
			SessionEvent::Disconnected { peer, reason } => info!("[observer] {} disconnected: {}", peer, reason),
			SessionEvent::SinkOpened { geometry, device } => info!("[observer] camera {} running at {}", device, geometry),
			SessionEvent::SinkDegraded(reason) => warn!("[observer] camera unavailable: {}", reason),
			SessionEvent::SinkRestored => info!("[observer] camera restored"),
			SessionEvent::Metrics(report) => info!(
				"[observer] {:.2} Mbps, {:.1} fps, {} frames, {} decode errors",
				report.bitrate_bps / 1_000_000.0,
				report.fps,
				report.frames_decoded,
				report.decode_errors,
			),
			other => debug!("[observer] {:?}", other),
		}
		board.apply(event).await;
	}
	debug!("[observer] event channel closed");
}
