#[macro_use]
extern crate argh;
extern crate env_logger;
extern crate hyper;
#[macro_use]
extern crate log;
extern crate tokio;

use std::process::exit;
use std::sync::Arc;
use std::time::Duration;

use env_logger::Env;
use tokio::sync::watch;
use tokio::time::sleep;

use crate::implem::admission::Admission;
use crate::implem::decode::FfmpegDecoderFactory;
use crate::implem::events::EventSink;
use crate::implem::session::Pipeline;
use crate::implem::sink::ffmpeg::V4l2LoopbackOutput;
use crate::implem::sink::{CameraOutput, NullOutput};
use crate::model::cli::CliArgs;
use crate::model::session::AdmissionState;
use crate::model::settings::{OutputTarget, StreamMode};
use crate::service::http::{listen_for_http_requests, HyperCtx};
use crate::service::observer::{observe_session_events, StatusBoard};
use crate::service::signaling::{default_connector, Signaling};
use crate::service::stream::listen_for_new_video_sockets;
use crate::utils::{snapshot_slot, stop_requested};

mod implem;
mod model;
mod service;
mod utils;

/// Events buffered for the observer before they start being dropped
const EVENT_QUEUE: usize = 256;

#[tokio::main]
async fn main() {
	let args = argh::from_env::<CliArgs>();

	env_logger::Builder::from_env(Env::default().default_filter_or("info")).init();

	let (stop_tx, stop) = watch::channel(false);
	tokio::spawn(async move {
		if tokio::signal::ctrl_c().await.is_ok() {
			info!("Shutting down");
		}
		let _ = stop_tx.send(true);
	});

	let output: Arc<dyn CameraOutput> = match &args.output {
		OutputTarget::Null => Arc::new(NullOutput),
		OutputTarget::Device(device) => Arc::new(V4l2LoopbackOutput::new(args.ffmpeg.clone(), device.clone())),
	};
	let (events, rx) = EventSink::channel(EVENT_QUEUE);
	let snapshot = snapshot_slot();
	let pipeline = Pipeline {
		config: args.session_config(),
		decoders: Arc::new(FfmpegDecoderFactory::new(args.decoder, args.ffmpeg.clone())),
		output,
		events,
		snapshot: snapshot.clone(),
	};

	let admission = Admission::new();
	let board = StatusBoard::new(args.mode, admission.clone());
	tokio::spawn(observe_session_events(rx, board.clone()));

	let signaling = match args.mode {
		StreamMode::Stream => None,
		StreamMode::Signaling => match default_connector(args.stun.clone()) {
			Ok(connector) => Some(Signaling::new(admission.clone(), pipeline.clone(), connector, stop.clone())),
			Err(e) => {
				error!("Cannot set up signaling: {}", e);
				exit(1);
			}
		},
	};

	let server = match args.start_listening_for_http() {
		Ok(server) => server,
		Err(e) => {
			error!("Cannot bind http server to {}: {}", args.http_host, e);
			exit(1);
		}
	};
	info!("Serving /, /video, /status, /snapshot and /offer on {}", args.http_host);
	let ctx = HyperCtx { board, snapshot, signaling, stop: stop.clone() };
	let http = tokio::spawn(listen_for_http_requests(server, ctx, stop.clone()));

	info!(
		"Running in {} mode, output {} at {} fps",
		args.mode.name(),
		args.output.describe(),
		args.fps,
	);

	match args.mode {
		StreamMode::Stream => {
			let listener = match args.start_listening_for_video().await {
				Ok(listener) => listener,
				Err(e) => {
					error!("Cannot bind video listener to {}: {}", args.video_host, e);
					exit(1);
				}
			};
			info!("Waiting for an H.264 producer on {}", args.video_host);
			listen_for_new_video_sockets(listener, admission, pipeline, stop).await;
		}
		StreamMode::Signaling => {
			// sessions are started from /offer; wait here for the stop signal
			let mut stop = stop;
			stop_requested(&mut stop).await;
			wait_for_session_teardown(&admission).await;
			admission.stop_accepting();
		}
	}

	let _ = http.await;
}

/// A running peer session sees the stop signal on its own; give it a moment
/// to release the decoder and the camera before the process exits.
async fn wait_for_session_teardown(admission: &Admission) {
	for _ in 0..40 {
		match admission.state() {
			AdmissionState::Active { .. } | AdmissionState::Draining { .. } => sleep(Duration::from_millis(50)).await,
			_ => return,
		}
	}
	warn!("Session still running at exit");
}
