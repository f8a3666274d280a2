use std::convert::Infallible;
use std::io::Cursor;
use std::net::SocketAddr;
use std::time::Duration;

use bytes::Bytes;
use hyper::body::Sender;
use hyper::{Body, Method, Request, Response, StatusCode};
use hyper::header::HeaderName;
use hyper::http::HeaderValue;
use hyper::server::Builder;
use hyper::server::conn::{AddrIncoming, AddrStream};
use hyper::service::{make_service_fn, service_fn};
use image::codecs::jpeg::JpegEncoder;
use image::ImageResult;
use serde::Serialize;
use tokio::sync::watch;
use tokio::time::{interval, MissedTickBehavior};

use crate::implem::admission::AdmissionError;
use crate::service::observer::StatusBoard;
use crate::service::signaling::{OfferRequest, Signaling, SignalingError};
use crate::utils::{stop_requested, SnapshotSlot};

const JPEG_QUALITY: u8 = 85;
const STREAM_QUALITY: u8 = 80;
const STREAM_INTERVAL: Duration = Duration::from_micros(1_000_000 / 30);
const BOUNDARY: &str = "frame";
const BUSY: &str = "Server busy - already handling a connection";

const VIEWER: &str = r#"<!DOCTYPE html>
<html>
<head>
	<title>PhoneCam Live Stream</title>
	<style>
		body { margin: 0; background: #000; display: flex; justify-content: center; align-items: center; height: 100vh; }
		img { max-width: 100vw; max-height: 100vh; }
	</style>
</head>
<body>
	<img src="/video" alt="PhoneCam Live Stream">
</body>
</html>
"#;

#[derive(Clone)]
pub struct HyperCtx {
	pub board: StatusBoard,
	pub snapshot: SnapshotSlot,
	/// Present in signaling mode only
	pub signaling: Option<Signaling>,
	/// Ends `/video` streams so graceful shutdown isn't held up by viewers
	pub stop: watch::Receiver<bool>,
}

pub async fn listen_for_http_requests(server: Builder<AddrIncoming>, ctx: HyperCtx, mut stop: watch::Receiver<bool>) {
	let make_service = make_service_fn(move |conn: &AddrStream| {
		let ctx = ctx.clone();
		let addr = conn.remote_addr();

		async move {
			Ok::<_, Infallible>(service_fn(move |req| {
				handle(ctx.clone(), addr, req)
			}))
		}
	});

	let result = server
		.serve(make_service)
		.with_graceful_shutdown(async move { stop_requested(&mut stop).await })
		.await;

	if let Err(e) = result {
		error!("[http] server failed: {}", e);
	}
}

async fn handle(ctx: HyperCtx, addr: SocketAddr, req: Request<Body>) -> Result<Response<Body>, Infallible> {
	let response = match (req.method(), req.uri().path()) {
		(&Method::GET, "/status") => json(StatusCode::OK, &ctx.board.status().await),
		(&Method::GET, "/snapshot") => snapshot(&ctx.snapshot),
		(&Method::GET, "/video") => video(&ctx, addr),
		(&Method::GET, "/") => viewer(),
		(&Method::POST, "/offer") => offer(&ctx, addr, req).await,
		(_, "/status") | (_, "/snapshot") | (_, "/video") | (_, "/") | (_, "/offer") => empty(StatusCode::METHOD_NOT_ALLOWED),
		_ => empty(StatusCode::NOT_FOUND),
	};
	Ok(response)
}

/// JPEG of the last frame shown, if there is one
fn encode_latest(slot: &SnapshotSlot, quality: u8) -> ImageResult<Option<Vec<u8>>> {
	// encode outside the lock so the sink is never held up by a slow client
	let frame = match slot.lock() {
		Ok(frame) => frame.clone(),
		Err(poisoned) => poisoned.into_inner().clone(),
	};
	let frame = match frame {
		Some(frame) => frame,
		None => return Ok(None),
	};

	let mut jpeg = Cursor::new(Vec::new());
	JpegEncoder::new_with_quality(&mut jpeg, quality).encode_image(&frame)?;
	Ok(Some(jpeg.into_inner()))
}

fn snapshot(slot: &SnapshotSlot) -> Response<Body> {
	let jpeg = match encode_latest(slot, JPEG_QUALITY) {
		Ok(Some(jpeg)) => jpeg,
		Ok(None) => return empty(StatusCode::NOT_FOUND),
		Err(e) => {
			warn!("[http] snapshot encoding failed: {}", e);
			return empty(StatusCode::INTERNAL_SERVER_ERROR);
		}
	};

	Response::builder()
		.status(StatusCode::OK)
		.header(HeaderName::from_static("content-type"), HeaderValue::from_static("image/jpeg"))
		.body(Body::from(jpeg))
		.unwrap_or_else(|_| empty(StatusCode::INTERNAL_SERVER_ERROR))
}

/// Motion JPEG of whatever the virtual camera is showing, for browsers
fn video(ctx: &HyperCtx, addr: SocketAddr) -> Response<Body> {
	let (sender, body) = Body::channel();
	info!("[http] {} is watching /video", addr);
	tokio::spawn(stream_frames(ctx.snapshot.clone(), sender, ctx.stop.clone(), addr));

	Response::builder()
		.status(StatusCode::OK)
		.header(HeaderName::from_static("content-type"), format!("multipart/x-mixed-replace; boundary={}", BOUNDARY))
		.header(HeaderName::from_static("cache-control"), HeaderValue::from_static("no-cache"))
		.body(body)
		.unwrap_or_else(|_| empty(StatusCode::INTERNAL_SERVER_ERROR))
}

async fn stream_frames(slot: SnapshotSlot, mut sender: Sender, mut stop: watch::Receiver<bool>, addr: SocketAddr) {
	let mut ticks = interval(STREAM_INTERVAL);
	ticks.set_missed_tick_behavior(MissedTickBehavior::Skip);

	loop {
		tokio::select! {
			_ = ticks.tick() => {}
			_ = stop_requested(&mut stop) => return,
		}

		let jpeg = match encode_latest(&slot, STREAM_QUALITY) {
			Ok(Some(jpeg)) => jpeg,
			Ok(None) => continue,
			Err(e) => {
				warn!("[http] /video encoding failed: {}", e);
				return;
			}
		};

		let mut part = format!("--{}\r\nContent-Type: image/jpeg\r\nContent-Length: {}\r\n\r\n", BOUNDARY, jpeg.len()).into_bytes();
		part.extend(jpeg);
		part.extend(b"\r\n");

		let sent = tokio::select! {
			sent = sender.send_data(Bytes::from(part)) => sent,
			_ = stop_requested(&mut stop) => return,
		};
		if sent.is_err() {
			info!("[http] {} stopped watching /video", addr);
			return;
		}
	}
}

fn viewer() -> Response<Body> {
	Response::builder()
		.status(StatusCode::OK)
		.header(HeaderName::from_static("content-type"), HeaderValue::from_static("text/html; charset=utf-8"))
		.body(Body::from(VIEWER))
		.unwrap_or_else(|_| empty(StatusCode::INTERNAL_SERVER_ERROR))
}

async fn offer(ctx: &HyperCtx, addr: SocketAddr, req: Request<Body>) -> Response<Body> {
	let signaling = match &ctx.signaling {
		Some(signaling) => signaling,
		None => return error(StatusCode::NOT_FOUND, "not in signaling mode"),
	};

	let body = match hyper::body::to_bytes(req.into_body()).await {
		Ok(body) => body,
		Err(e) => return error(StatusCode::BAD_REQUEST, &e.to_string()),
	};
	let offer: OfferRequest = match serde_json::from_slice(&body) {
		Ok(offer) => offer,
		Err(e) => return error(StatusCode::BAD_REQUEST, &format!("invalid offer: {}", e)),
	};

	match signaling.offer(addr, offer).await {
		Ok(answer) => json(StatusCode::OK, &answer),
		Err(SignalingError::Busy(AdmissionError::Busy(current))) => {
			info!("[http] refused offer from {} while serving {}", addr, current);
			error(StatusCode::SERVICE_UNAVAILABLE, BUSY)
		}
		Err(e @ SignalingError::Busy(_)) => error(StatusCode::SERVICE_UNAVAILABLE, &e.to_string()),
		Err(e @ SignalingError::BadOffer(_)) => error(StatusCode::BAD_REQUEST, &e.to_string()),
		Err(e @ SignalingError::Unsupported) => error(StatusCode::NOT_IMPLEMENTED, &e.to_string()),
		Err(e @ SignalingError::Negotiation(_)) => {
			warn!("[http] offer from {} failed: {}", addr, e);
			error(StatusCode::INTERNAL_SERVER_ERROR, &e.to_string())
		}
	}
}

#[derive(Serialize)]
struct ErrorBody<'a> {
	error: &'a str,
}

fn error(status: StatusCode, message: &str) -> Response<Body> {
	json(status, &ErrorBody { error: message })
}

fn json<T: Serialize>(status: StatusCode, value: &T) -> Response<Body> {
	let body = match serde_json::to_vec(value) {
		Ok(body) => body,
		Err(e) => {
			error!("[http] cannot serialise response: {}", e);
			return empty(StatusCode::INTERNAL_SERVER_ERROR);
		}
	};

	Response::builder()
		.status(status)
		.header(HeaderName::from_static("content-type"), HeaderValue::from_static("application/json"))
		.body(Body::from(body))
		.unwrap_or_else(|_| empty(StatusCode::INTERNAL_SERVER_ERROR))
}

fn empty(status: StatusCode) -> Response<Body> {
	let mut response = Response::new(Body::empty());
	*response.status_mut() = status;
	response
}
