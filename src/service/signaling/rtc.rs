use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::mpsc::Sender;
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::{MediaEngine, MIME_TYPE_H264};
use webrtc::api::{APIBuilder, API};
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::media::io::sample_builder::SampleBuilder;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp::codecs::h264::H264Packet;
use webrtc::rtp_transceiver::rtp_codec::RTPCodecType;
use webrtc::rtp_transceiver::rtp_receiver::RTCRtpReceiver;
use webrtc::track::track_remote::TrackRemote;

use crate::model::session::{PeerEvent, PeerState};
use crate::service::signaling::{AnswerResponse, OfferRequest, PeerConnector, PeerHandle, SignalingError};

/// Packets held back while waiting for a late RTP packet of a frame
const MAX_LATE: u16 = 128;
const VIDEO_CLOCK: u32 = 90_000;

pub struct WebRtcConnector {
	api: API,
	config: RTCConfiguration,
}

impl WebRtcConnector {
	pub fn new(stun: Option<String>) -> Result<Self, webrtc::Error> {
		let mut media = MediaEngine::default();
		media.register_default_codecs()?;
		let registry = register_default_interceptors(Registry::new(), &mut media)?;

		let api = APIBuilder::new()
			.with_media_engine(media)
			.with_interceptor_registry(registry)
			.build();
		let config = RTCConfiguration {
			ice_servers: stun
				.into_iter()
				.map(|url| RTCIceServer { urls: vec![url], ..Default::default() })
				.collect(),
			..Default::default()
		};

		Ok(WebRtcConnector { api, config })
	}
}

fn peer_state(state: RTCPeerConnectionState) -> PeerState {
	match state {
		RTCPeerConnectionState::Unspecified | RTCPeerConnectionState::New => PeerState::New,
		RTCPeerConnectionState::Connecting => PeerState::Connecting,
		RTCPeerConnectionState::Connected => PeerState::Connected,
		RTCPeerConnectionState::Disconnected => PeerState::Disconnected,
		RTCPeerConnectionState::Failed => PeerState::Failed,
		RTCPeerConnectionState::Closed => PeerState::Closed,
	}
}

fn negotiation(e: webrtc::Error) -> SignalingError {
	SignalingError::Negotiation(e.to_string())
}

#[async_trait]
impl PeerConnector for WebRtcConnector {
	async fn answer(&self, offer: OfferRequest, events: Sender<PeerEvent>) -> Result<(AnswerResponse, Box<dyn PeerHandle>), SignalingError> {
		let remote = RTCSessionDescription::offer(offer.sdp).map_err(|e| SignalingError::BadOffer(e.to_string()))?;
		let pc = Arc::new(self.api.new_peer_connection(self.config.clone()).await.map_err(negotiation)?);

		let state_tx = events.clone();
		pc.on_peer_connection_state_change(Box::new(move |state: RTCPeerConnectionState| {
			let tx = state_tx.clone();
			Box::pin(async move {
				// state changes are rare and must not be lost
				let _ = tx.send(PeerEvent::State(peer_state(state))).await;
			})
		}));

		pc.on_track(Box::new(move |track: Option<Arc<TrackRemote>>, _receiver: Option<Arc<RTCRtpReceiver>>| {
			let tx = events.clone();
			Box::pin(async move {
				if let Some(track) = track {
					tokio::spawn(read_track(track, tx));
				}
			})
		}));

		let answered = async {
			pc.set_remote_description(remote).await?;
			let answer = pc.create_answer(None).await?;
			let mut gathered = pc.gathering_complete_promise().await;
			pc.set_local_description(answer).await?;
			let _ = gathered.recv().await;
			Ok::<_, webrtc::Error>(pc.local_description().await)
		}
		.await;

		let local = match answered {
			Ok(Some(local)) => local,
			Ok(None) => {
				let _ = pc.close().await;
				return Err(SignalingError::Negotiation("no local description".to_string()));
			}
			Err(e) => {
				let _ = pc.close().await;
				return Err(negotiation(e));
			}
		};

		Ok((
			AnswerResponse { sdp: local.sdp, kind: "answer".to_string() },
			Box::new(WebRtcPeer { pc }),
		))
	}
}

struct WebRtcPeer {
	pc: Arc<RTCPeerConnection>,
}

#[async_trait]
impl PeerHandle for WebRtcPeer {
	async fn close(self: Box<Self>) {
		if let Err(e) = self.pc.close().await {
			debug!("[signaling] closing peer connection: {}", e);
		}
	}
}

/// Depacketises an H.264 track into Annex-B access units. Other tracks are
/// read and discarded so their buffers do not fill up.
async fn read_track(track: Arc<TrackRemote>, tx: Sender<PeerEvent>) {
	let mime = track.codec().await.capability.mime_type;
	if track.kind() != RTPCodecType::Video || !mime.eq_ignore_ascii_case(MIME_TYPE_H264) {
		debug!("[signaling] discarding {} track", mime);
		while track.read_rtp().await.is_ok() {}
		return;
	}

	info!("[signaling] receiving {} track", mime);
	let mut builder = SampleBuilder::new(MAX_LATE, H264Packet::default(), VIDEO_CLOCK);
	let mut dropped = 0u64;
	while let Ok((packet, _)) = track.read_rtp().await {
		builder.push(packet);
		while let Some(sample) = builder.pop() {
			match tx.try_send(PeerEvent::Sample(sample.data)) {
				Ok(()) => {}
				Err(TrySendError::Full(_)) => {
					dropped += 1;
					if dropped % 100 == 1 {
						warn!("[signaling] session lagging, {} samples dropped", dropped);
					}
				}
				Err(TrySendError::Closed(_)) => return,
			}
		}
	}

	let _ = tx.send(PeerEvent::TrackEnded).await;
}
