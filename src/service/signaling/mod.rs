use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::mpsc::{self, Sender};
use tokio::sync::watch;

use crate::implem::admission::{Admission, AdmissionError};
use crate::implem::session::{Pipeline, Session};
use crate::model::session::PeerEvent;

#[cfg(feature = "webrtc")]
pub mod rtc;

/// Samples queued between the transport callbacks and the session task.
/// Beyond this the transport drops samples instead of buffering them.
pub const PEER_QUEUE: usize = 256;

#[derive(Debug, Error)]
pub enum SignalingError {
	#[error("{0}")]
	Busy(#[from] AdmissionError),
	#[error("bad offer: {0}")]
	BadOffer(String),
	#[error("negotiation failed: {0}")]
	Negotiation(String),
	#[error("built without WebRTC support")]
	Unsupported,
}

#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
pub struct OfferRequest {
	pub sdp: String,
	#[serde(rename = "type", default = "offer_kind")]
	pub kind: String,
}

fn offer_kind() -> String {
	"offer".to_string()
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct AnswerResponse {
	pub sdp: String,
	#[serde(rename = "type")]
	pub kind: String,
}

/// A negotiated peer connection. Kept alive by the session task until the
/// session ends.
#[async_trait]
pub trait PeerHandle: Send {
	async fn close(self: Box<Self>);
}

/// Turns an SDP offer into an answer and a live connection whose callbacks
/// only push `PeerEvent`s onto `events`.
#[async_trait]
pub trait PeerConnector: Send + Sync {
	async fn answer(&self, offer: OfferRequest, events: Sender<PeerEvent>) -> Result<(AnswerResponse, Box<dyn PeerHandle>), SignalingError>;
}

/// Stand-in when no WebRTC stack is compiled in
pub struct UnsupportedConnector;

#[async_trait]
impl PeerConnector for UnsupportedConnector {
	async fn answer(&self, _offer: OfferRequest, _events: Sender<PeerEvent>) -> Result<(AnswerResponse, Box<dyn PeerHandle>), SignalingError> {
		Err(SignalingError::Unsupported)
	}
}

#[cfg(feature = "webrtc")]
pub fn default_connector(stun: Option<String>) -> Result<Arc<dyn PeerConnector>, SignalingError> {
	let connector = rtc::WebRtcConnector::new(stun).map_err(|e| SignalingError::Negotiation(e.to_string()))?;
	Ok(Arc::new(connector))
}

#[cfg(not(feature = "webrtc"))]
pub fn default_connector(stun: Option<String>) -> Result<Arc<dyn PeerConnector>, SignalingError> {
	if stun.is_some() {
		warn!("--stun has no effect without WebRTC support");
	}
	Ok(Arc::new(UnsupportedConnector))
}

/// Offer/answer front door for signaling mode.
#[derive(Clone)]
pub struct Signaling {
	admission: Admission,
	pipeline: Pipeline,
	connector: Arc<dyn PeerConnector>,
	stop: watch::Receiver<bool>,
}

impl Signaling {
	pub fn new(admission: Admission, pipeline: Pipeline, connector: Arc<dyn PeerConnector>, stop: watch::Receiver<bool>) -> Self {
		admission.start_accepting();
		Signaling { admission, pipeline, connector, stop }
	}

	/// Admits the offering peer and starts its session. A busy receiver
	/// answers with an error and leaves the running session untouched.
	pub async fn offer(&self, from: SocketAddr, offer: OfferRequest) -> Result<AnswerResponse, SignalingError> {
		if offer.kind != "offer" {
			return Err(SignalingError::BadOffer(format!("expected type \"offer\", got \"{}\"", offer.kind)));
		}
		if offer.sdp.trim().is_empty() {
			return Err(SignalingError::BadOffer("empty sdp".to_string()));
		}

		let ticket = self.admission.try_admit(format!("webrtc {}", from))?;
		let (tx, mut rx) = mpsc::channel(PEER_QUEUE);

		// a failed negotiation drops the ticket and reopens admission
		let (answer, peer) = self.connector.answer(offer, tx).await?;
		info!("[signaling] answered offer from {}", from);

		let pipeline = self.pipeline.clone();
		let mut stop = self.stop.clone();
		tokio::spawn(async move {
			let mut session = Session::open(ticket, &pipeline).await;
			let reason = session.pump_peer(&mut rx, &mut stop, pipeline.config.read_timeout).await;
			peer.close().await;
			session.close(reason).await;
		});

		Ok(answer)
	}
}

#[cfg(test)]
mod tests {
	use std::time::Duration;

	use bytes::Bytes;
	use tokio::time::sleep;

	use super::*;
	use crate::implem::events::EventSink;
	use crate::implem::session::SessionConfig;
	use crate::implem::sink::tests::{Call, RecordingOutput};
	use crate::implem::decode::tests::PassthroughFactory;
	use crate::model::session::{AdmissionState, PeerState};
	use crate::utils::snapshot_slot;

	/// Answers every offer and hands the event sender to the test
	struct ScriptedConnector {
		senders: std::sync::Mutex<Vec<Sender<PeerEvent>>>,
	}

	struct ScriptedPeer;

	#[async_trait]
	impl PeerHandle for ScriptedPeer {
		async fn close(self: Box<Self>) {}
	}

	#[async_trait]
	impl PeerConnector for ScriptedConnector {
		async fn answer(&self, offer: OfferRequest, events: Sender<PeerEvent>) -> Result<(AnswerResponse, Box<dyn PeerHandle>), SignalingError> {
			self.senders.lock().unwrap().push(events);
			Ok((AnswerResponse { sdp: format!("answer to {}", offer.sdp), kind: "answer".to_string() }, Box::new(ScriptedPeer)))
		}
	}

	fn offer() -> OfferRequest {
		OfferRequest { sdp: "v=0".to_string(), kind: "offer".to_string() }
	}

	fn signaling(connector: Arc<dyn PeerConnector>, output: &RecordingOutput) -> (Signaling, Admission, watch::Sender<bool>) {
		let admission = Admission::new();
		let (stop_tx, stop) = watch::channel(false);
		let pipeline = Pipeline {
			config: SessionConfig { read_timeout: Duration::from_millis(10), ..SessionConfig::default() },
			decoders: Arc::new(PassthroughFactory),
			output: Arc::new(RecordingOutput { calls: output.calls.clone(), failing: output.failing.clone() }),
			events: EventSink::disconnected(),
			snapshot: snapshot_slot(),
		};
		(Signaling::new(admission.clone(), pipeline, connector, stop), admission, stop_tx)
	}

	async fn wait_for(admission: &Admission, state: AdmissionState) {
		for _ in 0..200 {
			if admission.state() == state {
				return;
			}
			sleep(Duration::from_millis(5)).await;
		}
		panic!("admission never reached {:?}", state);
	}

	#[tokio::test]
	async fn second_offer_is_refused_while_active() {
		let connector = Arc::new(ScriptedConnector { senders: Default::default() });
		let output = RecordingOutput::default();
		let (signaling, admission, _stop) = signaling(connector.clone(), &output);
		let from: SocketAddr = "10.0.0.2:50000".parse().unwrap();

		let answer = signaling.offer(from, offer()).await.unwrap();
		assert_eq!(answer.kind, "answer");
		assert_eq!(answer.sdp, "answer to v=0");

		let refused = signaling.offer("10.0.0.3:50000".parse().unwrap(), offer()).await;
		assert!(matches!(refused, Err(SignalingError::Busy(AdmissionError::Busy(_)))));
		assert_eq!(connector.senders.lock().unwrap().len(), 1);

		let events = connector.senders.lock().unwrap().remove(0);
		events.send(PeerEvent::State(PeerState::Connected)).await.unwrap();
		events.send(PeerEvent::Sample(Bytes::from_static(&[0, 0, 0, 1, 0x65, 4, 2]))).await.unwrap();
		events.send(PeerEvent::State(PeerState::Disconnected)).await.unwrap();
		events.send(PeerEvent::State(PeerState::Failed)).await.unwrap();

		wait_for(&admission, AdmissionState::Accepting).await;
		assert_eq!(*output.calls.lock().unwrap(), vec![Call::Open(4, 2), Call::Send(4, 2), Call::Close]);
		assert!(signaling.offer(from, offer()).await.is_ok());
	}

	#[tokio::test]
	async fn unsupported_transport_keeps_accepting() {
		let output = RecordingOutput::default();
		let (signaling, admission, _stop) = signaling(Arc::new(UnsupportedConnector), &output);

		let result = signaling.offer("10.0.0.2:50000".parse().unwrap(), offer()).await;
		assert!(matches!(result, Err(SignalingError::Unsupported)));
		assert_eq!(admission.state(), AdmissionState::Accepting);
	}

	#[tokio::test]
	async fn malformed_offers_are_rejected_before_admission() {
		let output = RecordingOutput::default();
		let (signaling, admission, _stop) = signaling(Arc::new(UnsupportedConnector), &output);
		let from: SocketAddr = "10.0.0.2:50000".parse().unwrap();

		let answer = OfferRequest { sdp: "v=0".to_string(), kind: "answer".to_string() };
		assert!(matches!(signaling.offer(from, answer).await, Err(SignalingError::BadOffer(_))));
		let empty = OfferRequest { sdp: " ".to_string(), kind: "offer".to_string() };
		assert!(matches!(signaling.offer(from, empty).await, Err(SignalingError::BadOffer(_))));
		assert_eq!(admission.state(), AdmissionState::Accepting);
	}

	#[test]
	fn offer_type_defaults() {
		let offer: OfferRequest = serde_json::from_str(r#"{"sdp":"v=0"}"#).unwrap();
		assert_eq!(offer.kind, "offer");
		let answer = serde_json::to_value(AnswerResponse { sdp: "v=0".to_string(), kind: "answer".to_string() }).unwrap();
		assert_eq!(answer, serde_json::json!({"sdp": "v=0", "type": "answer"}));
	}
}
