use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::mpsc::{self, Receiver, Sender};

use crate::model::session::SessionEvent;

/// Best-effort event delivery. The data path never waits on the observer;
/// when it lags, events are dropped.
#[derive(Clone)]
pub struct EventSink {
	tx: Option<Sender<SessionEvent>>,
}

impl EventSink {
	pub fn channel(capacity: usize) -> (Self, Receiver<SessionEvent>) {
		let (tx, rx) = mpsc::channel(capacity);
		(EventSink { tx: Some(tx) }, rx)
	}

	/// Swallows everything
	#[cfg(test)]
	pub fn disconnected() -> Self {
		EventSink { tx: None }
	}

	pub fn emit(&self, event: SessionEvent) {
		let tx = match &self.tx {
			Some(tx) => tx,
			None => return,
		};

		match tx.try_send(event) {
			Ok(()) => {}
			Err(TrySendError::Full(event)) => debug!("Observer lagging, dropped {:?}", event),
			Err(TrySendError::Closed(_)) => {}
		}
	}
}
