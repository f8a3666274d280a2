use std::sync::{Arc, Mutex, MutexGuard};

use thiserror::Error;

use crate::model::session::AdmissionState;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum AdmissionError {
	#[error("Server busy - already handling a connection from {0}")]
	Busy(String),
	#[error("not accepting connections")]
	NotAccepting,
}

/// The one piece of state shared between the accepting side and a running
/// session. Only one producer is admitted at a time because the output
/// device is a single slot.
#[derive(Clone)]
pub struct Admission {
	state: Arc<Mutex<AdmissionState>>,
}

impl Admission {
	pub fn new() -> Self {
		Admission {
			state: Arc::new(Mutex::new(AdmissionState::Idle)),
		}
	}

	fn lock(&self) -> MutexGuard<'_, AdmissionState> {
		self.state.lock().unwrap_or_else(|e| e.into_inner())
	}

	pub fn state(&self) -> AdmissionState {
		self.lock().clone()
	}

	pub fn is_active(&self) -> bool {
		matches!(*self.lock(), AdmissionState::Active { .. })
	}

	pub fn start_accepting(&self) {
		let mut state = self.lock();
		if *state == AdmissionState::Idle {
			*state = AdmissionState::Accepting;
		}
	}

	/// Goes back to `Idle`. A live ticket will not resurrect `Accepting` when
	/// it is dropped afterwards.
	pub fn stop_accepting(&self) {
		*self.lock() = AdmissionState::Idle;
	}

	/// `Accepting -> Active`. Rejects rather than queues when a session is
	/// already running or still releasing its resources.
	pub fn try_admit(&self, peer: impl Into<String>) -> Result<SessionTicket, AdmissionError> {
		let peer = peer.into();
		let mut state = self.lock();
		let refused = match &*state {
			AdmissionState::Accepting => None,
			AdmissionState::Active { peer: current } | AdmissionState::Draining { peer: current } => {
				Some(AdmissionError::Busy(current.clone()))
			}
			AdmissionState::Idle => Some(AdmissionError::NotAccepting),
		};
		if let Some(err) = refused {
			return Err(err);
		}

		*state = AdmissionState::Active { peer: peer.clone() };
		Ok(SessionTicket {
			admission: self.clone(),
			peer,
		})
	}
}

/// Proof of admission held by the running session. Dropping it completes
/// `Draining -> Accepting`.
pub struct SessionTicket {
	admission: Admission,
	peer: String,
}

impl SessionTicket {
	pub fn peer(&self) -> &str {
		&self.peer
	}

	/// `Active -> Draining`
	pub fn drain(&self) {
		let mut state = self.admission.lock();
		let ours = matches!(&*state, AdmissionState::Active { peer } if *peer == self.peer);
		if ours {
			*state = AdmissionState::Draining { peer: self.peer.clone() };
		}
	}
}

impl Drop for SessionTicket {
	fn drop(&mut self) {
		let mut state = self.admission.lock();
		let ours = matches!(
			&*state,
			AdmissionState::Active { peer } | AdmissionState::Draining { peer } if *peer == self.peer
		);
		if ours {
			*state = AdmissionState::Accepting;
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn one_producer_at_a_time() {
		let admission = Admission::new();
		assert_eq!(admission.try_admit("a").err(), Some(AdmissionError::NotAccepting));

		admission.start_accepting();
		let ticket = admission.try_admit("a").unwrap();
		assert_eq!(admission.state(), AdmissionState::Active { peer: "a".to_string() });

		assert_eq!(admission.try_admit("b").err(), Some(AdmissionError::Busy("a".to_string())));
		// the rejected attempt leaves the running session alone
		assert_eq!(admission.state(), AdmissionState::Active { peer: "a".to_string() });

		ticket.drain();
		assert_eq!(admission.state(), AdmissionState::Draining { peer: "a".to_string() });
		assert!(admission.try_admit("b").is_err());

		drop(ticket);
		assert_eq!(admission.state(), AdmissionState::Accepting);
		assert!(admission.try_admit("b").is_ok());
	}

	#[test]
	fn stopping_wins_over_a_late_ticket() {
		let admission = Admission::new();
		admission.start_accepting();
		let ticket = admission.try_admit("a").unwrap();

		admission.stop_accepting();
		drop(ticket);
		assert_eq!(admission.state(), AdmissionState::Idle);
	}
}
