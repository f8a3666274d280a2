use tokio::net::TcpListener;
use tokio::sync::watch;

use crate::implem::admission::Admission;
use crate::implem::session::{Pipeline, Session};
use crate::utils::stop_requested;

/// Serves raw H.264 producers one at a time. While a session runs the
/// listener is not polled, so another producer waits in the backlog until
/// the current one leaves.
pub async fn listen_for_new_video_sockets(listener: TcpListener, admission: Admission, pipeline: Pipeline, mut stop: watch::Receiver<bool>) {
	admission.start_accepting();

	loop {
		let accepted = tokio::select! {
			accepted = listener.accept() => accepted,
			_ = stop_requested(&mut stop) => break,
		};

		let (client, addr) = match accepted {
			Ok(accepted) => accepted,
			Err(e) => {
				warn!("[stream] accept failed: {}", e);
				continue;
			}
		};

		let ticket = match admission.try_admit(addr.to_string()) {
			Ok(ticket) => ticket,
			Err(e) => {
				warn!("[stream] refusing {}: {}", addr, e);
				continue;
			}
		};

		if let Err(e) = client.set_nodelay(true) {
			debug!("[stream] cannot set TCP_NODELAY for {}: {}", addr, e);
		}

		let mut session = Session::open(ticket, &pipeline).await;
		let reason = session.pump_stream(client, &mut stop, pipeline.config.read_timeout).await;
		session.close(reason).await;
	}

	admission.stop_accepting();
	info!("[stream] no longer accepting producers");
}
