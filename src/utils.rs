use std::sync::Arc;

use image::RgbImage;
use tokio::sync::{watch, Mutex};

pub type Am<T> = Arc<Mutex<T>>;

/// Last frame handed to the output device, for `/snapshot`
pub type SnapshotSlot = Arc<std::sync::Mutex<Option<RgbImage>>>;

pub fn am<T>(t: T) -> Am<T> {
	Arc::new(Mutex::new(t))
}

pub fn snapshot_slot() -> SnapshotSlot {
	Arc::new(std::sync::Mutex::new(None))
}

/// Resolves once the process-wide stop flag is raised, or its sender is gone
pub async fn stop_requested(stop: &mut watch::Receiver<bool>) {
	while !*stop.borrow() {
		if stop.changed().await.is_err() {
			return;
		}
	}
}
