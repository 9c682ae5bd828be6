//! Graceful drain: shutdown cancels every connection, stops every listener,
//! and drains outstanding tasks within a bounded deadline before forcing
//! exit.
//!
//! A `DrainTrigger` starts a drain and waits for every outstanding
//! `DrainWatcher` to be dropped. Components that want to block shutdown
//! while they finish in-flight work hold a clone of the watcher; dropping it
//! (or letting it go out of scope) signals completion.

use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tracing::{info, warn};

pub fn new() -> (DrainTrigger, DrainWatcher) {
	let (signal_tx, signal_rx) = watch::channel(false);
	let (drained_tx, drained_rx) = mpsc::channel::<std::convert::Infallible>(1);
	(
		DrainTrigger {
			signal_tx,
			drained_rx,
		},
		DrainWatcher {
			signal_rx,
			_drained_tx: drained_tx,
		},
	)
}

pub struct DrainTrigger {
	signal_tx: watch::Sender<bool>,
	drained_rx: mpsc::Receiver<std::convert::Infallible>,
}

impl DrainTrigger {
	/// Signals all watchers to start draining and waits (up to `deadline`)
	/// for all of them to be dropped. Returns `true` if every watcher
	/// finished before the deadline elapsed.
	pub async fn drain(mut self, component: &str, deadline: Duration) -> bool {
		let _ = self.signal_tx.send(true);
		match tokio::time::timeout(deadline, self.drained_rx.recv()).await {
			Ok(_) => {
				info!(component, "drain complete");
				true
			},
			Err(_) => {
				warn!(component, ?deadline, "drain deadline exceeded, forcing shutdown");
				false
			},
		}
	}
}

#[derive(Clone)]
pub struct DrainWatcher {
	signal_rx: watch::Receiver<bool>,
	_drained_tx: mpsc::Sender<std::convert::Infallible>,
}

impl DrainWatcher {
	/// Resolves once the trigger has signaled a drain has started.
	pub async fn signaled(&mut self) {
		let _ = self.signal_rx.wait_for(|v| *v).await;
	}

	pub fn is_draining(&self) -> bool {
		*self.signal_rx.borrow()
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[tokio::test]
	async fn completes_once_all_watchers_drop() {
		let (trigger, watcher) = new();
		let watcher2 = watcher.clone();
		drop(watcher);

		let handle = tokio::spawn(async move {
			let _held = watcher2;
			tokio::time::sleep(Duration::from_millis(20)).await;
		});

		let ok = trigger.drain("test", Duration::from_secs(1)).await;
		handle.await.unwrap();
		assert!(ok);
	}

	#[tokio::test]
	async fn reports_deadline_exceeded() {
		let (trigger, watcher) = new();
		// leak the watcher so drain never completes
		std::mem::forget(watcher);
		let ok = trigger.drain("test", Duration::from_millis(10)).await;
		assert!(!ok);
	}
}
