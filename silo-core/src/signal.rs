//! Shutdown signal handling (SIGINT/SIGTERM on Unix, Ctrl+C elsewhere).

use tokio::sync::mpsc;

pub struct Shutdown {
	tx: mpsc::Sender<()>,
	rx: mpsc::Receiver<()>,
}

impl Shutdown {
	pub fn new() -> Self {
		let (tx, rx) = mpsc::channel(1);
		Shutdown { tx, rx }
	}

	pub fn trigger(&self) -> ShutdownTrigger {
		ShutdownTrigger {
			tx: self.tx.clone(),
		}
	}

	/// Resolves once an OS signal arrives or an explicit trigger fires.
	pub async fn wait(mut self) {
		imp::wait_for_signal(&mut self.rx).await
	}
}

impl Default for Shutdown {
	fn default() -> Self {
		Self::new()
	}
}

#[derive(Clone)]
pub struct ShutdownTrigger {
	tx: mpsc::Sender<()>,
}

impl ShutdownTrigger {
	pub async fn shutdown_now(&self) {
		let _ = self.tx.send(()).await;
	}
}

#[cfg(unix)]
mod imp {
	use tokio::signal::unix::{signal, SignalKind};
	use tokio::sync::mpsc::Receiver;
	use tracing::info;

	pub(super) async fn wait_for_signal(receiver: &mut Receiver<()>) {
		tokio::select! {
			_ = watch(SignalKind::interrupt(), "SIGINT") => {},
			_ = watch(SignalKind::terminate(), "SIGTERM") => {},
			_ = receiver.recv() => { info!("received explicit shutdown signal") },
		}
	}

	async fn watch(kind: SignalKind, name: &'static str) {
		signal(kind)
			.expect("failed to register signal handler")
			.recv()
			.await;
		info!(signal = name, "received signal, starting shutdown");
	}
}

#[cfg(not(unix))]
mod imp {
	use tokio::sync::mpsc::Receiver;
	use tracing::info;

	pub(super) async fn wait_for_signal(receiver: &mut Receiver<()>) {
		tokio::select! {
			_ = tokio::signal::ctrl_c() => {},
			_ = receiver.recv() => { info!("received explicit shutdown signal") },
		}
	}
}
