use sd_notify::NotifyState;
use std::sync::Arc;
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::Notify;
use tracing::{error, info};

/// Installs the signal handlers. The notifier fires once when the process is asked to stop.
pub fn run(notifier: Arc<Notify>) {
    tokio::spawn(handle_signals(notifier));
}

/// Tells the service manager that startup finished. A no-op outside systemd.
pub fn ready() {
    if let Err(e) = sd_notify::notify(false, &[NotifyState::Ready]) {
        error!("notify ready: {}", e);
    }
}

async fn handle_signals(notifier: Arc<Notify>) {
    let (mut interrupt, mut terminate, mut quit) = match (
        signal(SignalKind::interrupt()),
        signal(SignalKind::terminate()),
        signal(SignalKind::quit()),
    ) {
        (Ok(interrupt), Ok(terminate), Ok(quit)) => (interrupt, terminate, quit),
        _ => {
            error!("unable to install signal handlers");
            return;
        }
    };

    tokio::select! {
        _ = interrupt.recv() => {
            info!("received interrupt signal");
        },
        _ = terminate.recv() => {
            info!("received terminate signal");
        },
        _ = quit.recv() => {
            info!("received quit signal");
        },
    }

    let _ = sd_notify::notify(true, &[NotifyState::Stopping]);
    notifier.notify_waiters();
}
