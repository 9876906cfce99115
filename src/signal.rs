/// Wait for a signal that requests a graceful shutdown.
#[cfg(unix)]
async fn wait_for_signal_impl() -> &'static str {
    use tokio::signal::unix::{signal, SignalKind};

    let mut signal_terminate = signal(SignalKind::terminate()).unwrap();
    let mut signal_interrupt = signal(SignalKind::interrupt()).unwrap();

    tokio::select! {
        _ = signal_terminate.recv() => "SIGTERM",
        _ = signal_interrupt.recv() => "SIGINT",
    }
}

#[cfg(not(unix))]
async fn wait_for_signal_impl() -> &'static str {
    let _ = tokio::signal::ctrl_c().await;
    "CTRL_C"
}

pub async fn wait_for_stop_signal() -> &'static str {
    wait_for_signal_impl().await
}
