//! Turn SIGINT/SIGTERM into a cancellation of the shared run context.

use census_core::StopReason;
use census_kubehub::RunContext;
use tokio::task::JoinHandle;
use tracing::warn;

/// Cancel `ctx` on the first termination signal. The task ends quietly if the run finishes first.
pub fn spawn_signal_listener(ctx: RunContext) -> JoinHandle<()> {
    tokio::spawn(async move {
        let name = tokio::select! {
            _ = ctx.done() => return,
            name = termination_signal() => name,
        };
        warn!(signal = name, "termination signal received; stopping enumeration");
        ctx.cancel(StopReason::Signal { name });
    })
}

async fn interrupt() {
    if tokio::signal::ctrl_c().await.is_err() {
        std::future::pending::<()>().await;
    }
}

#[cfg(unix)]
async fn termination_signal() -> &'static str {
    use tokio::signal::unix::{signal, SignalKind};

    match signal(SignalKind::terminate()) {
        Ok(mut term) => tokio::select! {
            _ = interrupt() => "SIGINT",
            _ = term.recv() => "SIGTERM",
        },
        Err(e) => {
            warn!(error = %e, "cannot listen for SIGTERM; SIGINT only");
            interrupt().await;
            "SIGINT"
        }
    }
}

#[cfg(not(unix))]
async fn termination_signal() -> &'static str {
    interrupt().await;
    "SIGINT"
}
