//! OS signal entry into the coordinator
//!
//! - SIGINT, SIGQUIT, SIGHUP: graceful stop
//! - SIGTERM: graceful restart (relaunch after the drain)
//!
//! When the host manages its own serving lifecycle, restart requests are
//! downgraded to a stop and the coordinator only orchestrates the wait.

use tracing::info;

use crate::error::Result;

use super::Coordinator;

/// What the process should do once the drain has finished
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Termination {
    /// Exit
    Stop,
    /// Relaunch the same executable with the same arguments, then exit
    Restart,
}

/// Wait for a termination signal, request shutdown, and report what the
/// entry point should do after the drain.
pub async fn listen(coordinator: &Coordinator, host_managed: bool) -> Result<Termination> {
    let pid = std::process::id();
    info!("Exec `kill -INT {}` will graceful exit", pid);
    if !host_managed {
        info!("Exec `kill -TERM {}` will graceful restart", pid);
    }

    let (name, termination) = wait_for_signal().await?;
    info!("Received {}", name);

    if host_managed {
        info!("Stopping host-managed server");
    } else {
        info!("Stopping console server");
    }

    coordinator.request_shutdown(name);
    Ok(resolve(termination, host_managed))
}

/// Restarts become stops when the host owns the process lifecycle
fn resolve(termination: Termination, host_managed: bool) -> Termination {
    if host_managed {
        Termination::Stop
    } else {
        termination
    }
}

#[cfg(unix)]
async fn wait_for_signal() -> Result<(&'static str, Termination)> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigint = signal(SignalKind::interrupt())?;
    let mut sigterm = signal(SignalKind::terminate())?;
    let mut sigquit = signal(SignalKind::quit())?;
    let mut sighup = signal(SignalKind::hangup())?;

    let received = tokio::select! {
        _ = sigint.recv() => ("SIGINT", Termination::Stop),
        _ = sigquit.recv() => ("SIGQUIT", Termination::Stop),
        _ = sighup.recv() => ("SIGHUP", Termination::Stop),
        _ = sigterm.recv() => ("SIGTERM", Termination::Restart),
    };

    Ok(received)
}

#[cfg(not(unix))]
async fn wait_for_signal() -> Result<(&'static str, Termination)> {
    tokio::signal::ctrl_c().await?;
    Ok(("Ctrl-C", Termination::Stop))
}
