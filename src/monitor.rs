//! Task pair supervision
//!
//! Every tunnel connection and every upstream session runs as two sibling
//! loops. Whichever ends first (or an external shutdown) brings the other
//! down, and both are joined before the caller releases shared resources.

use tokio::sync::watch;
use tokio::task::JoinHandle;

/// What ended a supervised pair
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PairExit {
    First,
    Second,
    Shutdown,
}

/// Resolve once `shutdown` holds `true` or its sender is gone
pub async fn wait_for_shutdown(shutdown: &mut watch::Receiver<bool>) {
    loop {
        if *shutdown.borrow_and_update() {
            return;
        }
        if shutdown.changed().await.is_err() {
            return;
        }
    }
}

/// Abort a task and wait until it is gone
pub async fn cancel_and_join(task: JoinHandle<()>) {
    task.abort();
    if let Err(e) = task.await {
        if e.is_panic() {
            log::error!("Supervised task panicked: {}", e);
        }
    }
}

/// Wait for the first of `first`, `second` or `shutdown`, then stop and
/// join whatever is still running.
pub async fn supervise_pair(
    mut first: JoinHandle<()>,
    mut second: JoinHandle<()>,
    shutdown: &mut watch::Receiver<bool>,
) -> PairExit {
    let exit = tokio::select! {
        _ = &mut first => PairExit::First,
        _ = &mut second => PairExit::Second,
        _ = wait_for_shutdown(shutdown) => PairExit::Shutdown,
    };

    if exit != PairExit::First {
        cancel_and_join(first).await;
    }
    if exit != PairExit::Second {
        cancel_and_join(second).await;
    }
    exit
}
