//! Small synchronization helpers shared by the dispatcher and the pool.

use std::sync::{Mutex, MutexGuard, PoisonError};

use tokio::sync::watch;

/// Lock a std mutex, recovering the guard if a holder panicked.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Resolves once shutdown is requested or the sender is gone.
pub(crate) async fn stopped(shutdown: &mut watch::Receiver<bool>) {
    let _ = shutdown.wait_for(|stop| *stop).await;
}
