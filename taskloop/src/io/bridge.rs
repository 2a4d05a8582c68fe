//! Synchronous call surface over asynchronous collaborators.
//!
//! The loop is strictly sequential and synchronous, while oracles and actions
//! are `async`. [`Bridge::call`] drives a future to completion from plain
//! synchronous code regardless of the calling context:
//!
//! - no Tokio runtime on the calling thread: the future runs on the bridge's
//!   own current-thread runtime, directly on the caller's thread;
//! - a runtime is already active: the future runs on a short-lived scoped
//!   worker thread and the caller blocks on its result, so Tokio never sees a
//!   nested `block_on`.
//!
//! Every call is bounded by a timeout; expiry is reported as an error like any
//! other failure of the call.

use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::thread;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use tokio::runtime::{Builder, Handle, Runtime};
use tracing::debug;

/// Blocking adapter owning a private runtime for asynchronous calls.
pub struct Bridge {
    /// Always `Some` until dropped.
    runtime: Option<Runtime>,
}

impl Bridge {
    pub fn new() -> Result<Self> {
        let runtime = Builder::new_current_thread()
            .enable_all()
            .thread_name("taskloop-bridge")
            .build()
            .context("build bridge runtime")?;
        Ok(Self {
            runtime: Some(runtime),
        })
    }

    /// Drive `future` to completion, failing if it exceeds `timeout` or panics.
    pub fn call<F, T>(&self, label: &str, timeout: Duration, future: F) -> Result<T>
    where
        F: Future<Output = Result<T>> + Send,
        T: Send,
    {
        if Handle::try_current().is_ok() {
            debug!(label, "async runtime active; dispatching to worker thread");
            thread::scope(|scope| {
                let worker = thread::Builder::new()
                    .name(format!("taskloop-{label}"))
                    .spawn_scoped(scope, || self.drive(label, timeout, future))
                    .context("spawn bridge worker")?;
                worker
                    .join()
                    .map_err(|panic| anyhow!("{label} panicked: {}", panic_message(&*panic)))?
            })
        } else {
            self.drive(label, timeout, future)
        }
    }

    fn drive<F, T>(&self, label: &str, timeout: Duration, future: F) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        let guarded = async {
            match tokio::time::timeout(timeout, future).await {
                Ok(result) => result,
                Err(_) => Err(anyhow!("{label} timed out after {timeout:?}")),
            }
        };
        let runtime = self
            .runtime
            .as_ref()
            .ok_or_else(|| anyhow!("{label}: bridge runtime already shut down"))?;
        // Panics inside the future surface as errors of this call only.
        std::panic::catch_unwind(AssertUnwindSafe(|| runtime.block_on(guarded)))
            .map_err(|panic| anyhow!("{label} panicked: {}", panic_message(&*panic)))?
    }
}

impl Drop for Bridge {
    // A plain drop blocks on shutdown, which panics inside an async context.
    fn drop(&mut self) {
        if let Some(runtime) = self.runtime.take() {
            runtime.shutdown_background();
        }
    }
}

/// Best-effort text of a panic payload.
pub fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
