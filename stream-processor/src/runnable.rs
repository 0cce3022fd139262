//! Uniform start/stop contract for long-running loops.

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use futures::future::join_all;
use thiserror::Error;
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::mpsc;
use tracing::{info, warn};

#[async_trait]
pub trait Runnable: Send + Sync {
    /// Runs until finished or closed.
    async fn run(&self) -> anyhow::Result<()>;

    /// Asks a running `run` to return. Calling it more than once is harmless.
    async fn close(&self);
}

#[derive(Error, Debug)]
#[error("all {} runnables failed: {}", .0.len(), .0.join("; "))]
pub struct AllRunnablesFailed(pub Vec<String>);

/// Runs children concurrently and waits for every one of them.
///
/// Child failures are sent to the errors channel. `run` fails only if every child failed.
pub struct CompositeRunnable {
    children: Vec<Arc<dyn Runnable>>,
    errors_tx: mpsc::Sender<anyhow::Error>,
    errors_rx: Mutex<Option<mpsc::Receiver<anyhow::Error>>>,
}

impl CompositeRunnable {
    pub fn new(children: Vec<Arc<dyn Runnable>>) -> Self {
        let (errors_tx, errors_rx) = mpsc::channel(children.len().max(1));
        Self {
            children,
            errors_tx,
            errors_rx: Mutex::new(Some(errors_rx)),
        }
    }

    /// The stream of child errors; available once.
    pub fn take_errors(&self) -> Option<mpsc::Receiver<anyhow::Error>> {
        match self.errors_rx.lock() {
            Ok(mut guard) => guard.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        }
    }

    pub fn len(&self) -> usize {
        self.children.len()
    }

    pub fn is_empty(&self) -> bool {
        self.children.is_empty()
    }
}

#[async_trait]
impl Runnable for CompositeRunnable {
    async fn run(&self) -> anyhow::Result<()> {
        let results = join_all(self.children.iter().map(|child| child.run())).await;

        let mut failures = Vec::new();
        for (index, result) in results.into_iter().enumerate() {
            let Err(e) = result else { continue };
            warn!(child = index, error = ?e, "Runnable failed");
            failures.push(format!("{e:#}"));
            if self.errors_tx.try_send(e).is_err() {
                warn!(child = index, "Runnable error channel is full or unread");
            }
        }

        if !self.children.is_empty() && failures.len() == self.children.len() {
            return Err(AllRunnablesFailed(failures).into());
        }
        Ok(())
    }

    async fn close(&self) {
        join_all(self.children.iter().map(|child| child.close())).await;
    }
}

async fn wait_for_shutdown_signal() -> anyhow::Result<()> {
    let mut sigterm = signal(SignalKind::terminate())?;
    tokio::select! {
        res = tokio::signal::ctrl_c() => {
            res?;
            info!("received SIGINT");
        }
        _ = sigterm.recv() => info!("received SIGTERM"),
    }
    Ok(())
}

/// Runs `runnable` until it returns or the process receives SIGINT or SIGTERM, in which
/// case it is closed and its result awaited.
pub async fn run_in_process(runnable: Arc<dyn Runnable>) -> anyhow::Result<()> {
    let run = runnable.run();
    tokio::pin!(run);

    tokio::select! {
        res = &mut run => res,
        signal = wait_for_shutdown_signal() => {
            if let Err(e) = signal {
                warn!(error = ?e, "Failed to listen for shutdown signals");
            }
            runnable.close().await;
            run.await
        }
    }
}

pub async fn run_composite_in_process(children: Vec<Arc<dyn Runnable>>) -> anyhow::Result<()> {
    run_in_process(Arc::new(CompositeRunnable::new(children))).await
}
