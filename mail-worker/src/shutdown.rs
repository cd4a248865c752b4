//! Graceful shutdown.
//!
//! On SIGINT or SIGTERM the worker stops consuming and the coordinator
//! releases everything it holds, in order:
//!
//! 1. broker channel
//! 2. broker connection
//! 3. SMTP session
//! 4. in-flight delivery tasks (cancelled, then awaited)
//!
//! A failing step is logged and the remaining steps still run. Deliveries
//! cancelled mid-flight are left unresolved; the broker redelivers them once
//! the connection is gone.

use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use lapin::{Channel, Connection};
use tokio::signal;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::transport::{Connector, TransportSession};

/// Wait for SIGINT or (on unix) SIGTERM. Returns the signal name.
pub async fn wait_for_signal() -> &'static str {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "sigint_handler_install_failed");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                error!(error = %e, "sigterm_handler_install_failed");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => "SIGINT",
        _ = terminate => "SIGTERM",
    }
}

/// In-flight delivery tasks sharing one cancellation token.
pub struct TaskSet {
    tasks: JoinSet<()>,
    token: CancellationToken,
}

/// What happened to the tasks drained at shutdown.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct DrainReport {
    pub completed: usize,
    pub cancelled: usize,
    pub panicked: usize,
}

impl Default for TaskSet {
    fn default() -> Self {
        Self::new()
    }
}

impl TaskSet {
    pub fn new() -> Self {
        Self {
            tasks: JoinSet::new(),
            token: CancellationToken::new(),
        }
    }

    /// Token checked by tasks at their suspension points.
    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }

    pub fn spawn<F>(&mut self, task: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.tasks.spawn(task);
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    /// Drop bookkeeping for tasks that already finished.
    pub fn reap(&mut self) {
        while let Some(result) = self.tasks.try_join_next() {
            if let Err(e) = result {
                if e.is_panic() {
                    error!(error = %e, "delivery_task_panicked");
                }
            }
        }
    }

    /// Cancel every task and wait for all of them to finish.
    ///
    /// Cancellation and panics are counted, never propagated.
    pub async fn cancel_and_drain(&mut self) -> DrainReport {
        self.token.cancel();
        self.tasks.abort_all();

        let mut report = DrainReport::default();
        while let Some(result) = self.tasks.join_next().await {
            match result {
                Ok(()) => report.completed += 1,
                Err(e) if e.is_cancelled() => report.cancelled += 1,
                Err(e) => {
                    warn!(error = %e, "delivery_task_panicked");
                    report.panicked += 1;
                }
            }
        }
        report
    }
}

/// A resource released during shutdown.
#[async_trait]
pub trait Teardown: Send {
    fn label(&self) -> &'static str;

    async fn teardown(&mut self) -> anyhow::Result<()>;
}

#[async_trait]
impl Teardown for Channel {
    fn label(&self) -> &'static str {
        "rabbitmq_channel"
    }

    async fn teardown(&mut self) -> anyhow::Result<()> {
        self.close(200, "Normal shutdown").await?;
        Ok(())
    }
}

#[async_trait]
impl Teardown for Connection {
    fn label(&self) -> &'static str {
        "rabbitmq_connection"
    }

    async fn teardown(&mut self) -> anyhow::Result<()> {
        self.close(200, "Normal shutdown").await?;
        Ok(())
    }
}

#[async_trait]
impl<C> Teardown for Arc<TransportSession<C>>
where
    C: Connector + 'static,
{
    fn label(&self) -> &'static str {
        "smtp_session"
    }

    async fn teardown(&mut self) -> anyhow::Result<()> {
        self.close().await?;
        Ok(())
    }
}

/// Releases resources in registration order, then drains tasks.
pub struct ShutdownCoordinator {
    steps: Vec<Box<dyn Teardown>>,
    tasks: TaskSet,
}

impl ShutdownCoordinator {
    pub fn new(tasks: TaskSet) -> Self {
        Self {
            steps: Vec::new(),
            tasks,
        }
    }

    /// Register the next resource to release.
    pub fn then(mut self, step: impl Teardown + 'static) -> Self {
        self.steps.push(Box::new(step));
        self
    }

    /// Run every step. Failures are logged and do not stop later steps.
    pub async fn run(mut self) -> DrainReport {
        for step in self.steps.iter_mut() {
            let label = step.label();
            match step.teardown().await {
                Ok(()) => info!(resource = label, "shutdown_resource_closed"),
                Err(e) => warn!(resource = label, error = %e, "shutdown_resource_close_failed"),
            }
        }

        let in_flight = self.tasks.len();
        info!(in_flight = in_flight, "shutdown_cancelling_tasks");

        let report = self.tasks.cancel_and_drain().await;

        info!(
            completed = report.completed,
            cancelled = report.cancelled,
            panicked = report.panicked,
            "shutdown_tasks_drained"
        );

        report
    }
}
