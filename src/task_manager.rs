//! Named background tasks with cooperative cancellation.

use std::{collections::HashMap, future::Future, time::Duration};

use anyhow::{Context, Result, anyhow};
use log::{error, info, warn};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Upper bound for a single task to finish after cancellation.
pub const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(10);

/// Spawns service tasks, each with a child of one root token.
///
/// Cancelling the root (or calling [`shutdown_all`](Self::shutdown_all))
/// cancels every task; [`stop_task`](Self::stop_task) stops one by name.
pub struct TaskManager {
    tasks: HashMap<String, TaskInfo>,
    root: CancellationToken,
    shutdown_timeout: Duration,
}

struct TaskInfo {
    handle: JoinHandle<Result<()>>,
    cancel_token: CancellationToken,
}

impl TaskManager {
    pub fn new() -> Self {
        Self::with_shutdown_timeout(SHUTDOWN_TIMEOUT)
    }

    pub fn with_shutdown_timeout(shutdown_timeout: Duration) -> Self {
        Self {
            tasks: HashMap::new(),
            root: CancellationToken::new(),
            shutdown_timeout,
        }
    }

    /// Token that cancels every task of this manager.
    pub fn root_token(&self) -> &CancellationToken {
        &self.root
    }

    /// Spawns `task_fn` under `name`; a task with the same name is an error.
    pub async fn spawn_task<F, Fut>(&mut self, name: String, task_fn: F) -> Result<()>
    where
        F: FnOnce(CancellationToken) -> Fut + Send + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        if self.tasks.contains_key(&name) {
            anyhow::bail!("Task '{name}' is already running");
        }

        let cancel_token = self.root.child_token();
        let task_token = cancel_token.clone();
        let task_name = name.clone();

        let handle = tokio::spawn(async move {
            let result = task_fn(task_token).await;
            match &result {
                Ok(()) => info!("Task '{task_name}' finished"),
                Err(e) => error!("Task '{task_name}' failed: {e:#}"),
            }
            result
        });

        info!("Task '{name}' spawned");
        self.tasks.insert(
            name,
            TaskInfo {
                handle,
                cancel_token,
            },
        );
        Ok(())
    }

    /// Cancels one task and waits for it.
    pub async fn stop_task(&mut self, name: &str) -> Result<()> {
        let task = self
            .tasks
            .remove(name)
            .ok_or_else(|| anyhow!("No task named '{name}'"))?;
        task.cancel_token.cancel();
        self.join(name, task.handle).await
    }

    /// Cancels every task and waits for all of them.
    ///
    /// Returns the first failure after all tasks were awaited.
    pub async fn shutdown_all(&mut self) -> Result<()> {
        info!("Stopping all {} tasks", self.tasks.len());
        self.root.cancel();

        let mut first_error = None;
        for (name, task) in self.tasks.drain().collect::<Vec<_>>() {
            if let Err(e) = self.join(&name, task.handle).await {
                warn!("{e:#}");
                first_error.get_or_insert(e);
            }
        }

        match first_error {
            Some(e) => Err(e).context("One or more tasks failed during shutdown"),
            None => {
                info!("All tasks stopped");
                Ok(())
            }
        }
    }

    pub fn active_count(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_running(&self, name: &str) -> bool {
        self.tasks
            .get(name)
            .is_some_and(|task| !task.handle.is_finished())
    }

    async fn join(&self, name: &str, handle: JoinHandle<Result<()>>) -> Result<()> {
        match tokio::time::timeout(self.shutdown_timeout, handle).await {
            Ok(Ok(result)) => result.with_context(|| format!("Task '{name}' failed")),
            Ok(Err(e)) => Err(anyhow!("Task '{name}' panicked: {e}")),
            Err(_) => Err(anyhow!(
                "Task '{name}' did not stop within {:?}",
                self.shutdown_timeout
            )),
        }
    }
}

impl Default for TaskManager {
    fn default() -> Self {
        Self::new()
    }
}
