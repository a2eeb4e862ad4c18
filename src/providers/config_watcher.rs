use anyhow::Result;
use async_trait::async_trait;
use log::{debug, error, info, warn};
use notify::{Event, EventHandler, RecursiveMode, Watcher, recommended_watcher};
use std::{
    collections::BTreeSet,
    path::{Path, PathBuf},
    sync::Arc,
    time::Duration,
};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::{
    app_context::AppState,
    event::{Event as AppEvent, EventBus},
    providers::traits::ServiceProvider,
    task_manager::TaskManager,
};

const DEBOUNCE: Duration = Duration::from_millis(500);

/// Watches the fan configuration directory for edits.
///
/// - **Priority**: 6
/// - **Critical**: No
///
/// When the file of the active configuration changes, a
/// [`ConfigChangeDetected`](AppEvent::ConfigChangeDetected) event is
/// published after a short debounce. Bursts of writes produce one event.
pub struct ConfigWatcherServiceProvider {
    state: Arc<AppState>,
    event_bus: EventBus,
}

impl ConfigWatcherServiceProvider {
    pub fn new(state: Arc<AppState>, event_bus: EventBus) -> Self {
        Self { state, event_bus }
    }
}

#[async_trait]
impl ServiceProvider for ConfigWatcherServiceProvider {
    async fn start(&self, task_manager: &mut TaskManager) -> Result<()> {
        let state = self.state.clone();
        let event_bus = self.event_bus.clone();
        let configs_dir = state.config().await.configs_dir.clone();

        task_manager
            .spawn_task(self.name().to_string(), |cancel_token| async move {
                let active = move || state.control.get_status().config_name.clone();
                watch_configs(configs_dir, active, event_bus, cancel_token).await
            })
            .await
    }

    fn name(&self) -> &'static str {
        "ConfigWatcherService"
    }

    fn priority(&self) -> i32 {
        6
    }
}

/// Bridges notify's callback thread into the async task.
struct ChannelHandler(mpsc::UnboundedSender<notify::Result<Event>>);

impl EventHandler for ChannelHandler {
    fn handle_event(&mut self, event: notify::Result<Event>) {
        if self.0.send(event).is_err() {
            debug!("Config watcher is gone, dropping filesystem event");
        }
    }
}

/// Name of the fan configuration stored at `path`, if it is one.
fn config_name(path: &Path) -> Option<String> {
    if path.extension()? != "yml" {
        return None;
    }
    path.file_stem()?.to_str().map(str::to_string)
}

async fn watch_configs(
    configs_dir: PathBuf,
    active: impl Fn() -> Option<String> + Send,
    event_bus: EventBus,
    cancel_token: CancellationToken,
) -> Result<()> {
    let (event_tx, mut event_rx) = mpsc::unbounded_channel();
    let mut watcher = recommended_watcher(ChannelHandler(event_tx))?;
    watcher.watch(&configs_dir, RecursiveMode::NonRecursive)?;
    info!("Watching fan configurations in {}", configs_dir.display());

    let mut changed = BTreeSet::new();
    let debounce = tokio::time::sleep(DEBOUNCE);
    tokio::pin!(debounce);

    loop {
        tokio::select! {
            () = cancel_token.cancelled() => break,

            event = event_rx.recv() => match event {
                Some(Ok(event)) if event.kind.is_modify() || event.kind.is_create() => {
                    let names: Vec<_> = event.paths.iter().filter_map(|p| config_name(p)).collect();
                    if !names.is_empty() {
                        changed.extend(names);
                        debounce.as_mut().reset(tokio::time::Instant::now() + DEBOUNCE);
                    }
                }
                Some(Ok(event)) => debug!("Ignoring filesystem event {:?}", event.kind),
                Some(Err(e)) => warn!("Filesystem watcher error: {e}"),
                None => {
                    error!("Filesystem event channel closed");
                    break;
                }
            },

            () = &mut debounce, if !changed.is_empty() => {
                let active = active();
                for name in std::mem::take(&mut changed) {
                    if active.as_deref() != Some(name.as_str()) {
                        debug!("Inactive configuration '{name}' changed");
                        continue;
                    }
                    info!("Active fan configuration '{name}' changed on disk");
                    event_bus.notify(AppEvent::ConfigChangeDetected { name });
                }
            }
        }
    }

    if let Err(e) = watcher.unwatch(&configs_dir) {
        warn!("Failed to unwatch {}: {e}", configs_dir.display());
    }
    info!("Config watcher stopped");
    Ok(())
}
