//! Services started by the coordinator.

pub mod app_state;
pub mod broadcast;
pub mod config_watcher;
pub mod control;
pub mod dbus;
pub mod traits;

pub use app_state::AppStateProvider;
pub use broadcast::StatusBroadcastServiceProvider;
pub use config_watcher::ConfigWatcherServiceProvider;
pub use control::ControlServiceProvider;
pub use dbus::DBusServiceProvider;
pub use traits::{AsyncProvider, ServiceProvider};
