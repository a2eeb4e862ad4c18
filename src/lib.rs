//! # nbfcd
//!
//! A Linux daemon controlling notebook fans through the embedded controller.
//!
//! ## Features
//!
//! - **Fan Curves**: Temperature to speed curves with hysteresis per fan
//! - **Safety Fallback**: Fans that keep failing are handed back to the firmware
//! - **EC Backends**: Kernel `ec_sys` register file or in-memory registers
//! - **Temperature Sources**: EC registers and hwmon sysfs inputs
//! - **D-Bus Interface**: Status, start/stop, configuration selection and
//!   per-fan overrides, plus the `nbfc` command-line client
//! - **Hot Reload**: Edits to the active fan configuration apply without restart
//!
//! ## Architecture
//!
//! The daemon uses a provider-based service system with:
//! - [`SystemCoordinator`](coordinator::SystemCoordinator) - Main lifecycle manager
//! - [`ControlLoop`](control_loop::ControlLoop) - Periodic read, map, apply cycle
//! - [`ControlHandle`](control_loop::ControlHandle) - Client protocol of the loop
//! - [`EventBus`](event::EventBus) - Inter-service communication
//! - [`AppState`](app_context::AppState) - Shared application state
//!
//! ## Example
//!
//! ```no_run
//! use nbfcd::{application::Application, config::ConfigManager};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config_manager = ConfigManager::load(None).await?;
//!     Application::builder()
//!         .with_config_manager(config_manager)
//!         .build()?
//!         .run()
//!         .await
//! }
//! ```

pub mod app_context;
pub mod application;
pub mod cli;
pub mod client;
pub mod config;
pub mod control_loop;
pub mod controller;
pub mod coordinator;
pub mod drivers;
pub mod error;
pub mod event;
pub mod fan_config;
pub mod fan_controller;
pub mod fan_curve;
pub mod interface;
pub mod providers;
pub mod sensors;
pub mod status;
pub mod task_manager;
pub mod temperature_sensors;
