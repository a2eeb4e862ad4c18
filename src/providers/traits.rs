use anyhow::Result;
use async_trait::async_trait;

use crate::task_manager::TaskManager;

/// Builds a component that needs async initialization.
///
/// # Example
///
/// ```no_run
/// use nbfcd::providers::traits::AsyncProvider;
///
/// struct Greeting;
///
/// #[async_trait::async_trait]
/// impl AsyncProvider<String> for Greeting {
///     async fn provide(&self) -> anyhow::Result<String> {
///         Ok("hello".to_string())
///     }
/// }
/// ```
#[async_trait]
pub trait AsyncProvider<T> {
    async fn provide(&self) -> Result<T>;
}

/// A service started through the [`TaskManager`].
///
/// Services are started in descending [`priority`](Self::priority) order. A
/// critical service that fails to start aborts startup; any other failure is
/// logged and skipped.
#[async_trait]
pub trait ServiceProvider: Send + Sync {
    async fn start(&self, task_manager: &mut TaskManager) -> Result<()>;

    fn name(&self) -> &'static str;

    /// Higher numbers start first.
    fn priority(&self) -> i32 {
        0
    }

    fn is_critical(&self) -> bool {
        false
    }
}
