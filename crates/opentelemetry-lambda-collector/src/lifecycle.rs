//! Lambda lifecycle notifications.
//!
//! The lifecycle manager owns a [`Notifier`] and hands clones of it to every
//! pipeline component through the build context. Components that must react
//! to invocation boundaries (the decouple processor, chiefly) register a
//! [`LifecycleListener`] while they are being constructed.

use crate::signal::BoxFuture;
use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};

/// Receives lifecycle transitions from the manager.
///
/// The manager awaits each callback before moving on, so the sandbox is not
/// frozen or torn down until every listener has returned.
pub trait LifecycleListener: Send + Sync {
    /// Called after the extension receives an `INVOKE` event.
    fn function_invoked(&self) -> BoxFuture<'_, ()>;

    /// Called once the invocation's `platform.runtimeDone` has been seen,
    /// before the extension asks for the next event.
    fn function_finished(&self) -> BoxFuture<'_, ()>;

    /// Called when a `SHUTDOWN` event arrives, before the pipeline stops.
    fn environment_shutdown(&self) -> BoxFuture<'_, ()>;
}

/// Lifecycle transitions, mostly useful for logging and tests.
#[non_exhaustive]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleEvent {
    /// An invocation started.
    FunctionInvoked,
    /// An invocation finished.
    FunctionFinished,
    /// The execution environment is shutting down.
    EnvironmentShutdown,
}

impl fmt::Display for LifecycleEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            LifecycleEvent::FunctionInvoked => "function-invoked",
            LifecycleEvent::FunctionFinished => "function-finished",
            LifecycleEvent::EnvironmentShutdown => "environment-shutdown",
        })
    }
}

/// Registry of lifecycle listeners, shared by cloning.
#[derive(Clone, Default)]
pub struct Notifier {
    listeners: Arc<Mutex<Vec<Arc<dyn LifecycleListener>>>>,
}

impl Notifier {
    /// Creates an empty notifier.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a listener. Listeners are notified in registration order.
    pub fn add_listener(&self, listener: Arc<dyn LifecycleListener>) {
        self.listeners
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(listener);
    }

    /// Returns the number of registered listeners.
    pub fn len(&self) -> usize {
        self.listeners
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Returns true when no listener is registered.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Delivers `event` to every listener, one after another.
    pub async fn notify(&self, event: LifecycleEvent) {
        // Snapshot so listeners may register further listeners without deadlocking.
        let listeners: Vec<_> = self
            .listeners
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();

        tracing::debug!(%event, listeners = listeners.len(), "Notifying lifecycle listeners");

        for listener in listeners {
            match event {
                LifecycleEvent::FunctionInvoked => listener.function_invoked().await,
                LifecycleEvent::FunctionFinished => listener.function_finished().await,
                LifecycleEvent::EnvironmentShutdown => listener.environment_shutdown().await,
            }
        }
    }
}

impl fmt::Debug for Notifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Notifier")
            .field("listeners", &self.len())
            .finish()
    }
}
