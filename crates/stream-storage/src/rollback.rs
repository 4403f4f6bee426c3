//! Compensations of external side effects.
//!
//! Operations that create resources outside the metadata store register an
//! undo action here. The caller runs them if the surrounding logical
//! operation fails; nothing is undone automatically.

use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};

use tracing::{info, warn};

use crate::error::{MultiError, StorageError, StorageResult};

type Action = Box<dyn FnOnce() -> Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send>> + Send>;

/// Shared collector of compensating actions. Clones share the same list.
#[derive(Clone, Default)]
pub struct Rollback {
    actions: Arc<Mutex<Vec<Action>>>,
}

impl Rollback {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add<F, Fut>(&self, action: F)
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        let action: Action = Box::new(move || Box::pin(action()));
        match self.actions.lock() {
            Ok(mut actions) => actions.push(action),
            Err(poisoned) => poisoned.into_inner().push(action),
        }
    }

    pub fn len(&self) -> usize {
        self.actions.lock().map(|a| a.len()).unwrap_or_else(|p| p.into_inner().len())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Run all registered actions, the last registered first.
    ///
    /// Every action runs even if an earlier one fails; failures are
    /// reported together.
    pub async fn run(&self) -> StorageResult<()> {
        let actions = {
            let mut guard = match self.actions.lock() {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
            std::mem::take(&mut *guard)
        };

        if actions.is_empty() {
            return Ok(());
        }
        info!(count = actions.len(), "running rollback");

        let mut errs = MultiError::new();
        for action in actions.into_iter().rev() {
            if let Err(e) = action().await {
                warn!(error = %e, "rollback action failed");
                errs.push(StorageError::Provider(e));
            }
        }
        errs.into_result()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_run_in_reverse_order() {
        let rollback = Rollback::new();
        let log = Arc::new(Mutex::new(Vec::new()));
        for i in 0..3 {
            let log = Arc::clone(&log);
            rollback.add(move || async move {
                log.lock().unwrap().push(i);
                Ok(())
            });
        }
        assert_eq!(rollback.len(), 3);

        rollback.run().await.unwrap();
        assert_eq!(*log.lock().unwrap(), vec![2, 1, 0]);
        assert!(rollback.is_empty());
    }

    #[tokio::test]
    async fn test_errors_are_collected() {
        let rollback = Rollback::new();
        rollback.add(|| async { anyhow::bail!("first") });
        rollback.add(|| async { Ok(()) });
        rollback.add(|| async { anyhow::bail!("second") });

        let err = rollback.run().await.unwrap_err();
        assert_eq!(
            err.to_string(),
            "- file resource provider error: second\n- file resource provider error: first"
        );
    }
}
