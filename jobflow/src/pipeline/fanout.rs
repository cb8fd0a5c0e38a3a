//! Fan-out sub-resolution within a single stage.
//!
//! Every item is first resolved concurrently, one registered sub-task per
//! item. Items that did not resolve go through the creation path one at a
//! time: creating the same logical entry from two tasks would duplicate it,
//! so each creation re-checks for an existing entry immediately before
//! creating one.

use crate::cancellation::{CancellationToken, TaskScope};
use crate::errors::StageError;
use async_trait::async_trait;
use futures::stream::{FuturesUnordered, StreamExt};
use std::sync::Arc;
use tokio::task::AbortHandle;
use tracing::debug;

/// Resolves the items of a fan-out stage.
#[async_trait]
pub trait ItemResolver: Send + Sync + 'static {
    /// The unresolved item.
    type Item: Clone + Send + Sync + 'static;
    /// The resolved value.
    type Resolved: Send + 'static;

    /// Concurrent resolution. `Ok(None)` leaves the item unresolved.
    async fn resolve(&self, item: &Self::Item) -> Result<Option<Self::Resolved>, StageError>;

    /// Looks up an existing entry for the item.
    async fn lookup(&self, item: &Self::Item) -> Result<Option<Self::Resolved>, StageError>;

    /// Creates a new entry for the item. Only ever called sequentially.
    async fn create(&self, item: &Self::Item) -> Result<Self::Resolved, StageError>;
}

/// Result of a fan-out resolution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FanOutOutcome<T> {
    /// Resolved values, in input order.
    pub values: Vec<T>,
    /// Items resolved by the concurrent pass.
    pub resolved: usize,
    /// Items found by the re-check before creation.
    pub found_existing: usize,
    /// Items created.
    pub created: usize,
}

struct AbortOnDrop(Vec<AbortHandle>);

impl Drop for AbortOnDrop {
    fn drop(&mut self) {
        for handle in &self.0 {
            handle.abort();
        }
    }
}

/// Resolves `items` concurrently, then creates the unresolved ones in order.
///
/// # Errors
///
/// Returns `StageError::Cancelled` once the token fires (outstanding
/// sub-tasks are aborted) and propagates failures of the creation path.
pub async fn resolve_all<R: ItemResolver>(
    resolver: Arc<R>,
    items: Vec<R::Item>,
    scope: &TaskScope,
    token: &CancellationToken,
) -> Result<FanOutOutcome<R::Resolved>, StageError> {
    let total = items.len();
    let mut pending = FuturesUnordered::new();
    let mut guard = AbortOnDrop(Vec::with_capacity(total));

    for (index, item) in items.iter().cloned().enumerate() {
        let resolver = resolver.clone();
        let handle = scope.spawn(async move {
            let result = resolver.resolve(&item).await;
            (index, result)
        })?;
        guard.0.push(handle.abort_handle());
        pending.push(handle);
    }

    let mut slots: Vec<Option<R::Resolved>> = std::iter::repeat_with(|| None).take(total).collect();
    let mut resolved = 0;

    loop {
        let joined = tokio::select! {
            biased;
            () = token.cancelled() => return Err(StageError::Cancelled),
            joined = pending.next() => joined,
        };
        let Some(joined) = joined else { break };

        match joined {
            Ok((index, Ok(Some(value)))) => {
                slots[index] = Some(value);
                resolved += 1;
            }
            Ok((_, Err(StageError::Cancelled))) => return Err(StageError::Cancelled),
            Ok((index, Ok(None))) => debug!(index, "Item unresolved"),
            Ok((index, Err(error))) => debug!(index, error = %error, "Item resolution failed"),
            Err(join_error) if join_error.is_cancelled() => return Err(StageError::Cancelled),
            Err(join_error) => debug!(error = %join_error, "Resolution task panicked"),
        }
    }
    drop(guard);
    token.check()?;

    let mut found_existing = 0;
    let mut created = 0;
    for (index, item) in items.iter().enumerate() {
        if slots[index].is_some() {
            continue;
        }
        token.check()?;
        let value = match resolver.lookup(item).await? {
            Some(existing) => {
                found_existing += 1;
                existing
            }
            None => {
                token.check()?;
                created += 1;
                resolver.create(item).await?
            }
        };
        token.check()?;
        slots[index] = Some(value);
    }

    Ok(FanOutOutcome {
        values: slots.into_iter().flatten().collect(),
        resolved,
        found_existing,
        created,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cancellation::TaskRegistry;
    use crate::core::JobId;
    use parking_lot::Mutex;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    /// A catalog where names starting with "known" resolve directly.
    #[derive(Default)]
    struct Catalog {
        entries: Mutex<HashMap<String, u32>>,
        creating: AtomicUsize,
        max_concurrent_creates: AtomicUsize,
        resolve_delay: Option<Duration>,
    }

    #[async_trait]
    impl ItemResolver for Catalog {
        type Item = String;
        type Resolved = u32;

        async fn resolve(&self, item: &String) -> Result<Option<u32>, StageError> {
            if let Some(delay) = self.resolve_delay {
                tokio::time::sleep(delay).await;
            }
            if item.starts_with("known") {
                Ok(Some(1))
            } else if item == "broken" {
                Err(StageError::compute("resolve", "lookup service down"))
            } else {
                Ok(None)
            }
        }

        async fn lookup(&self, item: &String) -> Result<Option<u32>, StageError> {
            Ok(self.entries.lock().get(item).copied())
        }

        async fn create(&self, item: &String) -> Result<u32, StageError> {
            let now = self.creating.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_concurrent_creates.fetch_max(now, Ordering::SeqCst);
            tokio::task::yield_now().await;
            let id = {
                let mut entries = self.entries.lock();
                let id = u32::try_from(entries.len()).unwrap() + 100;
                entries.insert(item.clone(), id);
                id
            };
            self.creating.fetch_sub(1, Ordering::SeqCst);
            Ok(id)
        }
    }

    fn scope() -> (TaskScope, Arc<CancellationToken>, Arc<TaskRegistry>) {
        let registry = Arc::new(TaskRegistry::new());
        let token = Arc::new(CancellationToken::new());
        (TaskScope::new(registry.clone(), JobId::new(), token.clone()), token, registry)
    }

    fn items(names: &[&str]) -> Vec<String> {
        names.iter().map(|s| (*s).to_string()).collect()
    }

    #[tokio::test]
    async fn test_partitions_and_creates_sequentially() {
        let catalog = Arc::new(Catalog::default());
        let (scope, token, registry) = scope();

        let outcome = resolve_all(
            catalog.clone(),
            items(&["known-a", "tofu", "known-b", "broken", "tempeh"]),
            &scope,
            &token,
        )
        .await
        .unwrap();

        assert_eq!(outcome.resolved, 2);
        assert_eq!(outcome.created, 3);
        assert_eq!(outcome.found_existing, 0);
        assert_eq!(outcome.values, vec![1, 100, 1, 101, 102]);
        assert_eq!(catalog.max_concurrent_creates.load(Ordering::SeqCst), 1);
        assert_eq!(registry.total_active(), 0);
    }

    #[tokio::test]
    async fn test_recheck_reuses_existing_entry() {
        let catalog = Arc::new(Catalog::default());
        let (scope, token, _registry) = scope();

        let outcome = resolve_all(catalog.clone(), items(&["tofu", "tofu"]), &scope, &token)
            .await
            .unwrap();

        assert_eq!(outcome.created, 1);
        assert_eq!(outcome.found_existing, 1);
        assert_eq!(outcome.values, vec![100, 100]);
        assert_eq!(catalog.entries.lock().len(), 1);
    }

    #[tokio::test]
    async fn test_cancel_aborts_outstanding_tasks() {
        let catalog = Arc::new(Catalog {
            resolve_delay: Some(Duration::from_secs(60)),
            ..Catalog::default()
        });
        let (scope, token, registry) = scope();

        let run = {
            let token = token.clone();
            tokio::spawn(async move {
                resolve_all(catalog, items(&["known-a", "known-b"]), &scope, &token).await
            })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(registry.total_active(), 2);
        token.cancel("deleted");

        let result = tokio::time::timeout(Duration::from_secs(1), run).await.unwrap().unwrap();
        assert_eq!(result, Err(StageError::Cancelled));

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(registry.total_active(), 0);
    }

    #[tokio::test]
    async fn test_cancelled_before_spawn() {
        let catalog = Arc::new(Catalog::default());
        let (scope, token, registry) = scope();
        token.cancel("paused");

        let result = resolve_all(catalog, items(&["known-a"]), &scope, &token).await;
        assert_eq!(result, Err(StageError::Cancelled));
        assert_eq!(registry.total_active(), 0);
    }
}
