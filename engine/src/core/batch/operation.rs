//! Operation Registry
//!
//! Maps each operation kind to the work function that processes one item.
//! The registry is built once at startup and is immutable afterwards.

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use super::OperationKind;

// =============================================================================
// Work Function
// =============================================================================

/// Per-item work for one operation type
///
/// Invoked exactly once per dispatched item. Retries, timeouts and the
/// meaning of `options` are the implementation's concern; the scheduler only
/// records `Ok(payload)` or `Err(message)`.
#[async_trait]
pub trait WorkFunction: Send + Sync {
    /// Processes a single item
    async fn execute(
        &self,
        item_id: &str,
        options: &serde_json::Value,
    ) -> Result<serde_json::Value, String>;

    /// Job-level precondition, checked once before the first item starts
    async fn prepare(&self, _options: &serde_json::Value) -> Result<(), String> {
        Ok(())
    }
}

/// Adapts an async closure into a [`WorkFunction`]
pub struct FnWork<F> {
    f: F,
}

impl<F> FnWork<F> {
    /// Wraps `f`, called with an owned item ID and options
    pub fn new(f: F) -> Self {
        Self { f }
    }
}

#[async_trait]
impl<F, Fut> WorkFunction for FnWork<F>
where
    F: Fn(String, serde_json::Value) -> Fut + Send + Sync,
    Fut: Future<Output = Result<serde_json::Value, String>> + Send,
{
    async fn execute(
        &self,
        item_id: &str,
        options: &serde_json::Value,
    ) -> Result<serde_json::Value, String> {
        (self.f)(item_id.to_string(), options.clone()).await
    }
}

// =============================================================================
// Descriptors
// =============================================================================

/// Registered definition of an operation type
#[derive(Clone)]
pub struct OperationDescriptor {
    /// Operation tag
    pub kind: OperationKind,
    /// Human-readable description
    pub description: String,
    /// Work function
    pub work: Arc<dyn WorkFunction>,
}

impl fmt::Debug for OperationDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OperationDescriptor")
            .field("kind", &self.kind)
            .field("description", &self.description)
            .finish_non_exhaustive()
    }
}

/// Public description of a registered operation
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OperationInfo {
    /// Operation tag
    pub kind: OperationKind,
    /// Human-readable description
    pub description: String,
}

// =============================================================================
// Registry
// =============================================================================

/// Immutable operation registry
#[derive(Clone, Debug, Default)]
pub struct OperationRegistry {
    operations: HashMap<OperationKind, OperationDescriptor>,
}

impl OperationRegistry {
    /// Starts building a registry
    pub fn builder() -> OperationRegistryBuilder {
        OperationRegistryBuilder::default()
    }

    /// Looks up an operation
    pub fn get(&self, kind: &OperationKind) -> Option<&OperationDescriptor> {
        self.operations.get(kind)
    }

    /// Checks if an operation is registered
    pub fn contains(&self, kind: &OperationKind) -> bool {
        self.operations.contains_key(kind)
    }

    /// Number of registered operations
    pub fn len(&self) -> usize {
        self.operations.len()
    }

    /// Checks if the registry is empty
    pub fn is_empty(&self) -> bool {
        self.operations.is_empty()
    }

    /// Registered operations sorted by name
    pub fn infos(&self) -> Vec<OperationInfo> {
        let mut infos: Vec<_> = self
            .operations
            .values()
            .map(|d| OperationInfo {
                kind: d.kind.clone(),
                description: d.description.clone(),
            })
            .collect();
        infos.sort_by(|a, b| a.kind.as_str().cmp(b.kind.as_str()));
        infos
    }
}

/// Builder for [`OperationRegistry`]
#[derive(Default)]
pub struct OperationRegistryBuilder {
    operations: HashMap<OperationKind, OperationDescriptor>,
}

impl OperationRegistryBuilder {
    /// Registers a work function; a later registration of the same kind replaces the earlier one
    pub fn register(
        mut self,
        kind: OperationKind,
        description: impl Into<String>,
        work: impl WorkFunction + 'static,
    ) -> Self {
        let descriptor = OperationDescriptor {
            kind: kind.clone(),
            description: description.into(),
            work: Arc::new(work),
        };
        if self.operations.insert(kind.clone(), descriptor).is_some() {
            tracing::warn!(operation = %kind, "Operation registered twice, keeping the latest");
        }
        self
    }

    /// Freezes the registry
    pub fn build(self) -> OperationRegistry {
        OperationRegistry {
            operations: self.operations,
        }
    }
}
