//! Sources expand a run's payload into work units.

use async_trait::async_trait;
use serde_json::Value;
use std::fmt;
use std::sync::Arc;

/// Expands a discharge payload into unit payloads.
#[async_trait]
pub trait UnitGenerator: Send + Sync {
    /// Returns one payload per unit to create.
    async fn generate(&self, payload: &Value) -> anyhow::Result<Vec<Value>>;
}

/// One unit per array element, or a single unit carrying a non-array payload.
#[derive(Debug, Clone, Copy, Default)]
pub struct PassthroughGenerator;

#[async_trait]
impl UnitGenerator for PassthroughGenerator {
    async fn generate(&self, payload: &Value) -> anyhow::Result<Vec<Value>> {
        Ok(match payload {
            Value::Array(items) => items.clone(),
            other => vec![other.clone()],
        })
    }
}

/// Adapts a synchronous closure into a [`UnitGenerator`].
pub struct FnGenerator<F> {
    f: F,
}

impl<F> FnGenerator<F>
where
    F: Fn(&Value) -> anyhow::Result<Vec<Value>> + Send + Sync,
{
    /// Wraps `f`.
    pub fn new(f: F) -> Self {
        Self { f }
    }
}

#[async_trait]
impl<F> UnitGenerator for FnGenerator<F>
where
    F: Fn(&Value) -> anyhow::Result<Vec<Value>> + Send + Sync,
{
    async fn generate(&self, payload: &Value) -> anyhow::Result<Vec<Value>> {
        (self.f)(payload)
    }
}

/// A pipeline's entry point: a generator and the stage its units enter.
///
/// The entry stage is also where failed units re-enter on retry.
#[derive(Clone)]
pub struct Source {
    entry: String,
    generator: Arc<dyn UnitGenerator>,
}

impl Source {
    /// A source feeding `entry` with the output of `generator`.
    pub fn new(entry: impl Into<String>, generator: impl UnitGenerator + 'static) -> Self {
        Self {
            entry: entry.into(),
            generator: Arc::new(generator),
        }
    }

    /// A [`PassthroughGenerator`] source.
    pub fn passthrough(entry: impl Into<String>) -> Self {
        Self::new(entry, PassthroughGenerator)
    }

    /// The entry stage.
    #[must_use]
    pub fn entry(&self) -> &str {
        &self.entry
    }

    pub(crate) fn generator(&self) -> &Arc<dyn UnitGenerator> {
        &self.generator
    }
}

impl fmt::Debug for Source {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Source").field("entry", &self.entry).finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_passthrough_splits_arrays() {
        let units = PassthroughGenerator
            .generate(&json!([{"sku": 1}, {"sku": 2}]))
            .await
            .unwrap();
        assert_eq!(units, vec![json!({"sku": 1}), json!({"sku": 2})]);

        let single = PassthroughGenerator.generate(&json!({"sku": 3})).await.unwrap();
        assert_eq!(single, vec![json!({"sku": 3})]);

        let empty = PassthroughGenerator.generate(&json!([])).await.unwrap();
        assert!(empty.is_empty());
    }

    #[tokio::test]
    async fn test_fn_generator() {
        let source = Source::new(
            "fetch",
            FnGenerator::new(|payload: &Value| {
                let count = payload["count"]
                    .as_u64()
                    .ok_or_else(|| anyhow::anyhow!("count is required"))?;
                Ok((0..count).map(|i| json!({ "index": i })).collect())
            }),
        );

        assert_eq!(source.entry(), "fetch");
        let units = source.generator().generate(&json!({"count": 3})).await.unwrap();
        assert_eq!(units.len(), 3);

        let err = source.generator().generate(&json!({})).await.unwrap_err();
        assert_eq!(err.to_string(), "count is required");
    }
}
