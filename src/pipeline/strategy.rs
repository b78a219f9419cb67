//! Strategy trait, per-run context and stage results.

use async_trait::async_trait;
use serde::Serialize;
use serde_json::{Map, Value};
use std::collections::BTreeMap;

use crate::core::Message;
use crate::error::Result;

/// Data carried through one message's strategy chain.
///
/// Any stage may read any key. Writes go through [`scope`](Self::scope) so
/// each stage owns the `<strategy>.` prefix it writes under.
#[derive(Debug, Clone, Default, Serialize)]
#[serde(transparent)]
pub struct ProcessingContext {
    entries: BTreeMap<String, Value>,
}

impl ProcessingContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// Writer that prefixes keys with `namespace.`.
    pub fn scope<'a>(&'a mut self, namespace: &'a str) -> ContextScope<'a> {
        ContextScope {
            namespace,
            context: self,
        }
    }

    /// Set a fully qualified key.
    pub fn set(&mut self, key: impl Into<String>, value: impl Into<Value>) {
        self.entries.insert(key.into(), value.into());
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.entries.get(key)
    }

    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.get(key).and_then(Value::as_str)
    }

    pub fn get_bool(&self, key: &str) -> Option<bool> {
        self.get(key).and_then(Value::as_bool)
    }

    pub fn get_i64(&self, key: &str) -> Option<i64> {
        self.get(key).and_then(Value::as_i64)
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.entries.contains_key(key)
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.entries.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Namespaced writer into a [`ProcessingContext`].
pub struct ContextScope<'a> {
    namespace: &'a str,
    context: &'a mut ProcessingContext,
}

impl ContextScope<'_> {
    pub fn set(&mut self, key: &str, value: impl Into<Value>) -> &mut Self {
        self.context
            .set(format!("{}.{}", self.namespace, key), value);
        self
    }
}

/// Outcome of one strategy execution.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StrategyResult {
    pub success: bool,
    pub data: Map<String, Value>,
    pub error: Option<String>,
    pub should_continue: bool,
    pub next_strategy: Option<String>,
}

impl StrategyResult {
    /// Success; the chain continues.
    pub fn ok() -> Self {
        Self {
            success: true,
            data: Map::new(),
            error: None,
            should_continue: true,
            next_strategy: None,
        }
    }

    /// Failure that aborts the chain.
    pub fn fatal(error: impl Into<String>) -> Self {
        Self {
            success: false,
            data: Map::new(),
            error: Some(error.into()),
            should_continue: false,
            next_strategy: None,
        }
    }

    /// Failure that is recorded while the chain continues.
    pub fn recoverable(error: impl Into<String>) -> Self {
        Self {
            success: false,
            data: Map::new(),
            error: Some(error.into()),
            should_continue: true,
            next_strategy: None,
        }
    }

    /// Attach a data value.
    pub fn with_data(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.data.insert(key.into(), value.into());
        self
    }

    /// Stop the chain after this strategy.
    pub fn stop(mut self) -> Self {
        self.should_continue = false;
        self
    }

    /// Resume the chain at a later strategy.
    pub fn jump_to(mut self, strategy: impl Into<String>) -> Self {
        self.next_strategy = Some(strategy.into());
        self
    }
}

/// A named, ordered stage of the processing pipeline.
///
/// `can_handle` must be cheap and free of side effects; it is called for
/// every message. `execute` never returns an error: failures are reported
/// through the [`StrategyResult`].
#[async_trait]
pub trait Strategy: Send + Sync {
    /// Unique name, used in logs, results and jumps.
    fn name(&self) -> &str;

    /// Execution order; lower runs first.
    fn order(&self) -> i32;

    /// Whether a failure here makes the whole run unsuccessful.
    fn is_critical(&self) -> bool {
        true
    }

    /// Strategies this one may name in `next_strategy`.
    fn jump_targets(&self) -> Vec<String> {
        Vec::new()
    }

    fn can_handle(&self, message: &Message) -> bool;

    async fn execute(&self, message: &Message, context: &mut ProcessingContext) -> StrategyResult;

    /// Called once before the first message.
    async fn setup(&self) -> Result<()> {
        Ok(())
    }

    /// Called once at shutdown.
    async fn teardown(&self) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_scoped_writes() {
        let mut ctx = ProcessingContext::new();
        ctx.scope("validation")
            .set("passed", true)
            .set("word_count", 4);
        ctx.scope("speech").set("audio_id", "a-1");

        assert_eq!(ctx.get_bool("validation.passed"), Some(true));
        assert_eq!(ctx.get_i64("validation.word_count"), Some(4));
        assert_eq!(ctx.get_str("speech.audio_id"), Some("a-1"));
        assert_eq!(ctx.len(), 3);
        assert_eq!(
            serde_json::to_value(&ctx).unwrap()["speech.audio_id"],
            json!("a-1")
        );
    }

    #[test]
    fn test_result_builders() {
        let ok = StrategyResult::ok().with_data("bytes", 10);
        assert!(ok.success && ok.should_continue);
        assert_eq!(ok.data["bytes"], json!(10));

        let fatal = StrategyResult::fatal("boom");
        assert!(!fatal.success && !fatal.should_continue);

        let soft = StrategyResult::recoverable("minor");
        assert!(!soft.success && soft.should_continue);

        let jump = StrategyResult::ok().jump_to("post_processing");
        assert_eq!(jump.next_strategy.as_deref(), Some("post_processing"));
        assert!(!StrategyResult::ok().stop().should_continue);
    }
}
