//! Runs the ordered strategy chain for one message at a time.

use futures::FutureExt;
use serde::Serialize;
use std::any::Any;
use std::collections::{HashMap, HashSet};
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::OnceCell;

use crate::core::Message;
use crate::error::{Error, Result};

use super::strategy::{ProcessingContext, Strategy, StrategyResult};

/// What happened to one strategy during a run.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum StageOutcome {
    /// `can_handle` returned false
    Skipped,
    Executed(StrategyResult),
}

#[derive(Debug, Clone, Serialize)]
pub struct StageRecord {
    pub strategy: String,
    pub order: i32,
    pub critical: bool,
    #[serde(flatten)]
    pub outcome: StageOutcome,
    pub elapsed_ms: f64,
}

impl StageRecord {
    pub fn result(&self) -> Option<&StrategyResult> {
        match &self.outcome {
            StageOutcome::Executed(result) => Some(result),
            StageOutcome::Skipped => None,
        }
    }

    pub fn is_skipped(&self) -> bool {
        matches!(self.outcome, StageOutcome::Skipped)
    }
}

/// Aggregate outcome of one message's run.
#[derive(Debug, Clone, Serialize)]
pub struct OrchestratorResult {
    pub message_id: String,
    pub success: bool,
    /// A stage stopped the chain with a failure
    pub aborted: bool,
    pub stages: Vec<StageRecord>,
    pub context: ProcessingContext,
    pub elapsed_ms: f64,
}

impl OrchestratorResult {
    /// Names of the strategies that executed, in execution order.
    pub fn executed(&self) -> Vec<&str> {
        self.stages
            .iter()
            .filter(|stage| !stage.is_skipped())
            .map(|stage| stage.strategy.as_str())
            .collect()
    }

    /// Executed stages that reported failure.
    pub fn failures(&self) -> impl Iterator<Item = (&str, &StrategyResult)> {
        self.stages.iter().filter_map(|stage| match stage.result() {
            Some(result) if !result.success => Some((stage.strategy.as_str(), result)),
            _ => None,
        })
    }

    /// Error text of every failed stage.
    pub fn errors(&self) -> Vec<&str> {
        self.failures()
            .filter_map(|(_, result)| result.error.as_deref())
            .collect()
    }

    pub fn stage(&self, name: &str) -> Option<&StageRecord> {
        self.stages.iter().find(|stage| stage.strategy == name)
    }
}

/// Registered strategy summary.
#[derive(Debug, Clone, Serialize)]
pub struct StrategyInfo {
    pub name: String,
    pub order: i32,
    pub critical: bool,
}

/// Executes the sorted strategy chain against messages.
pub struct StrategyOrchestrator {
    /// Sorted by order, ties in registration sequence
    strategies: Vec<Arc<dyn Strategy>>,
    positions: HashMap<String, usize>,
    initialized: OnceCell<()>,
    torn_down: AtomicBool,
}

impl StrategyOrchestrator {
    /// Build from every supplied strategy.
    pub fn new(strategies: Vec<Arc<dyn Strategy>>) -> Result<Self> {
        Self::with_enabled(strategies, &HashMap::new())
    }

    /// Build, leaving out strategies whose flag is `false`.
    ///
    /// Strategies without a flag are enabled. Fails on duplicate names and on
    /// declared jump targets that are unknown, disabled or not later in the
    /// sorted chain.
    pub fn with_enabled(
        strategies: Vec<Arc<dyn Strategy>>,
        enabled: &HashMap<String, bool>,
    ) -> Result<Self> {
        let mut seen = HashSet::new();
        for strategy in &strategies {
            if !seen.insert(strategy.name().to_string()) {
                return Err(Error::Config(format!(
                    "Duplicate strategy name '{}'",
                    strategy.name()
                )));
            }
        }

        let (mut active, disabled): (Vec<_>, Vec<_>) = strategies
            .into_iter()
            .partition(|s| enabled.get(s.name()).copied().unwrap_or(true));
        for strategy in &disabled {
            tracing::info!(strategy = strategy.name(), "Strategy disabled by configuration");
        }

        // Stable: equal orders keep registration sequence.
        active.sort_by_key(|s| s.order());

        let positions: HashMap<String, usize> = active
            .iter()
            .enumerate()
            .map(|(i, s)| (s.name().to_string(), i))
            .collect();

        for (i, strategy) in active.iter().enumerate() {
            for target in strategy.jump_targets() {
                match positions.get(&target) {
                    Some(&j) if j > i => {}
                    Some(_) => {
                        return Err(Error::Config(format!(
                            "Strategy '{}' declares jump to '{}', which does not run after it",
                            strategy.name(),
                            target
                        )))
                    }
                    None if disabled.iter().any(|d| d.name() == target) => {
                        return Err(Error::Config(format!(
                            "Strategy '{}' declares jump to disabled strategy '{}'",
                            strategy.name(),
                            target
                        )))
                    }
                    None => {
                        return Err(Error::Config(format!(
                            "Strategy '{}' declares jump to unknown strategy '{}'",
                            strategy.name(),
                            target
                        )))
                    }
                }
            }
        }

        tracing::info!("Strategy orchestrator initialized with {} strategies", active.len());
        for strategy in &active {
            tracing::info!("  - {} (order: {})", strategy.name(), strategy.order());
        }

        Ok(Self {
            strategies: active,
            positions,
            initialized: OnceCell::new(),
            torn_down: AtomicBool::new(false),
        })
    }

    /// Run every strategy's `setup` once. Later calls are no-ops.
    pub async fn setup_all(&self) -> Result<()> {
        self.initialized
            .get_or_try_init(|| async {
                tracing::info!("Initializing all strategies...");
                for strategy in &self.strategies {
                    strategy.setup().await.map_err(|e| Error::Strategy {
                        name: strategy.name().to_string(),
                        message: format!("setup failed: {}", e),
                    })?;
                }
                tracing::info!("All strategies initialized");
                Ok::<(), Error>(())
            })
            .await?;
        Ok(())
    }

    /// Run every strategy's `teardown` once.
    ///
    /// A failing teardown is logged and does not stop the others. Returns the
    /// number of failures.
    pub async fn teardown_all(&self) -> usize {
        if self.torn_down.swap(true, Ordering::AcqRel) {
            return 0;
        }

        tracing::info!("Cleaning up all strategies...");
        let mut failures = 0;
        for strategy in &self.strategies {
            if let Err(e) = strategy.teardown().await {
                failures += 1;
                tracing::error!(strategy = strategy.name(), "Strategy teardown failed: {}", e);
            }
        }
        tracing::info!(failures, "All strategies cleaned up");
        failures
    }

    /// Drive one message through the chain.
    pub async fn run(&self, message: &Message) -> OrchestratorResult {
        let started = Instant::now();
        let mut context = ProcessingContext::new();
        let mut stages = Vec::with_capacity(self.strategies.len());
        let mut success = true;
        let mut aborted = false;

        tracing::info!(message_id = %message.id, "Starting orchestrated processing");

        let mut index = 0;
        while index < self.strategies.len() {
            let strategy = &self.strategies[index];

            if !strategy.can_handle(message) {
                tracing::debug!(strategy = strategy.name(), "Strategy cannot handle message, skipping");
                stages.push(StageRecord {
                    strategy: strategy.name().to_string(),
                    order: strategy.order(),
                    critical: strategy.is_critical(),
                    outcome: StageOutcome::Skipped,
                    elapsed_ms: 0.0,
                });
                index += 1;
                continue;
            }

            tracing::info!(strategy = strategy.name(), "Executing strategy");
            let stage_started = Instant::now();
            let mut result = match AssertUnwindSafe(strategy.execute(message, &mut context))
                .catch_unwind()
                .await
            {
                Ok(result) => result,
                Err(payload) => {
                    let reason = panic_reason(&*payload);
                    tracing::error!(strategy = strategy.name(), %reason, "Strategy panicked");
                    StrategyResult::fatal(format!("Strategy {} panicked: {}", strategy.name(), reason))
                }
            };
            let elapsed = stage_started.elapsed();

            let mut jump = None;
            if result.should_continue {
                if let Some(target) = result.next_strategy.as_deref() {
                    match self.resolve_jump(index, strategy.as_ref(), target) {
                        Ok(position) => jump = Some(position),
                        Err(reason) => {
                            tracing::error!(strategy = strategy.name(), "{}", reason);
                            result.success = false;
                            result.should_continue = false;
                            result.error = Some(reason);
                            success = false;
                        }
                    }
                }
            }

            tracing::info!(
                strategy = strategy.name(),
                success = result.success,
                elapsed_ms = as_millis(elapsed),
                "Strategy completed"
            );

            if !result.success && strategy.is_critical() {
                success = false;
            }
            let should_continue = result.should_continue;
            if !result.success && !should_continue {
                aborted = true;
                success = false;
            }

            stages.push(StageRecord {
                strategy: strategy.name().to_string(),
                order: strategy.order(),
                critical: strategy.is_critical(),
                outcome: StageOutcome::Executed(result),
                elapsed_ms: as_millis(elapsed),
            });

            if !should_continue {
                tracing::info!(strategy = strategy.name(), "Strategy requested to stop processing chain");
                break;
            }

            match jump {
                Some(position) => {
                    tracing::info!(next = self.strategies[position].name(), "Jumping to strategy");
                    index = position;
                }
                None => index += 1,
            }
        }

        let elapsed = started.elapsed();
        tracing::info!(
            message_id = %message.id,
            success,
            stages = stages.iter().filter(|s| !s.is_skipped()).count(),
            elapsed_ms = as_millis(elapsed),
            "Orchestration completed"
        );

        OrchestratorResult {
            message_id: message.id.clone(),
            success,
            aborted,
            stages,
            context,
            elapsed_ms: as_millis(elapsed),
        }
    }

    fn resolve_jump(
        &self,
        current: usize,
        strategy: &dyn Strategy,
        target: &str,
    ) -> std::result::Result<usize, String> {
        if !strategy.jump_targets().iter().any(|t| t == target) {
            return Err(format!(
                "Strategy '{}' jumped to undeclared target '{}'",
                strategy.name(),
                target
            ));
        }
        match self.positions.get(target) {
            Some(&position) if position > current => Ok(position),
            Some(_) => Err(format!(
                "Strategy '{}' jumped backward to '{}'",
                strategy.name(),
                target
            )),
            None => Err(format!(
                "Strategy '{}' jumped to unknown strategy '{}'",
                strategy.name(),
                target
            )),
        }
    }

    /// Registered strategies in execution order.
    pub fn strategies(&self) -> Vec<StrategyInfo> {
        self.strategies
            .iter()
            .map(|s| StrategyInfo {
                name: s.name().to_string(),
                order: s.order(),
                critical: s.is_critical(),
            })
            .collect()
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Strategy>> {
        self.positions
            .get(name)
            .map(|&i| Arc::clone(&self.strategies[i]))
    }

    pub fn len(&self) -> usize {
        self.strategies.len()
    }

    pub fn is_empty(&self) -> bool {
        self.strategies.is_empty()
    }
}

fn as_millis(d: Duration) -> f64 {
    d.as_secs_f64() * 1000.0
}

fn panic_reason(payload: &(dyn Any + Send)) -> String {
    if let Some(reason) = payload.downcast_ref::<&str>() {
        reason.to_string()
    } else if let Some(reason) = payload.downcast_ref::<String>() {
        reason.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Mutex;

    type Behavior = Box<dyn Fn(&Message, &mut ProcessingContext) -> StrategyResult + Send + Sync>;

    /// Scripted strategy that records its calls into a shared log.
    struct Scripted {
        name: String,
        order: i32,
        critical: bool,
        handles: bool,
        targets: Vec<String>,
        behavior: Behavior,
        log: Arc<Mutex<Vec<String>>>,
        setups: AtomicUsize,
        fail_teardown: bool,
        teardowns: Arc<AtomicUsize>,
    }

    impl Scripted {
        fn new(name: &str, order: i32, log: &Arc<Mutex<Vec<String>>>) -> Self {
            Self {
                name: name.to_string(),
                order,
                critical: true,
                handles: true,
                targets: Vec::new(),
                behavior: Box::new(|_: &Message, _: &mut ProcessingContext| StrategyResult::ok()),
                log: log.clone(),
                setups: AtomicUsize::new(0),
                fail_teardown: false,
                teardowns: Arc::new(AtomicUsize::new(0)),
            }
        }

        fn returning(mut self, f: impl Fn(&Message, &mut ProcessingContext) -> StrategyResult + Send + Sync + 'static) -> Self {
            self.behavior = Box::new(f);
            self
        }

        fn declining(mut self) -> Self {
            self.handles = false;
            self
        }

        fn non_critical(mut self) -> Self {
            self.critical = false;
            self
        }

        fn jumps_to(mut self, target: &str) -> Self {
            self.targets.push(target.to_string());
            self
        }
    }

    #[async_trait]
    impl Strategy for Scripted {
        fn name(&self) -> &str {
            &self.name
        }

        fn order(&self) -> i32 {
            self.order
        }

        fn is_critical(&self) -> bool {
            self.critical
        }

        fn jump_targets(&self) -> Vec<String> {
            self.targets.clone()
        }

        fn can_handle(&self, _message: &Message) -> bool {
            self.handles
        }

        async fn execute(&self, message: &Message, context: &mut ProcessingContext) -> StrategyResult {
            self.log.lock().unwrap().push(self.name.clone());
            (self.behavior)(message, context)
        }

        async fn setup(&self) -> Result<()> {
            self.setups.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        async fn teardown(&self) -> Result<()> {
            self.teardowns.fetch_add(1, Ordering::SeqCst);
            if self.fail_teardown {
                return Err(Error::Other(format!("{} teardown exploded", self.name)));
            }
            Ok(())
        }
    }

    fn message() -> Message {
        Message::new("speech.created", json!({ "speechDto": { "original_text": "hi" } }))
    }

    fn log() -> Arc<Mutex<Vec<String>>> {
        Arc::new(Mutex::new(Vec::new()))
    }

    fn calls(log: &Arc<Mutex<Vec<String>>>) -> Vec<String> {
        log.lock().unwrap().clone()
    }

    #[tokio::test]
    async fn test_runs_in_order_with_stable_ties() {
        let log = log();
        let orchestrator = StrategyOrchestrator::new(vec![
            Arc::new(Scripted::new("c", 30, &log)),
            Arc::new(Scripted::new("a", 10, &log)),
            Arc::new(Scripted::new("b1", 20, &log)),
            Arc::new(Scripted::new("b2", 20, &log)),
        ])
        .unwrap();

        let result = orchestrator.run(&message()).await;

        assert!(result.success);
        assert!(!result.aborted);
        assert_eq!(calls(&log), vec!["a", "b1", "b2", "c"]);
        assert_eq!(result.executed(), vec!["a", "b1", "b2", "c"]);
        let orders: Vec<i32> = result.stages.iter().map(|s| s.order).collect();
        assert!(orders.windows(2).all(|w| w[0] <= w[1]));
    }

    #[tokio::test]
    async fn test_fatal_failure_aborts_chain() {
        let log = log();
        let orchestrator = StrategyOrchestrator::new(vec![
            Arc::new(Scripted::new("A", 10, &log)),
            Arc::new(Scripted::new("B", 20, &log).returning(|_, _| StrategyResult::fatal("engine down"))),
            Arc::new(Scripted::new("C", 30, &log)),
        ])
        .unwrap();

        let result = orchestrator.run(&message()).await;

        assert!(!result.success);
        assert!(result.aborted);
        assert_eq!(calls(&log), vec!["A", "B"]);
        assert!(result.stage("C").is_none());
        assert_eq!(result.errors(), vec!["engine down"]);
    }

    #[tokio::test]
    async fn test_panicking_strategy_is_a_fatal_failure() {
        let log = log();
        let orchestrator = StrategyOrchestrator::new(vec![
            Arc::new(Scripted::new("A", 10, &log).returning(|_, _| panic!("tts blew up"))),
            Arc::new(Scripted::new("B", 20, &log)),
        ])
        .unwrap();

        let result = orchestrator.run(&message()).await;

        assert!(!result.success);
        assert!(result.aborted);
        assert_eq!(calls(&log), vec!["A"]);
        assert_eq!(result.errors(), vec!["Strategy A panicked: tts blew up"]);
    }

    #[tokio::test]
    async fn test_declined_strategy_is_skipped_not_failed() {
        let log = log();
        let orchestrator = StrategyOrchestrator::new(vec![
            Arc::new(Scripted::new("a", 10, &log)),
            Arc::new(Scripted::new("words", 20, &log).declining()),
            Arc::new(Scripted::new("c", 30, &log)),
        ])
        .unwrap();

        let result = orchestrator.run(&message()).await;

        assert!(result.success);
        assert_eq!(calls(&log), vec!["a", "c"]);
        assert!(result.stage("words").unwrap().is_skipped());
        assert_eq!(result.failures().count(), 0);
    }

    #[tokio::test]
    async fn test_recoverable_failure_continues() {
        let log = log();
        let orchestrator = StrategyOrchestrator::new(vec![
            Arc::new(Scripted::new("a", 10, &log).returning(|_, _| StrategyResult::recoverable("minor"))),
            Arc::new(Scripted::new("b", 20, &log)),
        ])
        .unwrap();

        let result = orchestrator.run(&message()).await;

        assert_eq!(calls(&log), vec!["a", "b"]);
        assert!(!result.aborted);
        // A critical stage failed, so the run as a whole did not succeed.
        assert!(!result.success);
    }

    #[tokio::test]
    async fn test_non_critical_failure_keeps_success() {
        let log = log();
        let orchestrator = StrategyOrchestrator::new(vec![
            Arc::new(Scripted::new("a", 10, &log)),
            Arc::new(
                Scripted::new("notify", 200, &log)
                    .non_critical()
                    .returning(|_, _| StrategyResult::recoverable("webhook timeout")),
            ),
        ])
        .unwrap();

        let result = orchestrator.run(&message()).await;

        assert!(result.success);
        assert_eq!(result.failures().count(), 1);
    }

    #[tokio::test]
    async fn test_successful_stop_ends_chain() {
        let log = log();
        let orchestrator = StrategyOrchestrator::new(vec![
            Arc::new(Scripted::new("a", 10, &log).returning(|_, _| StrategyResult::ok().stop())),
            Arc::new(Scripted::new("b", 20, &log)),
        ])
        .unwrap();

        let result = orchestrator.run(&message()).await;

        assert!(result.success);
        assert!(!result.aborted);
        assert_eq!(calls(&log), vec!["a"]);
    }

    #[tokio::test]
    async fn test_forward_jump() {
        let log = log();
        let orchestrator = StrategyOrchestrator::new(vec![
            Arc::new(
                Scripted::new("validation", 10, &log)
                    .jumps_to("post")
                    .returning(|_, _| StrategyResult::ok().jump_to("post")),
            ),
            Arc::new(Scripted::new("speech", 100, &log)),
            Arc::new(Scripted::new("post", 200, &log)),
        ])
        .unwrap();

        let result = orchestrator.run(&message()).await;

        assert!(result.success);
        assert_eq!(calls(&log), vec!["validation", "post"]);
    }

    #[tokio::test]
    async fn test_undeclared_runtime_jump_aborts() {
        let log = log();
        let orchestrator = StrategyOrchestrator::new(vec![
            Arc::new(Scripted::new("a", 10, &log).returning(|_, _| StrategyResult::ok().jump_to("c"))),
            Arc::new(Scripted::new("b", 20, &log)),
            Arc::new(Scripted::new("c", 30, &log)),
        ])
        .unwrap();

        let result = orchestrator.run(&message()).await;

        assert!(!result.success);
        assert!(result.aborted);
        assert_eq!(calls(&log), vec!["a"]);
        assert!(result.errors()[0].contains("undeclared"));
    }

    #[test]
    fn test_invalid_declared_jumps_rejected() {
        let log = log();

        let backward = StrategyOrchestrator::new(vec![
            Arc::new(Scripted::new("a", 10, &log)),
            Arc::new(Scripted::new("b", 20, &log).jumps_to("a")),
        ]);
        assert!(matches!(backward, Err(Error::Config(_))));

        let unknown = StrategyOrchestrator::new(vec![Arc::new(
            Scripted::new("a", 10, &log).jumps_to("nowhere"),
        )]);
        assert!(matches!(unknown, Err(Error::Config(_))));

        let mut flags = HashMap::new();
        flags.insert("b".to_string(), false);
        let disabled = StrategyOrchestrator::with_enabled(
            vec![
                Arc::new(Scripted::new("a", 10, &log).jumps_to("b")),
                Arc::new(Scripted::new("b", 20, &log)),
            ],
            &flags,
        );
        match disabled {
            Err(Error::Config(msg)) => assert!(msg.contains("disabled")),
            other => panic!("expected config error, got {:?}", other.map(|o| o.len())),
        }
    }

    #[test]
    fn test_duplicate_names_rejected() {
        let log = log();
        let result = StrategyOrchestrator::new(vec![
            Arc::new(Scripted::new("a", 10, &log)),
            Arc::new(Scripted::new("a", 20, &log)),
        ]);
        assert!(matches!(result, Err(Error::Config(_))));
    }

    #[tokio::test]
    async fn test_enable_flags_filter_strategies() {
        let log = log();
        let mut flags = HashMap::new();
        flags.insert("transcription".to_string(), false);
        let orchestrator = StrategyOrchestrator::with_enabled(
            vec![
                Arc::new(Scripted::new("validation", 10, &log)),
                Arc::new(Scripted::new("transcription", 150, &log)),
            ],
            &flags,
        )
        .unwrap();

        assert_eq!(orchestrator.len(), 1);
        assert!(orchestrator.get("transcription").is_none());
        orchestrator.run(&message()).await;
        assert_eq!(calls(&log), vec!["validation"]);
    }

    #[tokio::test]
    async fn test_context_flows_between_stages() {
        let log = log();
        let orchestrator = StrategyOrchestrator::new(vec![
            Arc::new(Scripted::new("validation", 10, &log).returning(|_, ctx| {
                ctx.scope("validation").set("passed", true);
                StrategyResult::ok()
            })),
            Arc::new(Scripted::new("speech", 100, &log).returning(|_, ctx| {
                if ctx.get_bool("validation.passed") == Some(true) {
                    ctx.scope("speech").set("audio_id", "aud-1");
                    StrategyResult::ok()
                } else {
                    StrategyResult::fatal("validation did not run")
                }
            })),
        ])
        .unwrap();

        let result = orchestrator.run(&message()).await;

        assert!(result.success);
        assert_eq!(result.context.get_str("speech.audio_id"), Some("aud-1"));
        let json = serde_json::to_value(&result).unwrap();
        assert_eq!(json["stages"][0]["status"], json!("executed"));
    }

    #[tokio::test]
    async fn test_lifecycle_hooks() {
        crate::logging::init_test();
        let log = log();
        let a = Arc::new(Scripted::new("a", 10, &log));
        let mut failing = Scripted::new("b", 20, &log);
        failing.fail_teardown = true;
        let b = Arc::new(failing);
        let c = Arc::new(Scripted::new("c", 30, &log));

        let strategies: Vec<Arc<dyn Strategy>> = vec![a.clone(), b.clone(), c.clone()];
        let orchestrator = StrategyOrchestrator::new(strategies).unwrap();

        orchestrator.setup_all().await.unwrap();
        orchestrator.setup_all().await.unwrap();
        assert_eq!(a.setups.load(Ordering::SeqCst), 1);
        assert_eq!(c.setups.load(Ordering::SeqCst), 1);

        assert_eq!(orchestrator.teardown_all().await, 1);
        assert_eq!(orchestrator.teardown_all().await, 0);
        // b's failure did not stop c.
        assert_eq!(c.teardowns.load(Ordering::SeqCst), 1);
        assert_eq!(b.teardowns.load(Ordering::SeqCst), 1);
    }
}
