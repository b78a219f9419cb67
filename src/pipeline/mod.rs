//! Message processing pipeline: pluggable strategies run in order.

pub mod builtin;
pub mod orchestrator;
pub mod strategy;

pub use builtin::{PostProcessingStrategy, ValidationStrategy};
pub use orchestrator::{OrchestratorResult, StageOutcome, StageRecord, StrategyInfo, StrategyOrchestrator};
pub use strategy::{ContextScope, ProcessingContext, Strategy, StrategyResult};
