//! voxqueue library root.

pub mod auth;
pub mod broker;
pub mod cli;
pub mod config;
pub mod core;
pub mod error;
pub mod logging;
pub mod pipeline;
pub mod worker;

pub use auth::{AuthError, AuthTokenCache, CredentialIssuer, Credentials, Token};
pub use broker::{Acknowledger, BrokerConsumer, Delivery, DeliveryHandle};
pub use cli::Commands;
pub use config::{load_settings, load_settings_or_default, Settings};
pub use crate::core::{Message, Priority, PriorityQueue, QueueStats};
pub use error::{Error, Result};
pub use pipeline::{OrchestratorResult, ProcessingContext, Strategy, StrategyOrchestrator, StrategyResult};
pub use worker::{FailureClassifier, PoolStats, WorkerPool};
