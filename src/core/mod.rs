//! Core module - messages and the priority queue.
//!
//! This module contains the heart of voxqueue's scheduling:
//! - Message and priority types
//! - Bounded in-memory priority queue

pub mod message;
pub mod queue;

pub use message::{Message, Priority, QueuedEntry};
pub use queue::{PriorityQueue, QueueStats};
