//! FinQA Orchestrator
//!
//! Multi-turn question answering over financial documents:
//! - Retrieves the closest dataset record for each question
//! - Extracts figures with a research stage backed by an LLM
//! - Hands arithmetic to a calculation stage with a restricted calculator
//! - Keeps per-session conversation history in memory
//! - Scores answers against the dataset for evaluation runs
//!
//! TURN FLOW:
//! QUERY → RESEARCH → (NEED_MATH_CALCULATION?) → CALCULATION → DONE

pub mod api;
pub mod calculator;
pub mod config;
pub mod error;
pub mod evaluation;
pub mod llm;
pub mod models;
pub mod retrieval;
pub mod session;
pub mod stages;
pub mod workflow;

pub use error::Result;

// Re-export common types
pub use config::Config;
pub use models::*;
pub use workflow::Coordinator;
