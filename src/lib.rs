//! Multi-phase content-generation pipeline coordinator.
//!
//! `plotweave` drives a fixed seven-phase generation workflow, from concept
//! analysis through final assembly, over pluggable per-phase [`agent::Agent`]
//! implementations. The coordinator owns:
//!
//! - a validated dependency graph and wave scheduler ([`planner`])
//! - per-phase execution with timeout, retry, and single-flight result
//!   caching ([`executor`])
//! - automated quality gating with manual override ([`quality`])
//! - human-in-the-loop review checkpoints with bounded modification rounds
//!   ([`hitl`])
//! - run state, regeneration, and resume ([`orchestrator`])
//!
//! Content generation itself, transport, and durable storage all live behind
//! traits ([`agent::Agent`], [`notify::ProgressNotifier`],
//! [`persist::Persistence`]) so the core stays embeddable.
//!
//! ```no_run
//! use plotweave::agent::AgentRegistry;
//! use plotweave::config::PipelineConfig;
//! use plotweave::orchestrator::PipelineOrchestrator;
//! use serde_json::json;
//!
//! # async fn run(registry: AgentRegistry) -> anyhow::Result<()> {
//! let orchestrator = PipelineOrchestrator::new(registry, PipelineConfig::default())?;
//! let summary = orchestrator
//!     .execute_pipeline("session-1", json!({"text": "a dragon story"}))
//!     .await?;
//! println!("completed {} phases", summary.completed_phases);
//! # Ok(())
//! # }
//! ```

pub mod agent;
pub mod cancel;
pub mod config;
pub mod errors;
pub mod executor;
pub mod hitl;
pub mod notify;
pub mod orchestrator;
pub mod persist;
pub mod phase;
pub mod planner;
pub mod quality;
