//! Canopy — embeddable agent runtime.
//!
//! Given a user message, Canopy drives a multi-turn loop against an LLM
//! provider, executes model-requested tool calls, persists the conversation
//! as a branching append-only session tree, and streams normalized
//! lifecycle events to the embedding application. It is mechanism, not
//! policy: no prompts, no safety rules, no UI.
//!
//! # Quick start
//!
//! ```no_run
//! use std::sync::Arc;
//! use canopy::prelude::*;
//!
//! # async fn example(adapter: Arc<dyn canopy::provider::ProviderAdapter>) -> canopy::error::Result<()> {
//! let mut adapters = AdapterRegistry::new();
//! adapters.register(adapter); // any vendor client implementing the contract
//!
//! let session = SessionManager::in_memory("/work/project");
//! let agent = Agent::new(
//!     Arc::new(adapters),
//!     session,
//!     AgentConfig::new(ModelConfig::new("anthropic", "opus-4")),
//! );
//!
//! let mut events = agent.subscribe();
//! let result = agent.send("list the files here").await?;
//! # let _ = (events.recv().await, result);
//! # Ok(())
//! # }
//! ```

pub mod agent;
pub mod agent_loop;
pub mod bus;
pub mod config;
pub mod control;
pub mod error;
pub mod prelude;
pub mod provider;
pub mod session;
pub mod tools;
pub mod types;
pub mod util;
