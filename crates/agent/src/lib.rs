//! Agent Runtime - conversational tool orchestration for the shop assistant
//!
//! This crate turns one customer message into one reply:
//! - Extracts typed entities (prices, brands, order ids, sentiment) from free text
//! - Plans which shop tools to call, validated against the tool registry
//! - Executes the plan under rate limits, timeouts, retries and a result cache
//! - Synthesizes a reply grounded only in successful tool results
//! - Decides when the conversation should be handed to a human
//!
//! # Architecture
//!
//! Each turn moves through fixed stages, checkpointed as it goes:
//! 1. **Extraction** (`extractor`) - pattern and model strategies merged per label
//! 2. **Planning** (`planner`) - one structured completion, one stricter retry
//! 3. **Execution** (`executor`) - dependency levels, concurrency lanes, retry policy
//! 4. **Synthesis** (`synthesizer`) - template or model reply, failures acknowledged
//! 5. **Escalation** (`escalation`) - first matching rule wins
//!
//! # Key Types
//!
//! - `AgentRuntime` - turn orchestrator (see `runtime` module)
//! - `LlmClient` - pluggable completion provider (OpenAI-compatible, Ollama, offline)
//! - `ToolRegistry` - the catalogue of callable shop tools
//!
//! # Safety Principle
//!
//! The model never answers from memory. Products, prices, orders and policies
//! in a reply come from tool results; a failed lookup is said out loud.

pub mod cache;
pub mod demo;
pub mod escalation;
pub mod executor;
pub mod extractor;
pub mod llm;
pub mod planner;
pub mod rate_limit;
pub mod runtime;
pub mod synthesizer;
pub mod tools;
