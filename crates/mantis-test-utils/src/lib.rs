// SPDX-FileCopyrightText: 2026 Mantis Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Test doubles shared across the workspace: an in-memory entity store and a
//! scripted LLM for deterministic agent-loop tests.

pub mod memory_store;
pub mod scripted_llm;

pub use memory_store::MemoryStore;
pub use scripted_llm::ScriptedLlm;
