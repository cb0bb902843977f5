// SPDX-FileCopyrightText: 2026 Mantis Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Live in-memory buffer mirroring in-flight replies, keyed by request id.
//!
//! Readers get a deep copy so a concurrent step patch can never tear a
//! snapshot. Content only grows; steps are appended in first-insertion order
//! and patched in place by id.

use std::collections::HashMap;
use std::sync::RwLock;

use mantis_core::types::Step;

/// Snapshot of one in-flight reply.
#[derive(Debug, Clone, Default)]
pub struct BufferEntry {
    pub content: String,
    pub steps: Vec<Step>,
}

/// Shared stream buffer.
#[derive(Default)]
pub struct Buffer {
    data: RwLock<HashMap<String, BufferEntry>>,
}

impl Buffer {
    pub fn new() -> Self {
        Buffer::default()
    }

    /// Replaces the accumulated content for a request.
    pub fn set_content(&self, id: &str, content: String) {
        let mut data = self.data.write().unwrap();
        data.entry(id.to_string()).or_default().content = content;
    }

    /// Inserts or patches a step by id, preserving insertion order.
    pub fn set_step(&self, id: &str, step: Step) {
        let mut data = self.data.write().unwrap();
        let entry = data.entry(id.to_string()).or_default();
        if let Some(existing) = entry.steps.iter_mut().find(|s| s.id == step.id) {
            *existing = step;
        } else {
            entry.steps.push(step);
        }
    }

    /// Deep-copied snapshot of a request's entry.
    pub fn get(&self, id: &str) -> Option<BufferEntry> {
        self.data.read().unwrap().get(id).cloned()
    }

    pub fn delete(&self, id: &str) {
        self.data.write().unwrap().remove(id);
    }
}
