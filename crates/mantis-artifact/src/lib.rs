// SPDX-FileCopyrightText: 2026 Mantis Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Short-lived in-memory artifacts: per-session TTL'd blob cache with a
//! delivery queue, plus the process-wide session manager.

pub mod manager;
pub mod store;

pub use manager::ArtifactManager;
pub use store::{
    inline_preview, Artifact, ArtifactMeta, ArtifactStats, ArtifactStore, OutgoingArtifact,
    DEFAULT_MAX_FILE_BYTES, DEFAULT_MAX_TOTAL_BYTES, DEFAULT_TTL,
};
