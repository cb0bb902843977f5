// SPDX-FileCopyrightText: 2026 Mantis Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Per-session in-memory artifact store with a delivery queue.
//!
//! Artifacts are never persisted; they expire after a TTL. One internal lock
//! covers items, total size, and the outgoing queue, and every public
//! operation prunes expired entries first.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use base64::Engine;
use mantis_core::MantisError;
use serde::Serialize;
use sha2::{Digest, Sha256};
use uuid::Uuid;

/// Per-file size limit for temporary artifacts.
pub const DEFAULT_MAX_FILE_BYTES: u64 = 10 * 1024 * 1024;

/// Soft cap for all artifacts in one session. Keeps memory bounded even if
/// the model accumulates multiple files.
pub const DEFAULT_MAX_TOTAL_BYTES: u64 = 50 * 1024 * 1024;

/// How long artifacts are kept in memory.
pub const DEFAULT_TTL: Duration = Duration::from_secs(30 * 60);

/// A stored blob.
#[derive(Debug, Clone)]
pub struct Artifact {
    pub id: String,
    pub name: String,
    pub format: String,
    pub mime: String,
    pub bytes: Vec<u8>,
    pub size_bytes: u64,
    pub sha256: String,
    created: Instant,
}

/// Public metadata of an artifact (no payload).
#[derive(Debug, Clone, Serialize)]
pub struct ArtifactMeta {
    pub id: String,
    pub name: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub format: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub mime: String,
    pub size_bytes: u64,
    pub sha256: String,
}

/// One queued delivery under a request id.
#[derive(Debug, Clone, Serialize)]
pub struct OutgoingArtifact {
    pub artifact_id: String,
    pub file_name: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub caption: String,
}

/// Store counters for manager cleanup decisions.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ArtifactStats {
    pub count: usize,
    pub total_bytes: u64,
    pub outgoing: usize,
}

#[derive(Default)]
struct Inner {
    total_bytes: u64,
    items: HashMap<String, Artifact>,
    outgoing: HashMap<String, Vec<OutgoingArtifact>>,
}

/// A per-session artifact store.
pub struct ArtifactStore {
    pub max_file_bytes: u64,
    pub max_total_bytes: u64,
    pub ttl: Duration,
    inner: Mutex<Inner>,
}

impl Default for ArtifactStore {
    fn default() -> Self {
        Self::new()
    }
}

impl ArtifactStore {
    pub fn new() -> Self {
        ArtifactStore {
            max_file_bytes: DEFAULT_MAX_FILE_BYTES,
            max_total_bytes: DEFAULT_MAX_TOTAL_BYTES,
            ttl: DEFAULT_TTL,
            inner: Mutex::new(Inner::default()),
        }
    }

    /// Stores a blob and returns its metadata. Fails when the blob exceeds
    /// the per-file limit or would exceed the session total.
    pub fn put(&self, name: &str, data: Vec<u8>, mime: &str) -> Result<ArtifactMeta, MantisError> {
        let name = if name.is_empty() { "artifact" } else { name };
        let size = data.len() as u64;
        if size > self.max_file_bytes {
            return Err(MantisError::Validation(format!(
                "artifact {name:?} too large: {size} bytes (max {})",
                self.max_file_bytes
            )));
        }

        let mut format = format_from_name(name);
        if format.is_empty() {
            format = format_from_mime(mime).to_string();
        }
        let sha256 = format!("{:x}", Sha256::digest(&data));
        let artifact = Artifact {
            id: Uuid::new_v4().to_string(),
            name: name.to_string(),
            format,
            mime: mime.to_string(),
            size_bytes: size,
            sha256,
            bytes: data,
            created: Instant::now(),
        };

        let mut inner = self.inner.lock().unwrap();
        self.prune_locked(&mut inner);
        if self.max_total_bytes > 0 && inner.total_bytes + size > self.max_total_bytes {
            return Err(MantisError::Validation(format!(
                "artifact store total size exceeded: {} + {size} > {}",
                inner.total_bytes, self.max_total_bytes
            )));
        }
        let meta = meta_of(&artifact);
        inner.total_bytes += size;
        inner.items.insert(artifact.id.clone(), artifact);
        Ok(meta)
    }

    pub fn get(&self, id: &str) -> Option<Artifact> {
        let mut inner = self.inner.lock().unwrap();
        self.prune_locked(&mut inner);
        inner.items.get(id).cloned()
    }

    /// All live artifacts, sorted by name.
    pub fn list(&self) -> Vec<ArtifactMeta> {
        let mut inner = self.inner.lock().unwrap();
        self.prune_locked(&mut inner);
        let mut out: Vec<ArtifactMeta> = inner.items.values().map(meta_of).collect();
        out.sort_by(|a, b| a.name.cmp(&b.name));
        out
    }

    /// Queues an artifact for delivery under `request_id`.
    pub fn mark_to_send(
        &self,
        request_id: &str,
        artifact_id: &str,
        file_name: &str,
        caption: &str,
    ) -> Result<(), MantisError> {
        if request_id.is_empty() {
            return Err(MantisError::Validation("request_id is required".into()));
        }
        if artifact_id.is_empty() {
            return Err(MantisError::Validation("artifact_id is required".into()));
        }
        let mut inner = self.inner.lock().unwrap();
        self.prune_locked(&mut inner);
        let Some(artifact) = inner.items.get(artifact_id) else {
            return Err(MantisError::NotFound(format!(
                "unknown artifact_id: {artifact_id}"
            )));
        };
        let file_name = if file_name.is_empty() {
            artifact.name.clone()
        } else {
            file_name.to_string()
        };
        inner
            .outgoing
            .entry(request_id.to_string())
            .or_default()
            .push(OutgoingArtifact {
                artifact_id: artifact_id.to_string(),
                file_name,
                caption: caption.to_string(),
            });
        Ok(())
    }

    /// Reads the outgoing queue without draining it.
    pub fn outgoing(&self, request_id: &str) -> Vec<OutgoingArtifact> {
        let mut inner = self.inner.lock().unwrap();
        self.prune_locked(&mut inner);
        inner.outgoing.get(request_id).cloned().unwrap_or_default()
    }

    /// Drains the outgoing queue for one request.
    pub fn take_outgoing(&self, request_id: &str) -> Vec<OutgoingArtifact> {
        let mut inner = self.inner.lock().unwrap();
        self.prune_locked(&mut inner);
        inner.outgoing.remove(request_id).unwrap_or_default()
    }

    pub fn stats(&self) -> ArtifactStats {
        let mut inner = self.inner.lock().unwrap();
        self.prune_locked(&mut inner);
        ArtifactStats {
            count: inner.items.len(),
            total_bytes: inner.total_bytes,
            outgoing: inner.outgoing.values().map(Vec::len).sum(),
        }
    }

    /// Drops expired artifacts, then drops queued deliveries referencing
    /// now-missing artifacts. Idempotent.
    pub fn prune_expired(&self) {
        let mut inner = self.inner.lock().unwrap();
        self.prune_locked(&mut inner);
    }

    fn prune_locked(&self, inner: &mut Inner) {
        if self.ttl.is_zero() || (inner.items.is_empty() && inner.outgoing.is_empty()) {
            return;
        }
        let now = Instant::now();
        let ttl = self.ttl;
        let mut freed: u64 = 0;
        inner.items.retain(|_, artifact| {
            if now.duration_since(artifact.created) > ttl {
                freed += artifact.size_bytes;
                false
            } else {
                true
            }
        });
        inner.total_bytes = inner.total_bytes.saturating_sub(freed);

        let items = &inner.items;
        inner.outgoing.retain(|_, queued| {
            queued.retain(|o| items.contains_key(&o.artifact_id));
            !queued.is_empty()
        });
    }
}

/// Binary-safe preview: text when the prefix is valid UTF-8 without NULs,
/// otherwise a short base64 prefix.
pub fn inline_preview(artifact: &Artifact, max_bytes: usize) -> String {
    let max_bytes = if max_bytes == 0 { 8 * 1024 } else { max_bytes };
    if artifact.bytes.is_empty() {
        return String::new();
    }
    let slice = &artifact.bytes[..artifact.bytes.len().min(max_bytes)];

    let looks_binary = slice.contains(&0) || std::str::from_utf8(slice).is_err();
    if looks_binary {
        const MAX_B64: usize = 2048;
        let mut encoded = base64::engine::general_purpose::STANDARD.encode(slice);
        if encoded.len() > MAX_B64 {
            encoded.truncate(MAX_B64);
            encoded.push_str("...(truncated)");
        }
        return format!("[binary preview: base64]\n{encoded}");
    }

    let mut text = String::from_utf8_lossy(slice).into_owned();
    if artifact.bytes.len() > max_bytes {
        text.push_str("\n...(truncated)");
    }
    text
}

fn meta_of(artifact: &Artifact) -> ArtifactMeta {
    ArtifactMeta {
        id: artifact.id.clone(),
        name: artifact.name.clone(),
        format: artifact.format.clone(),
        mime: artifact.mime.clone(),
        size_bytes: artifact.size_bytes,
        sha256: artifact.sha256.clone(),
    }
}

fn format_from_name(name: &str) -> String {
    let base = name.rsplit('/').next().unwrap_or(name);
    match base.rsplit_once('.') {
        Some((stem, ext)) if !stem.is_empty() && !ext.is_empty() => ext.to_lowercase(),
        _ => String::new(),
    }
}

fn format_from_mime(mime: &str) -> &'static str {
    let mime = mime.split(';').next().unwrap_or("").trim().to_lowercase();
    match mime.as_str() {
        "text/plain" => "txt",
        "application/json" => "json",
        "text/markdown" => "md",
        "image/png" => "png",
        "image/jpeg" => "jpg",
        "image/webp" => "webp",
        "audio/mpeg" => "mp3",
        "audio/mp4" => "m4a",
        "audio/ogg" => "ogg",
        "audio/wav" | "audio/x-wav" => "wav",
        _ => "",
    }
}
