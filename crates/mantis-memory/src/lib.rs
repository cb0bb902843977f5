// SPDX-FileCopyrightText: 2026 Mantis Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Post-turn long-term memory extraction for user facts and per-connection
//! facts.

pub mod extractor;

pub use extractor::Extractor;
