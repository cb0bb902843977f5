// SPDX-FileCopyrightText: 2026 Mantis Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! SQLite persistence for Mantis entity stores.

pub mod database;
pub mod store;

pub use database::Database;
pub use store::SqliteStore;
