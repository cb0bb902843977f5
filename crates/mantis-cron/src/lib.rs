// SPDX-FileCopyrightText: 2026 Mantis Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Scheduled prompts: schedule parsing, the reconciling dispatcher, and job
//! execution through the request pipeline.

pub mod schedule;
pub mod scheduler;

pub use schedule::{parse_schedule, ScheduleSpec};
pub use scheduler::{CronApp, Dispatcher};
