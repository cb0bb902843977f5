// SPDX-FileCopyrightText: 2026 Mantis Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Telegram delivery: long-poll bot workers, the per-channel message handler,
//! the streaming response sink, and the fleet supervisor.

pub mod handler;
pub mod markdown;
pub mod sender;
pub mod supervisor;
pub mod worker;

pub use handler::{parse_slash_command, Reply, TelegramHandler};
pub use sender::TelegramSender;
pub use supervisor::BotSupervisor;
pub use worker::BotWorker;
