//! Vehicle reservation core: a conflict-free availability index and reservation
//! lifecycle backed by a write-ahead log, plus scheduled batch mailings and trip
//! reminders, served over the PostgreSQL wire protocol.

pub mod app;
pub mod auth;
pub mod clock;
pub mod config;
pub mod engine;
pub mod limits;
pub mod mailer;
pub mod model;
pub mod notify;
pub mod observability;
pub mod reaper;
pub mod reminder;
pub mod sql;
pub mod tls;
pub mod wal;
pub mod wire;
