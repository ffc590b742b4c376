//! Nurselink chat backend library.
//!
//! Real-time messaging between patients, nurses and admins: a websocket
//! gateway, an in-process presence hub and a SQLite message history.

pub mod api;
pub mod auth;
pub mod chat;
pub mod db;
pub mod history;
