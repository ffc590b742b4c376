//! Real-time chat between patients, nurses and admins.
//!
//! ## Architecture
//!
//! ```text
//! client ──ws──► gateway ──► Connection ──commands──► HubDispatcher
//!                              ▲   │                      │
//!                              │   └── read pump          │ try_send
//!                              └────── write pump ◄── outbound queue
//! ```
//!
//! - The gateway admits authenticated clients and registers one
//!   [`Connection`] per identity.
//! - [`ChatHub`] is a cheap handle; the [`HubDispatcher`] task owns the
//!   presence registry and performs all fan-out.
//! - Direct messages go through [`send_direct`], which also records them in
//!   the history store.

mod config;
mod connection;
mod gateway;
mod hub;
mod types;

pub use config::ChatConfig;
pub use connection::{Connection, DirectDelivery, send_direct};
pub use gateway::ws_handler;
pub use hub::{
    ChatHub, ConnectionHandle, ConnectionId, DEFAULT_HUB_BUFFER, DEFAULT_OUTBOUND_BUFFER,
    EnqueueError, HubDispatcher, HubError, Outbound, encode,
};
pub use types::{Identity, InboundFrame, PresenceEntry, WireMessage};
