//! Web layer: the connection controller and its HTTP/WebSocket surface.
//!
//! Every browser tab holds one WebSocket. Its messages are turned into
//! requests on a [`link::Link`], executed one at a time by the
//! [`controller`], and the resulting state changes are pushed back to every
//! connected client.

pub mod auth;
pub mod controller;
pub mod link;
pub mod protocol;
mod server;
mod websocket;

pub use auth::{Credentials, hash_password, load_htpasswd};
pub use controller::{ConnectionState, ControllerHandle, spawn_controller};
pub use link::{ConnectionId, InboundHalf, LINK_CAPACITY, Link, OutboundHalf};
pub use protocol::{Action, Command, MessageType, Request, Response, Status};
pub use server::{AppState, Server, router, start_server};
pub use websocket::{check_origin, origin_allowed};
