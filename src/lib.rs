//! Both endpoints of the Sendspin protocol: JSON control messages and framed
//! binary audio/artwork/visualizer payloads over a single WebSocket, with a
//! Kalman-filtered shared clock so frames render in lock-step across devices.

#![deny(clippy::all)]
#![warn(clippy::pedantic)]

#[macro_use]
extern crate log;

pub mod client;
pub mod error;
pub mod events;
pub mod protocol;
pub mod registry;
pub mod session;
pub mod timing;
pub mod transport;
pub mod util;

pub use client::Client;
pub use registry::SessionRegistry;
pub use session::Session;
pub use timing::TimeFilter;
