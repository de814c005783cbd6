//! Headless TalkSphere client.
//!
//! The crate joins the TalkSphere message relay, exchanges chat text with
//! friends and runs the video call handshake: a call-request / call-accepted
//! exchange over the relay followed by a peer-to-peer WebRTC media session.

#[macro_use]
extern crate log;

pub mod api;
pub mod call;
pub mod chat;
pub mod client;
pub mod config;
pub mod console;
pub mod error;
pub mod logging;
pub mod media;
pub mod relay;
mod result;

pub use error::Error;
pub use result::Result;
