//! Call handshake: request, accept or reject over the relay, then a media
//! session run by a call screen.

mod controller;
mod handoff;
mod room;
mod screen;
mod session;
mod signal;
mod state;

pub use controller::{CallController, ControllerEvents, Notice};
pub use handoff::{CallHandoff, SessionToken};
pub use room::RoomId;
pub use screen::{CallScreen, ScreenCommand, ScreenEvent, ScreenLauncher, TaskLauncher};
pub use session::{CallSession, CallSummary};
pub use signal::{is_sentinel, CallSignal, CALL_ACCEPTED, CALL_REJECTED, CALL_REQUEST};
pub use state::{CallPhase, CallRole, CallTransition, EndReason, InvalidTransition};
