//! Line-oriented terminal front end.

use std::str::FromStr;

use futures_util::StreamExt;
use tokio::sync::mpsc::{self, UnboundedReceiver};
use tokio_util::codec::{FramedRead, LinesCodec};

use crate::api::{EdgeState, FriendEdge, Identity};
use crate::call::{EndReason, Notice};
use crate::chat::{ChatLog, ChatMessage};
use crate::client::View;
use crate::Error;

pub const HELP: &str = "\
/friends            list friends and pending requests
/open <email>       open the chat with a friend
/call [email]       call a friend, or the open chat
/accept             accept the ringing call
/reject             reject the ringing call
/hangup             end the current call
/history            show the open chat again
/quit               leave
anything else is sent to the open chat";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Friends,
    Open(String),
    Say(String),
    History,
    Call(Option<String>),
    Accept,
    Reject,
    Hangup,
    Help,
    Quit,
}

impl FromStr for Command {
    type Err = Error;

    fn from_str(line: &str) -> Result<Self, Self::Err> {
        let line = line.trim();
        let Some(rest) = line.strip_prefix('/') else {
            return Ok(Command::Say(line.to_string()));
        };
        let (name, argument) = match rest.split_once(char::is_whitespace) {
            Some((name, argument)) => (name, Some(argument.trim()).filter(|a| !a.is_empty())),
            None => (rest, None),
        };
        let command = match (name, argument) {
            ("friends", None) => Command::Friends,
            ("open", Some(email)) => Command::Open(email.to_string()),
            ("call", email) => Command::Call(email.map(str::to_string)),
            ("accept", None) => Command::Accept,
            ("reject", None) => Command::Reject,
            ("hangup", None) => Command::Hangup,
            ("history", None) => Command::History,
            ("help", None) => Command::Help,
            ("quit", None) | ("exit", None) => Command::Quit,
            _ => return Err(Error::Validation(format!("unknown command {:?}, try /help", line))),
        };
        Ok(command)
    }
}

/// Reads commands from stdin until it closes. Lines that do not parse are
/// reported and skipped.
pub fn spawn_stdin() -> UnboundedReceiver<Command> {
    let (sender, receiver) = mpsc::unbounded_channel();
    tokio::spawn(async move {
        let mut lines = FramedRead::new(tokio::io::stdin(), LinesCodec::new());
        while let Some(line) = lines.next().await {
            let line = match line {
                Ok(line) => line,
                Err(e) => {
                    error!("Failed to read stdin: {}", e);
                    break;
                }
            };
            if line.trim().is_empty() {
                continue;
            }
            match line.parse::<Command>() {
                Ok(command) => {
                    if sender.send(command).is_err() {
                        break;
                    }
                }
                Err(e) => println!("{}", e),
            }
        }
        debug!("stdin closed");
    });
    receiver
}

/// Prints to stdout.
#[derive(Debug, Default)]
pub struct ConsoleView;

fn describe(notice: &Notice) -> String {
    match notice {
        Notice::IncomingCall { from } => format!("{} is calling, /accept or /reject", from),
        Notice::Calling { to } => format!("calling {}...", to),
        Notice::Accepted { with } => format!("{} accepted, starting media", with),
        Notice::Connected { with, remote } => {
            format!("connected with {} (remote stream {})", with, remote.id)
        }
        Notice::Ended(summary) => match &summary.reason {
            EndReason::Rejected => format!("{} declined the call", summary.friend),
            EndReason::Missed => format!("missed call from {}", summary.friend),
            reason => match summary.duration_secs {
                Some(secs) => format!("call with {} ended ({}) after {}s", summary.friend, reason, secs),
                None => format!("call with {} ended ({})", summary.friend, reason),
            },
        },
        Notice::Failure { message, blocking: true } => format!("!! {}", message),
        Notice::Failure { message, .. } => message.clone(),
    }
}

impl View for ConsoleView {
    fn notice(&mut self, notice: &Notice) {
        println!("* {}", describe(notice));
    }

    fn message(&mut self, friend: &Identity, message: &ChatMessage) {
        println!("[{}] {}: {}", message.timestamp.format("%H:%M"), friend.name, message.content);
    }

    fn friends(&mut self, friends: &[FriendEdge], requests: &[FriendEdge]) {
        for edge in friends.iter().chain(requests) {
            let marker = match edge.state {
                EdgeState::Accepted => " ",
                EdgeState::Requested => "?",
            };
            println!("{} {}", marker, edge.friend);
        }
        if friends.is_empty() && requests.is_empty() {
            println!("no friends yet");
        }
    }

    fn history(&mut self, friend: &Identity, log: Option<&ChatLog>) {
        println!("--- {} ---", friend);
        for message in log.into_iter().flat_map(ChatLog::messages) {
            let author = if message.sender == friend.email { friend.name.as_str() } else { "you" };
            println!("[{}] {}: {}", message.timestamp.format("%H:%M"), author, message.content);
        }
    }

    fn status(&mut self, text: &str) {
        println!("{}", text);
    }
}
