//! In-band text protocol spoken over each WebSocket.
//!
//! Clients send either free text or `/nick <name>`. The relay answers with
//! `[<name>] <text>` chat lines and `_NOTIFICATION_[<name>] joined` notices.
//! Several lines may share one frame, separated by [`LINE_SEPARATOR`].

use std::sync::Arc;

/// A single outbound line, shared between every recipient of a broadcast.
pub type Payload = Arc<str>;

pub const LINE_SEPARATOR: char = '\n';

const NICK_COMMAND: &str = "/nick ";
const NOTIFICATION_TAG: &str = "_NOTIFICATION_";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientCommand {
    /// Replace the sender's display name. Never broadcast.
    Rename { nickname: String },
    /// Free text to be broadcast under the sender's name.
    Chat { text: String },
}

/// Collapses embedded newlines to spaces and trims surrounding whitespace so a
/// message always occupies exactly one line on the wire.
pub fn normalize(raw: &str) -> String {
    raw.replace(LINE_SEPARATOR, " ").trim().to_string()
}

pub fn parse_client_message(raw: &str) -> ClientCommand {
    let text = normalize(raw);
    match text.strip_prefix(NICK_COMMAND) {
        Some(rest) => ClientCommand::Rename {
            nickname: rest.trim().to_string(),
        },
        None => ClientCommand::Chat { text },
    }
}

pub fn chat_line(nickname: &str, text: &str) -> Payload {
    format!("[{nickname}] {text}").into()
}

pub fn join_notice(nickname: &str) -> Payload {
    format!("{NOTIFICATION_TAG}[{nickname}] joined").into()
}

/// Default display name for the `count`-th member. Not unique across rejoins.
pub fn default_nickname(count: usize) -> String {
    format!("user{count}")
}
