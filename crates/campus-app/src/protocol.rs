// Messages exchanged between the app loop and the front end.

use campus_core::competition::Competition;
use campus_core::connection::LinkState;
use campus_core::protocol::ChatMessage;
use campus_core::session::User;

/// Intents from the front end.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UserCommand {
    /// Challenge another user to a competition.
    Challenge { opponent_id: String },
    /// Accept the pending challenge addressed to us.
    Accept,
    /// Turn down the pending challenge addressed to us.
    Reject,
    /// Withdraw our own pending challenge.
    Cancel,
    /// Enter a competition that is ready.
    Start,
    SelectSchool(String),
    Login { user: User, token: String },
    Logout,
    /// Re-send the current connection and competition state.
    Status,
    Quit,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NoticeLevel {
    Info,
    Warning,
    Error,
}

/// Updates pushed to the front end.
#[derive(Debug, Clone, PartialEq)]
pub enum UiUpdate {
    Connection(LinkState),
    Competition(Competition),
    Chat(ChatMessage),
    Notice { level: NoticeLevel, message: String },
}

impl UiUpdate {
    pub fn info(message: impl Into<String>) -> Self {
        UiUpdate::Notice {
            level: NoticeLevel::Info,
            message: message.into(),
        }
    }

    pub fn warning(message: impl Into<String>) -> Self {
        UiUpdate::Notice {
            level: NoticeLevel::Warning,
            message: message.into(),
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        UiUpdate::Notice {
            level: NoticeLevel::Error,
            message: message.into(),
        }
    }
}
