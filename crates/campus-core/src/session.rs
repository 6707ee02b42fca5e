// Session state: who is logged in, which school is selected, and the
// competition slot.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::competition::{Competition, CompetitionEvent, Outcome};
use crate::connection::Identity;
use crate::db::Database;

/// Storage key of the sticky school selection.
pub const SELECTED_SCHOOL_KEY: &str = "selected_school_id";

// ---------------------------------------------------------------------------
// User
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Role {
    #[serde(rename = "AD")]
    Admin,
    #[serde(rename = "TC")]
    Teacher,
    #[serde(rename = "ST")]
    Student,
}

impl Role {
    pub fn code(self) -> &'static str {
        match self {
            Role::Admin => "AD",
            Role::Teacher => "TC",
            Role::Student => "ST",
        }
    }
}

/// Standing shown next to a user's name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StatusTier {
    #[default]
    Green,
    Yellow,
    Red,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub email: String,
    pub role: Role,
    #[serde(default, alias = "schoolId")]
    pub school_id: Option<String>,
    #[serde(default)]
    pub status: StatusTier,
    #[serde(default, alias = "isLicensed")]
    pub is_licensed: bool,
    #[serde(default)]
    pub wins: u32,
    #[serde(default, alias = "profilePicture")]
    pub profile_picture: Option<String>,
}

// ---------------------------------------------------------------------------
// Session
// ---------------------------------------------------------------------------

/// The single state container of the client. Readers borrow it; every
/// mutation goes through a method here.
#[derive(Debug, Clone, Default)]
pub struct Session {
    user: Option<User>,
    selected_school_id: Option<String>,
    competition: Competition,
}

impl Session {
    /// Start a logged-out session, restoring the persisted school selection.
    pub fn restore(db: &Database) -> Result<Self> {
        let selected_school_id = db
            .load_state(SELECTED_SCHOOL_KEY)
            .context("failed to restore school selection")?
            .and_then(|v| v.as_str().map(str::to_owned));
        debug!(?selected_school_id, "session restored");
        Ok(Session {
            selected_school_id,
            ..Session::default()
        })
    }

    pub fn user(&self) -> Option<&User> {
        self.user.as_ref()
    }

    pub fn user_id(&self) -> Option<&str> {
        self.user.as_ref().map(|u| u.id.as_str())
    }

    pub fn selected_school_id(&self) -> Option<&str> {
        self.selected_school_id.as_deref()
    }

    /// The selected school, or the user's own school when nothing was picked.
    pub fn effective_school_id(&self) -> Option<&str> {
        self.selected_school_id
            .as_deref()
            .or_else(|| self.user.as_ref().and_then(|u| u.school_id.as_deref()))
    }

    pub fn competition(&self) -> &Competition {
        &self.competition
    }

    /// Replace the user. Signing in again as the same user refreshes the
    /// profile and keeps the competition slot; any other login starts with an
    /// empty slot that the caller resyncs from the server.
    pub fn login(&mut self, user: User) {
        if self.user_id() == Some(user.id.as_str()) {
            debug!(user = %user.id, "profile refreshed");
            self.user = Some(user);
            return;
        }
        info!(user = %user.id, role = user.role.code(), "logged in");
        self.user = Some(user);
        self.competition.apply(&CompetitionEvent::Reset, "");
    }

    /// Clear the user, the competition, and the persisted school selection.
    pub fn logout(&mut self, db: &Database) -> Result<()> {
        if let Some(user) = self.user.take() {
            info!(user = %user.id, "logged out");
        }
        self.competition.apply(&CompetitionEvent::Reset, "");
        self.selected_school_id = None;
        db.delete_state(SELECTED_SCHOOL_KEY)
            .context("failed to clear school selection")?;
        Ok(())
    }

    /// Make `school_id` the sticky selection.
    pub fn set_selected_school(&mut self, db: &Database, school_id: &str) -> Result<()> {
        db.save_state(SELECTED_SCHOOL_KEY, &serde_json::json!(school_id))
            .context("failed to persist school selection")?;
        self.selected_school_id = Some(school_id.to_owned());
        Ok(())
    }

    /// The push-channel identity for the logged-in user.
    pub fn identity(&self, token: &str) -> Option<Identity> {
        self.user.as_ref().map(|u| Identity {
            user_id: u.id.clone(),
            token: token.to_owned(),
        })
    }

    /// Feed the competition reducer on behalf of the logged-in user. Without
    /// a user only `Reset` has any effect.
    pub fn apply_competition(&mut self, event: &CompetitionEvent) -> Outcome {
        match &self.user {
            Some(user) => self.competition.apply(event, &user.id),
            None if matches!(event, CompetitionEvent::Reset) => self.competition.apply(event, ""),
            None => Outcome::Unchanged,
        }
    }
}
