// Application state and orchestration logic.
//
// The event loop merges push-channel events, user intents, completed REST
// calls and the competition clock into the session, and reports every
// visible change to the front end.

use std::sync::Arc;

use chrono::Utc;
use tokio::sync::mpsc;
use tokio::time::{Instant, Interval, MissedTickBehavior};
use tracing::{debug, info, warn};

use campus_core::competition::{Competition, CompetitionEvent, Outcome};
use campus_core::config::Config;
use campus_core::connection::{ConnectionEvent, ConnectionManager, LinkEvent, LinkState};
use campus_core::db::Database;
use campus_core::protocol::{
    CompetitionRecord, CompetitionStatus, CreateCompetitionRequest, PushEvent,
};
use campus_core::session::{Session, User};

use crate::api::{ApiError, CompetitionApi};
use crate::protocol::{UiUpdate, UserCommand};

// ---------------------------------------------------------------------------
// Supporting types
// ---------------------------------------------------------------------------

/// A state-mutating request awaiting the server.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Intent {
    Challenge,
    Accept,
    Reject,
    Cancel,
}

impl Intent {
    fn describe(self) -> &'static str {
        match self {
            Intent::Challenge => "send challenge",
            Intent::Accept => "accept challenge",
            Intent::Reject => "reject challenge",
            Intent::Cancel => "cancel challenge",
        }
    }
}

/// A finished REST call, tagged with the session epoch it was issued in.
#[derive(Debug)]
enum Completion {
    Intent {
        epoch: u64,
        intent: Intent,
        result: Result<CompetitionRecord, ApiError>,
    },
    Resync {
        epoch: u64,
        result: Result<Vec<CompetitionRecord>, ApiError>,
    },
}

// ---------------------------------------------------------------------------
// AppState
// ---------------------------------------------------------------------------

pub struct AppState {
    pub config: Config,
    pub session: Session,
    pub db: Database,
    pub api: Arc<dyn CompetitionApi>,
    pub connection: ConnectionManager,
    pub link_state: LinkState,
    /// The one outstanding state-mutating request, if any.
    in_flight: Option<Intent>,
    resync_pending: bool,
    /// Bumped on every login and logout. Completions from an older epoch
    /// belong to a session that no longer exists and are dropped.
    epoch: u64,
    completions_tx: mpsc::Sender<Completion>,
    completions_rx: Option<mpsc::Receiver<Completion>>,
}

impl AppState {
    pub fn new(
        config: Config,
        session: Session,
        db: Database,
        api: Arc<dyn CompetitionApi>,
        connection: ConnectionManager,
    ) -> Self {
        let (completions_tx, completions_rx) = mpsc::channel(16);
        AppState {
            config,
            session,
            db,
            api,
            connection,
            link_state: LinkState::Idle,
            in_flight: None,
            resync_pending: false,
            epoch: 0,
            completions_tx,
            completions_rx: Some(completions_rx),
        }
    }

    pub fn in_flight(&self) -> Option<Intent> {
        self.in_flight
    }

    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    fn competition_snapshot(&self) -> Competition {
        self.session.competition().clone()
    }

    /// Switch to `user` and open their push channel. Signing in again as
    /// the current user keeps the competition slot and any outstanding
    /// request; only a changed token replaces the channel.
    pub fn login(&mut self, user: User, token: String) {
        let same_user = self.session.user_id() == Some(user.id.as_str());
        if !same_user {
            self.epoch += 1;
            self.in_flight = None;
            self.resync_pending = false;
        }
        self.api.set_token(&token);
        self.session.login(user);
        if let Some(identity) = self.session.identity(&token) {
            let previous = self.connection.current_link();
            self.connection.open(Some(&identity));
            if self.connection.current_link() != previous {
                self.link_state = self.connection.state();
            }
        }
        if same_user && self.link_state == LinkState::Open {
            self.start_resync();
        }
    }

    pub fn logout(&mut self) -> anyhow::Result<()> {
        self.epoch += 1;
        self.in_flight = None;
        self.resync_pending = false;
        self.connection.close();
        self.link_state = LinkState::Idle;
        self.session.logout(&self.db)
    }

    /// Ask the server to answer or withdraw the pending challenge.
    fn request_status_change(&mut self, intent: Intent) -> Result<(), String> {
        if let Some(pending) = self.in_flight {
            return Err(format!("still waiting to {}", pending.describe()));
        }
        if self.session.user_id().is_none() {
            return Err("not logged in".into());
        }

        let competition = self.session.competition();
        let (allowed, status) = match intent {
            Intent::Accept => (competition.awaiting_my_answer(), CompetitionStatus::Accepted),
            Intent::Reject => (competition.awaiting_my_answer(), CompetitionStatus::None),
            Intent::Cancel => (competition.cancellable_by_me(), CompetitionStatus::None),
            Intent::Challenge => (false, CompetitionStatus::Pending),
        };
        if !allowed {
            return Err(match intent {
                Intent::Cancel => "you have no pending challenge to cancel".into(),
                _ => "there is no challenge waiting for your answer".into(),
            });
        }
        let Some(id) = competition.id().map(str::to_owned) else {
            return Err("there is no competition to update".into());
        };

        info!(id = %id, %status, "requesting status change");
        let api = Arc::clone(&self.api);
        let tx = self.completions_tx.clone();
        let epoch = self.epoch;
        self.in_flight = Some(intent);
        tokio::spawn(async move {
            let result = api.update_status(&id, status).await;
            let _ = tx
                .send(Completion::Intent {
                    epoch,
                    intent,
                    result,
                })
                .await;
        });
        Ok(())
    }

    fn dispatch_challenge(&mut self, opponent_id: String) -> Result<(), String> {
        if let Some(pending) = self.in_flight {
            return Err(format!("still waiting to {}", pending.describe()));
        }
        let Some(me) = self.session.user_id().map(str::to_owned) else {
            return Err("not logged in".into());
        };
        if opponent_id == me {
            return Err("you cannot challenge yourself".into());
        }
        if self.session.competition().is_live() {
            return Err(format!(
                "a competition is already {}",
                self.session.competition().status()
            ));
        }

        let request = CreateCompetitionRequest {
            sender_id: me,
            receiver_id: opponent_id,
            school_id: self.session.effective_school_id().map(str::to_owned),
        };
        info!(receiver = %request.receiver_id, "sending challenge");

        let api = Arc::clone(&self.api);
        let tx = self.completions_tx.clone();
        let epoch = self.epoch;
        self.in_flight = Some(Intent::Challenge);
        tokio::spawn(async move {
            let result = api.create(&request).await;
            let _ = tx
                .send(Completion::Intent {
                    epoch,
                    intent: Intent::Challenge,
                    result,
                })
                .await;
        });
        Ok(())
    }

    /// Fetch the user's competitions so an empty slot can pick up one that
    /// changed while the channel was down.
    fn start_resync(&mut self) {
        if self.resync_pending || self.session.competition().is_live() {
            return;
        }
        let Some(me) = self.session.user_id().map(str::to_owned) else {
            return;
        };
        debug!(user = %me, "resyncing competition slot");
        self.resync_pending = true;
        let api = Arc::clone(&self.api);
        let tx = self.completions_tx.clone();
        let epoch = self.epoch;
        tokio::spawn(async move {
            let result = api.list_for_user(&me).await;
            let _ = tx.send(Completion::Resync { epoch, result }).await;
        });
    }
}

// ---------------------------------------------------------------------------
// Main event loop
// ---------------------------------------------------------------------------

/// Run the main application event loop.
///
/// Listens with `tokio::select!` on:
/// 1. Push-channel events from the connection manager
/// 2. User commands from the front end
/// 3. Completed REST calls
/// 4. The competition clock, only while a scheduled start is pending
///
/// Pushes UI updates through `ui_tx`. Closes the push channel on exit.
pub async fn run(
    mut conn_rx: mpsc::Receiver<LinkEvent>,
    mut cmd_rx: mpsc::Receiver<UserCommand>,
    ui_tx: mpsc::Sender<UiUpdate>,
    mut state: AppState,
) -> anyhow::Result<()> {
    let mut completions_rx = state
        .completions_rx
        .take()
        .ok_or_else(|| anyhow::anyhow!("application loop already started for this state"))?;

    info!("Application event loop started");

    let mut conn_open = true;
    let mut tick: Option<Interval> = None;

    loop {
        sync_tick(&state, &mut tick);

        tokio::select! {
            // --- Push channel ---
            event = conn_rx.recv(), if conn_open => {
                match event {
                    Some(event) => {
                        // Events queued by a link that was since closed or
                        // replaced belong to another session.
                        if let Some(event) = state.connection.accept(event) {
                            handle_connection_event(&mut state, event, &ui_tx).await;
                        }
                    }
                    None => {
                        info!("Connection event channel closed");
                        conn_open = false;
                    }
                }
            }

            // --- User commands ---
            cmd = cmd_rx.recv() => {
                match cmd {
                    Some(UserCommand::Quit) => {
                        info!("Quit command received, shutting down");
                        break;
                    }
                    Some(cmd) => handle_user_command(&mut state, cmd, &ui_tx).await,
                    None => {
                        info!("Command channel closed, shutting down");
                        break;
                    }
                }
            }

            // --- REST completions (the state holds a sender, so this never closes) ---
            Some(completion) = completions_rx.recv() => {
                handle_completion(&mut state, completion, &ui_tx).await;
            }

            // --- Competition clock ---
            _ = next_tick(&mut tick) => {
                let outcome = state
                    .session
                    .apply_competition(&CompetitionEvent::Tick(Utc::now()));
                publish_if_visible(&state, &outcome, &ui_tx).await;
            }
        }
    }

    state.connection.close();
    info!("Application event loop exiting");
    Ok(())
}

/// Keep the clock running exactly while the slot waits for its start time.
fn sync_tick(state: &AppState, tick: &mut Option<Interval>) {
    let needed = state.session.competition().needs_tick();
    match (needed, tick.is_some()) {
        (true, false) => {
            let period = state.config.tick_interval();
            let mut interval = tokio::time::interval_at(Instant::now() + period, period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            *tick = Some(interval);
            debug!(?period, "competition clock started");
        }
        (false, true) => {
            *tick = None;
            debug!("competition clock stopped");
        }
        _ => {}
    }
}

async fn next_tick(tick: &mut Option<Interval>) {
    match tick {
        Some(interval) => {
            interval.tick().await;
        }
        None => std::future::pending::<()>().await,
    }
}

async fn publish_if_visible(state: &AppState, outcome: &Outcome, ui_tx: &mpsc::Sender<UiUpdate>) {
    if outcome.is_visible() {
        let _ = ui_tx
            .send(UiUpdate::Competition(state.competition_snapshot()))
            .await;
    }
}

async fn handle_connection_event(
    state: &mut AppState,
    event: ConnectionEvent,
    ui_tx: &mpsc::Sender<UiUpdate>,
) {
    match event {
        ConnectionEvent::Opened => {
            state.link_state = LinkState::Open;
            let _ = ui_tx.send(UiUpdate::Connection(LinkState::Open)).await;
            state.start_resync();
        }
        ConnectionEvent::Closed { retry_in } => {
            state.link_state = LinkState::Waiting { retry_in };
            let _ = ui_tx
                .send(UiUpdate::Connection(LinkState::Waiting { retry_in }))
                .await;
        }
        ConnectionEvent::Push(PushEvent::CompetitionUpdate(record)) => {
            let id = record.id.clone();
            let outcome = state
                .session
                .apply_competition(&CompetitionEvent::Pushed(record));
            match &outcome {
                Outcome::Ignored(reason) => debug!(id = %id, ?reason, "push not applied"),
                Outcome::Changed { from, to } => info!(id = %id, %from, %to, "competition changed"),
                _ => {}
            }
            publish_if_visible(state, &outcome, ui_tx).await;
        }
        ConnectionEvent::Push(PushEvent::ChatMessage(message)) => {
            let _ = ui_tx.send(UiUpdate::Chat(message)).await;
        }
    }
}

async fn handle_completion(
    state: &mut AppState,
    completion: Completion,
    ui_tx: &mpsc::Sender<UiUpdate>,
) {
    let epoch = match &completion {
        Completion::Intent { epoch, .. } | Completion::Resync { epoch, .. } => *epoch,
    };
    if epoch != state.epoch {
        debug!(epoch, current = state.epoch, "discarding result from an earlier session");
        return;
    }

    match completion {
        Completion::Intent { intent, result, .. } => {
            state.in_flight = None;
            match result {
                Ok(record) => {
                    let event = match intent {
                        Intent::Challenge => CompetitionEvent::Sent(record),
                        _ => CompetitionEvent::Confirmed(record),
                    };
                    let outcome = state.session.apply_competition(&event);
                    if let Outcome::Ignored(reason) = outcome {
                        warn!(?intent, ?reason, "server confirmation not applied");
                    }
                    publish_if_visible(state, &outcome, ui_tx).await;
                }
                Err(e) => {
                    warn!(?intent, error = %e, "request failed");
                    let _ = ui_tx
                        .send(UiUpdate::error(format!("Could not {}: {e}", intent.describe())))
                        .await;
                }
            }
        }
        Completion::Resync { result, .. } => {
            state.resync_pending = false;
            match result {
                Ok(records) => {
                    let Some(me) = state.session.user_id().map(str::to_owned) else {
                        return;
                    };
                    if state.session.competition().is_live() {
                        return;
                    }
                    if let Some(record) = Competition::select_live(&records, &me).cloned() {
                        info!(id = %record.id, status = %record.status, "restored competition");
                        let outcome = state
                            .session
                            .apply_competition(&CompetitionEvent::Pushed(record));
                        publish_if_visible(state, &outcome, ui_tx).await;
                    }
                }
                Err(e) => warn!(error = %e, "competition resync failed"),
            }
        }
    }
}

async fn handle_user_command(
    state: &mut AppState,
    cmd: UserCommand,
    ui_tx: &mpsc::Sender<UiUpdate>,
) {
    let rejected = match cmd {
        UserCommand::Challenge { opponent_id } => state.dispatch_challenge(opponent_id).err(),
        UserCommand::Accept => state.request_status_change(Intent::Accept).err(),
        UserCommand::Reject => state.request_status_change(Intent::Reject).err(),
        UserCommand::Cancel => state.request_status_change(Intent::Cancel).err(),
        UserCommand::Start => {
            let outcome = state.session.apply_competition(&CompetitionEvent::Started);
            if outcome.is_visible() {
                info!("competition started");
                publish_if_visible(state, &outcome, ui_tx).await;
                None
            } else {
                Some("no competition is ready to start".to_string())
            }
        }
        UserCommand::SelectSchool(school_id) => {
            match state.session.set_selected_school(&state.db, &school_id) {
                Ok(()) => {
                    let _ = ui_tx
                        .send(UiUpdate::info(format!("Selected school {school_id}")))
                        .await;
                    None
                }
                Err(e) => {
                    warn!(error = %e, "failed to persist school selection");
                    let _ = ui_tx
                        .send(UiUpdate::error(format!("Could not select school: {e:#}")))
                        .await;
                    None
                }
            }
        }
        UserCommand::Login { user, token } => {
            let name = user.name.clone();
            state.login(user, token);
            let _ = ui_tx.send(UiUpdate::info(format!("Logged in as {name}"))).await;
            let _ = ui_tx
                .send(UiUpdate::Competition(state.competition_snapshot()))
                .await;
            None
        }
        UserCommand::Logout => {
            if let Err(e) = state.logout() {
                warn!(error = %e, "logout did not clear stored state");
            }
            let _ = ui_tx.send(UiUpdate::Connection(LinkState::Idle)).await;
            let _ = ui_tx
                .send(UiUpdate::Competition(state.competition_snapshot()))
                .await;
            let _ = ui_tx.send(UiUpdate::info("Logged out")).await;
            None
        }
        UserCommand::Status => {
            let who = match state.session.user() {
                Some(user) => format!(
                    "{} ({}, {} wins), school {}",
                    user.name,
                    user.role.code(),
                    user.wins,
                    state.session.effective_school_id().unwrap_or("-")
                ),
                None => "not logged in".to_string(),
            };
            let _ = ui_tx.send(UiUpdate::info(who)).await;
            let _ = ui_tx.send(UiUpdate::Connection(state.link_state)).await;
            let _ = ui_tx
                .send(UiUpdate::Competition(state.competition_snapshot()))
                .await;
            None
        }
        UserCommand::Quit => None,
    };

    if let Some(reason) = rejected {
        debug!(%reason, "command rejected");
        let _ = ui_tx.send(UiUpdate::warning(reason)).await;
    }
}
