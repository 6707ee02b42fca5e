// Campus live-sync client entry point.
//
// Startup sequence:
// 1. Initialize tracing (log to file, stdout carries the command interface)
// 2. Load config
// 3. Open database, restore the session
// 4. Create channels, connection manager and REST client
// 5. Spawn the app loop and the output printer
// 6. Sign in the configured user, if any
// 7. Read commands from stdin until quit or EOF
// 8. Cleanup on exit

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use campus_app::api::HttpCompetitionApi;
use campus_app::app::{self, AppState};
use campus_app::protocol::UserCommand;
use campus_cli::input::{self, Input};
use campus_cli::render;
use campus_core::config;
use campus_core::connection::{ConnectionManager, TungsteniteConnector};
use campus_core::db::Database;
use campus_core::session::Session;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;
use tracing::{error, info, warn};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing()?;
    info!("campus client starting up");

    let config = config::load_config().context("failed to load configuration")?;
    info!(base_url = %config.server.base_url, "config loaded");

    let db = Database::open(&config.db_path).context("failed to open database")?;
    info!("database opened at {}", config.db_path);
    let session = Session::restore(&db).context("failed to restore session")?;

    let (conn_tx, conn_rx) = mpsc::channel(config.connection.event_buffer);
    let (cmd_tx, cmd_rx) = mpsc::channel(64);
    let (ui_tx, mut ui_rx) = mpsc::channel(256);

    let connection = ConnectionManager::new(
        Arc::new(TungsteniteConnector),
        config.server.base_url.clone(),
        config.backoff_policy(),
        conn_tx,
    );
    let token = config.credentials.token.clone();
    let api = HttpCompetitionApi::new(&config.server.base_url, token.clone().unwrap_or_default());
    let login = match (config.credentials.user.clone(), token) {
        (Some(user), Some(token)) => Some(UserCommand::Login { user, token }),
        _ => None,
    };

    let state = AppState::new(config, session, db, Arc::new(api), connection);
    let app_handle = tokio::spawn(async move {
        if let Err(e) = app::run(conn_rx, cmd_rx, ui_tx, state).await {
            error!("application loop error: {e:#}");
        }
    });

    let printer = tokio::spawn(async move {
        while let Some(update) = ui_rx.recv().await {
            println!("{}", render::render(&update, chrono::Utc::now()));
        }
    });

    match &login {
        Some(cmd) => cmd_tx.send(cmd.clone()).await.context("app loop exited early")?,
        None => {
            warn!("no credentials configured");
            println!("[info] no credentials in config/credentials.toml; running signed out");
        }
    }

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await.context("failed to read stdin")? {
        let command = match input::parse_command(&line) {
            Ok(Input::Blank) => continue,
            Ok(Input::Help) => {
                println!("{}", input::HELP);
                continue;
            }
            Ok(Input::Login) => match &login {
                Some(cmd) => cmd.clone(),
                None => {
                    println!("[warn] no user configured in config/credentials.toml");
                    continue;
                }
            },
            Ok(Input::Command(cmd)) => cmd,
            Err(message) => {
                println!("[warn] {message}");
                continue;
            }
        };

        let quit = command == UserCommand::Quit;
        if cmd_tx.send(command).await.is_err() {
            warn!("app loop is gone, stopping input");
            break;
        }
        if quit {
            break;
        }
    }

    // EOF without `quit` also ends the session.
    let _ = cmd_tx.send(UserCommand::Quit).await;
    drop(cmd_tx);

    let _ = tokio::time::timeout(Duration::from_secs(5), async {
        let _ = app_handle.await;
        let _ = printer.await;
    })
    .await;

    info!("campus client shut down cleanly");
    Ok(())
}

/// Initialize tracing to log to a file.
fn init_tracing() -> anyhow::Result<()> {
    use tracing_subscriber::fmt;
    use tracing_subscriber::EnvFilter;

    let log_dir = std::env::current_dir()?.join("logs");
    std::fs::create_dir_all(&log_dir)?;

    let log_file = std::fs::File::create(log_dir.join("campus.log"))?;

    let subscriber = fmt::Subscriber::builder()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("campus=info,campus_core=info,campus_app=info,warn")),
        )
        .with_writer(std::sync::Mutex::new(log_file))
        .with_ansi(false)
        .with_target(true)
        .with_thread_ids(true)
        .with_line_number(true)
        .finish();

    tracing::subscriber::set_global_default(subscriber)
        .context("failed to set tracing subscriber")?;

    Ok(())
}
