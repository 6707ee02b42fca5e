// End-to-end: raw push frames travel through the connection manager and the
// wire normalizer into a session's competition slot.

use std::collections::VecDeque;
use std::convert::Infallible;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use futures_util::SinkExt;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::{self, Message};

use campus_core::competition::{CompetitionEvent, IgnoreReason, Outcome};
use campus_core::connection::{
    BackoffPolicy, ConnectionEvent, ConnectionManager, Connector, Identity, LinkEvent, Socket,
};
use campus_core::db::Database;
use campus_core::protocol::{CompetitionStatus, PushEvent};
use campus_core::session::{Role, Session, StatusTier, User};

/// Hands out pre-made in-memory sockets, then refuses.
struct MemoryConnector {
    sockets: Mutex<VecDeque<mpsc::UnboundedReceiver<Message>>>,
}

#[async_trait]
impl Connector for MemoryConnector {
    async fn connect(&self, _url: &str) -> Result<Socket, tungstenite::Error> {
        let next = self.sockets.lock().unwrap().pop_front();
        let rx = next.ok_or(tungstenite::Error::ConnectionClosed)?;
        let stream = futures_util::stream::unfold(rx, |mut rx| async move {
            rx.recv()
                .await
                .map(|msg| (Ok::<_, tungstenite::Error>(msg), rx))
        });
        let sink = futures_util::sink::drain::<Message>()
            .sink_map_err(|never: Infallible| -> tungstenite::Error { match never {} });
        Ok(Socket {
            sink: Box::pin(sink),
            stream: Box::pin(stream),
        })
    }
}

fn ada() -> User {
    User {
        id: "7".into(),
        name: "Ada".into(),
        email: "ada@north.test".into(),
        role: Role::Student,
        school_id: Some("1".into()),
        status: StatusTier::Green,
        is_licensed: true,
        wins: 2,
        profile_picture: None,
    }
}

/// A backend-shaped frame: numeric ids, nested school objects.
fn frame(id: u32, status: &str, sender: u32, receiver: u32, date: Option<&str>) -> Message {
    let date = date.map_or("null".to_string(), |d| format!("\"{d}\""));
    Message::Text(
        format!(
            r#"{{"type":"competition_update","competition":{{
                "id":{id},"status":"{status}","scheduled_date":{date},
                "sender":{{"id":{sender},"name":"User {sender}","school":{{"id":1,"name":"North"}}}},
                "receiver":{{"id":{receiver},"name":"User {receiver}","school":{{"id":2,"name":"South"}}}}
            }}}}"#
        )
        .into(),
    )
}

async fn next_push(rx: &mut mpsc::Receiver<LinkEvent>, manager: &ConnectionManager) -> PushEvent {
    loop {
        let event = rx.recv().await.expect("connection events closed");
        match manager.accept(event) {
            Some(ConnectionEvent::Push(event)) => return event,
            _ => continue,
        }
    }
}

#[tokio::test(start_paused = true)]
async fn incoming_challenge_lifecycle_over_the_wire() {
    let (server, socket) = mpsc::unbounded_channel();
    let connector = Arc::new(MemoryConnector {
        sockets: Mutex::new(VecDeque::from([socket])),
    });
    let (events_tx, mut events_rx) = mpsc::channel(32);
    let mut manager = ConnectionManager::new(
        connector,
        "https://campus.test",
        BackoffPolicy::default(),
        events_tx,
    );

    let db = Database::open(":memory:").unwrap();
    let mut session = Session::restore(&db).unwrap();
    session.login(ada());
    let identity: Identity = session.identity("tok").unwrap();
    manager.open(Some(&identity));
    let opened = events_rx.recv().await.unwrap();
    assert_eq!(manager.accept(opened), Some(ConnectionEvent::Opened));

    let start = "2026-06-01T15:00:00Z";
    server.send(frame(31, "pending", 12, 7, None)).unwrap();
    server.send(frame(99, "pending", 12, 40, None)).unwrap(); // someone else's
    server.send(frame(31, "accepted", 12, 7, None)).unwrap();
    server.send(frame(31, "scheduled", 12, 7, Some(start))).unwrap();
    server.send(frame(31, "scheduled", 12, 7, Some(start))).unwrap(); // duplicate

    let mut outcomes = Vec::new();
    for _ in 0..5 {
        let PushEvent::CompetitionUpdate(record) = next_push(&mut events_rx, &manager).await else {
            panic!("expected competition update");
        };
        outcomes.push(session.apply_competition(&CompetitionEvent::Pushed(record)));
    }

    assert_eq!(
        outcomes,
        vec![
            Outcome::Changed {
                from: CompetitionStatus::None,
                to: CompetitionStatus::Pending
            },
            Outcome::Ignored(IgnoreReason::ForeignId),
            Outcome::Changed {
                from: CompetitionStatus::Pending,
                to: CompetitionStatus::Accepted
            },
            Outcome::Changed {
                from: CompetitionStatus::Accepted,
                to: CompetitionStatus::Scheduled
            },
            Outcome::Unchanged,
        ]
    );

    let slot = session.competition();
    assert_eq!(slot.id(), Some("31"));
    assert!(slot.is_receiver());
    let opponent = slot.opponent().unwrap();
    assert_eq!(opponent.id, "12");
    assert_eq!(opponent.school, "North");
    assert!(slot.needs_tick());

    let due = Utc.with_ymd_and_hms(2026, 6, 1, 15, 0, 0).unwrap();
    let before = due - chrono::Duration::seconds(1);
    assert_eq!(
        session.apply_competition(&CompetitionEvent::Tick(before)),
        Outcome::Unchanged
    );
    assert_eq!(
        session.apply_competition(&CompetitionEvent::Tick(due)),
        Outcome::Changed {
            from: CompetitionStatus::Scheduled,
            to: CompetitionStatus::Ready
        }
    );
    assert!(!session.competition().needs_tick());

    manager.close();
    tokio::time::sleep(Duration::from_secs(5)).await;
    assert!(events_rx.try_recv().is_err());
}
