// Text rendering of UI updates, one line each.

use chrono::{DateTime, Utc};

use campus_app::protocol::{NoticeLevel, UiUpdate};
use campus_core::competition::Competition;
use campus_core::connection::LinkState;
use campus_core::protocol::CompetitionStatus;

pub fn render(update: &UiUpdate, now: DateTime<Utc>) -> String {
    match update {
        UiUpdate::Connection(state) => format!("[link] {}", link_label(*state)),
        UiUpdate::Competition(competition) => {
            format!("[competition] {}", competition_line(competition, now))
        }
        UiUpdate::Chat(message) => format!(
            "[chat] {} {}: {}",
            message.timestamp.format("%H:%M"),
            message.sender_id.as_deref().unwrap_or("?"),
            message.content
        ),
        UiUpdate::Notice { level, message } => {
            let tag = match level {
                NoticeLevel::Info => "info",
                NoticeLevel::Warning => "warn",
                NoticeLevel::Error => "error",
            };
            format!("[{tag}] {message}")
        }
    }
}

fn link_label(state: LinkState) -> String {
    match state {
        LinkState::Idle => "offline".into(),
        LinkState::Connecting => "connecting".into(),
        LinkState::Open => "live".into(),
        LinkState::Waiting { retry_in } => {
            format!("disconnected, retrying in {:.1}s", retry_in.as_secs_f64())
        }
    }
}

fn competition_line(competition: &Competition, now: DateTime<Utc>) -> String {
    let Some(opponent) = competition.opponent() else {
        return "none".into();
    };
    let against = if opponent.school.is_empty() {
        opponent.name.clone()
    } else {
        format!("{} ({})", opponent.name, opponent.school)
    };

    match competition.status() {
        CompetitionStatus::None => "none".into(),
        CompetitionStatus::Pending if competition.is_receiver() => {
            format!("{against} challenged you (accept / reject)")
        }
        CompetitionStatus::Pending => format!("waiting for {against} to answer (cancel)"),
        CompetitionStatus::Accepted => format!("{against} accepted, waiting for a start time"),
        CompetitionStatus::Scheduled => match competition.remaining_until_start(now) {
            Some(left) => format!("vs {against} starts in {}", countdown(left)),
            None => format!("vs {against} scheduled"),
        },
        CompetitionStatus::Ready => format!("vs {against} is ready (start)"),
    }
}

/// `H:MM:SS`, or `MM:SS` under an hour.
fn countdown(left: chrono::Duration) -> String {
    let total = left.num_seconds().max(0);
    let (h, m, s) = (total / 3600, (total % 3600) / 60, total % 60);
    if h > 0 {
        format!("{h}:{m:02}:{s:02}")
    } else {
        format!("{m:02}:{s:02}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use campus_core::competition::CompetitionEvent;
    use campus_core::protocol::{ChatMessage, CompetitionRecord, Participant};
    use chrono::TimeZone;
    use std::time::Duration;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 5, 4, 12, 0, 0).unwrap()
    }

    fn participant(id: &str, name: &str) -> Participant {
        Participant {
            id: id.into(),
            name: name.into(),
            school: "North".into(),
        }
    }

    fn competition(status: CompetitionStatus, me_receiver: bool, date: Option<DateTime<Utc>>) -> Competition {
        let (sender, receiver) = if me_receiver {
            (participant("u-b", "Ben"), participant("u-a", "Ada"))
        } else {
            (participant("u-a", "Ada"), participant("u-b", "Ben"))
        };
        let record = CompetitionRecord {
            id: "c-1".into(),
            status,
            scheduled_date: date,
            sender,
            receiver,
            updated_at: None,
        };
        let mut slot = Competition::default();
        slot.apply(&CompetitionEvent::Pushed(record), "u-a");
        slot
    }

    #[test]
    fn pending_line_depends_on_role() {
        let incoming = competition(CompetitionStatus::Pending, true, None);
        assert_eq!(
            render(&UiUpdate::Competition(incoming), now()),
            "[competition] Ben (North) challenged you (accept / reject)"
        );
        let outgoing = competition(CompetitionStatus::Pending, false, None);
        assert!(render(&UiUpdate::Competition(outgoing), now()).contains("waiting for Ben"));
    }

    #[test]
    fn scheduled_shows_countdown() {
        let date = now() + chrono::Duration::seconds(3_725);
        let slot = competition(CompetitionStatus::Scheduled, false, Some(date));
        assert_eq!(
            render(&UiUpdate::Competition(slot), now()),
            "[competition] vs Ben (North) starts in 1:02:05"
        );

        let soon = competition(
            CompetitionStatus::Scheduled,
            false,
            Some(now() + chrono::Duration::seconds(65)),
        );
        assert!(render(&UiUpdate::Competition(soon), now()).ends_with("starts in 01:05"));
    }

    #[test]
    fn empty_slot() {
        assert_eq!(
            render(&UiUpdate::Competition(Competition::default()), now()),
            "[competition] none"
        );
    }

    #[test]
    fn link_states() {
        assert_eq!(render(&UiUpdate::Connection(LinkState::Open), now()), "[link] live");
        assert_eq!(
            render(
                &UiUpdate::Connection(LinkState::Waiting {
                    retry_in: Duration::from_millis(1500)
                }),
                now()
            ),
            "[link] disconnected, retrying in 1.5s"
        );
    }

    #[test]
    fn chat_and_notices() {
        let chat = UiUpdate::Chat(ChatMessage {
            id: "m".into(),
            sender_id: Some("u-b".into()),
            receiver_id: None,
            content: "hi".into(),
            timestamp: now(),
        });
        assert_eq!(render(&chat, now()), "[chat] 12:00 u-b: hi");
        assert_eq!(render(&UiUpdate::error("boom"), now()), "[error] boom");
    }
}
