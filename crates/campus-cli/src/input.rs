// Command-line input parsing.
//
// Translates one line of operator input into a UserCommand for the app loop,
// or into a request handled by the front end itself.

use campus_app::protocol::UserCommand;

pub const HELP: &str = "\
commands:
  challenge <user-id>   challenge another user
  accept | reject       answer the challenge waiting for you
  cancel                withdraw your pending challenge
  start                 enter a competition that is ready
  school <id>           select a school
  login | logout        sign the configured user in or out
  status                show connection and competition state
  help                  show this text
  quit                  exit";

/// One parsed line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Input {
    Command(UserCommand),
    /// Sign in as the user from `credentials.toml`.
    Login,
    Help,
    Blank,
}

/// Parse one line. Keywords are case-insensitive; arguments are taken as-is.
pub fn parse_command(line: &str) -> Result<Input, String> {
    let mut words = line.split_whitespace();
    let Some(keyword) = words.next() else {
        return Ok(Input::Blank);
    };
    let argument = words.next();
    if words.next().is_some() {
        return Err(format!("too many arguments for `{keyword}`"));
    }

    let keyword = keyword.to_ascii_lowercase();
    let no_argument = |input: Input| match argument {
        None => Ok(input),
        Some(_) => Err(format!("`{keyword}` takes no argument")),
    };

    match keyword.as_str() {
        "challenge" => match argument {
            Some(id) => Ok(Input::Command(UserCommand::Challenge {
                opponent_id: id.to_string(),
            })),
            None => Err("usage: challenge <user-id>".into()),
        },
        "school" => match argument {
            Some(id) => Ok(Input::Command(UserCommand::SelectSchool(id.to_string()))),
            None => Err("usage: school <id>".into()),
        },
        "accept" => no_argument(Input::Command(UserCommand::Accept)),
        "reject" => no_argument(Input::Command(UserCommand::Reject)),
        "cancel" => no_argument(Input::Command(UserCommand::Cancel)),
        "start" => no_argument(Input::Command(UserCommand::Start)),
        "status" => no_argument(Input::Command(UserCommand::Status)),
        "logout" => no_argument(Input::Command(UserCommand::Logout)),
        "quit" | "exit" => no_argument(Input::Command(UserCommand::Quit)),
        "login" => no_argument(Input::Login),
        "help" | "?" => no_argument(Input::Help),
        other => Err(format!("unknown command `{other}` (try `help`)")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn challenge_takes_opponent_id() {
        assert_eq!(
            parse_command("challenge 42"),
            Ok(Input::Command(UserCommand::Challenge {
                opponent_id: "42".into()
            }))
        );
        assert!(parse_command("challenge").is_err());
    }

    #[test]
    fn keywords_ignore_case_and_whitespace() {
        assert_eq!(
            parse_command("  ACCEPT  "),
            Ok(Input::Command(UserCommand::Accept))
        );
        assert_eq!(
            parse_command("School s-7"),
            Ok(Input::Command(UserCommand::SelectSchool("s-7".into())))
        );
    }

    #[test]
    fn blank_line_is_not_an_error() {
        assert_eq!(parse_command(""), Ok(Input::Blank));
        assert_eq!(parse_command("   \t"), Ok(Input::Blank));
    }

    #[test]
    fn front_end_requests() {
        assert_eq!(parse_command("login"), Ok(Input::Login));
        assert_eq!(parse_command("help"), Ok(Input::Help));
        assert_eq!(
            parse_command("exit"),
            Ok(Input::Command(UserCommand::Quit))
        );
    }

    #[test]
    fn rejects_stray_arguments() {
        assert!(parse_command("cancel now").is_err());
        assert!(parse_command("challenge 1 2").is_err());
    }

    #[test]
    fn unknown_command_points_to_help() {
        let err = parse_command("dance").unwrap_err();
        assert!(err.contains("dance"));
        assert!(err.contains("help"));
    }
}
