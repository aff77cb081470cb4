//! Console commands read from stdin

/// One line of operator input
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Originate a message with this content
    Send(String),
    Peers,
    Messages { group_id: Option<String> },
    Stats,
    Relay(bool),
    Sweep,
    Help,
}

pub const HELP: &str = "\
commands:
  <text>              send a message to the mesh
  /peers              list known peers, most recently seen first
  /messages [group]   list stored messages, newest first
  /stats              relay counters
  /relay on|off       toggle rebroadcasting of received messages
  /sweep              run a retention sweep now
  /help               this text";

/// Parse a line; blank lines yield `None`
pub fn parse(line: &str) -> Option<Command> {
    let line = line.trim();
    if line.is_empty() {
        return None;
    }

    let Some(rest) = line.strip_prefix('/') else {
        return Some(Command::Send(line.to_string()));
    };

    let mut parts = rest.split_whitespace();
    let command = match (parts.next(), parts.next()) {
        (Some("peers"), None) => Command::Peers,
        (Some("messages"), group) => Command::Messages {
            group_id: group.map(str::to_string),
        },
        (Some("stats"), None) => Command::Stats,
        (Some("relay"), Some("on")) => Command::Relay(true),
        (Some("relay"), Some("off")) => Command::Relay(false),
        (Some("sweep"), None) => Command::Sweep,
        _ => Command::Help,
    };
    Some(command)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_plain_text_is_sent() {
        assert_eq!(
            parse("  road blocked at mile 4 "),
            Some(Command::Send("road blocked at mile 4".to_string()))
        );
    }

    #[test]
    fn test_blank_lines_are_ignored() {
        assert_eq!(parse(""), None);
        assert_eq!(parse("   "), None);
    }

    #[test]
    fn test_slash_commands() {
        assert_eq!(parse("/peers"), Some(Command::Peers));
        assert_eq!(parse("/stats"), Some(Command::Stats));
        assert_eq!(parse("/sweep"), Some(Command::Sweep));
        assert_eq!(parse("/relay off"), Some(Command::Relay(false)));
        assert_eq!(parse("/relay on"), Some(Command::Relay(true)));
        assert_eq!(
            parse("/messages team-3"),
            Some(Command::Messages {
                group_id: Some("team-3".to_string())
            })
        );
        assert_eq!(parse("/messages"), Some(Command::Messages { group_id: None }));
    }

    #[test]
    fn test_unknown_commands_show_help() {
        assert_eq!(parse("/relay maybe"), Some(Command::Help));
        assert_eq!(parse("/nope"), Some(Command::Help));
    }
}
