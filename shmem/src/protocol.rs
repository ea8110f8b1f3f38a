use tracing::warn;

pub const READY: &str = "ready";
pub const PING: &str = "ping";
pub const PONG: &str = "pong";
pub const QUIT: &str = "quit";

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Command<'a> {
    Ping,
    Quit,
    Unknown(&'a str),
}

impl<'a> Command<'a> {
    /// Exact match, no case folding or trimming.
    pub fn parse(request: &'a str) -> Command<'a> {
        match request {
            PING => Command::Ping,
            QUIT => Command::Quit,
            other => Command::Unknown(other),
        }
    }
}

/// Why a responder loop returned.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Shutdown {
    Quit,
    Signalled,
    EndOfInput,
}

/// Reply for `request`, or `None` when the session must end without one.
///
/// Unknown commands are logged and answered with an empty reply so the peer
/// gets its turn back.
pub fn reply_to(request: &str) -> Option<&'static str> {
    match Command::parse(request) {
        Command::Ping => Some(PONG),
        Command::Quit => None,
        Command::Unknown(other) => {
            warn!("Unknown command: {}", other);
            Some("")
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dispatches_by_exact_match() {
        assert_eq!(Command::parse("ping"), Command::Ping);
        assert_eq!(Command::parse("quit"), Command::Quit);
        assert_eq!(Command::parse("PING"), Command::Unknown("PING"));
        assert_eq!(Command::parse(" ping"), Command::Unknown(" ping"));
    }

    #[test]
    fn replies() {
        assert_eq!(reply_to("ping"), Some("pong"));
        assert_eq!(reply_to("quit"), None);
        assert_eq!(reply_to("status"), Some(""));
    }
}
