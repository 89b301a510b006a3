//! beanstalkd text protocol framing
//!
//! Commands are single CRLF-terminated lines, `put` followed by a body.
//! Replies are a status line, optionally followed by `<bytes>` of body and
//! a trailing CRLF.

use std::time::Duration;

use crate::error::BrokerError;
use crate::job::JobId;

/// Longest tube name the server accepts
pub const MAX_TUBE_NAME_LEN: usize = 200;

/// Command sent to the server
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Command<'a> {
    Use(&'a str),
    Watch(&'a str),
    Ignore(&'a str),
    Put {
        priority: u32,
        delay: Duration,
        ttr: Duration,
        body: &'a [u8],
    },
    ReserveWithTimeout(Duration),
    Delete(JobId),
    Bury(JobId, u32),
    Release(JobId, u32, Duration),
    StatsTube(&'a str),
    Stats,
    ListTubes,
    Quit,
}

impl Command<'_> {
    /// Command verb, used to label errors
    pub(crate) fn name(&self) -> &'static str {
        match self {
            Self::Use(_) => "use",
            Self::Watch(_) => "watch",
            Self::Ignore(_) => "ignore",
            Self::Put { .. } => "put",
            Self::ReserveWithTimeout(_) => "reserve-with-timeout",
            Self::Delete(_) => "delete",
            Self::Bury(..) => "bury",
            Self::Release(..) => "release",
            Self::StatsTube(_) => "stats-tube",
            Self::Stats => "stats",
            Self::ListTubes => "list-tubes",
            Self::Quit => "quit",
        }
    }

    /// Wire encoding, including the trailing CRLF (and body for `put`)
    ///
    /// Durations are sent in whole seconds; sub-second parts are dropped.
    pub(crate) fn encode(&self) -> Vec<u8> {
        let line = match self {
            Self::Use(tube) => format!("use {tube}"),
            Self::Watch(tube) => format!("watch {tube}"),
            Self::Ignore(tube) => format!("ignore {tube}"),
            Self::Put {
                priority,
                delay,
                ttr,
                body,
            } => {
                let mut out = format!(
                    "put {priority} {} {} {}\r\n",
                    delay.as_secs(),
                    ttr.as_secs(),
                    body.len()
                )
                .into_bytes();
                out.extend_from_slice(body);
                out.extend_from_slice(b"\r\n");
                return out;
            }
            Self::ReserveWithTimeout(timeout) => {
                format!("reserve-with-timeout {}", timeout.as_secs())
            }
            Self::Delete(id) => format!("delete {id}"),
            Self::Bury(id, priority) => format!("bury {id} {priority}"),
            Self::Release(id, priority, delay) => {
                format!("release {id} {priority} {}", delay.as_secs())
            }
            Self::StatsTube(tube) => format!("stats-tube {tube}"),
            Self::Stats => "stats".to_string(),
            Self::ListTubes => "list-tubes".to_string(),
            Self::Quit => "quit".to_string(),
        };
        let mut out = line.into_bytes();
        out.extend_from_slice(b"\r\n");
        out
    }
}

/// Status line of a server reply
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Reply {
    Inserted(JobId),
    Buried(Option<JobId>),
    Using(String),
    Watching(u32),
    Reserved { id: JobId, bytes: usize },
    Deleted,
    Released,
    Ok { bytes: usize },
    TimedOut,
    DeadlineSoon,
    NotFound,
    NotIgnored,
    ExpectedCrlf,
    JobTooBig,
    Draining,
}

/// Parse a reply status line (without its CRLF)
///
/// Generic server errors are returned as [`BrokerError::Server`].
pub(crate) fn parse_reply(command: &'static str, line: &str) -> Result<Reply, BrokerError> {
    let unexpected = || BrokerError::UnexpectedResponse {
        command,
        line: line.to_string(),
    };

    let mut parts = line.split(' ');
    let word = parts.next().unwrap_or_default();
    let args: Vec<&str> = parts.collect();

    let number = |idx: usize| -> Result<u64, BrokerError> {
        args.get(idx)
            .and_then(|s| s.parse::<u64>().ok())
            .ok_or_else(unexpected)
    };

    let reply = match (word, args.len()) {
        ("INSERTED", 1) => Reply::Inserted(JobId(number(0)?)),
        ("BURIED", 0) => Reply::Buried(None),
        ("BURIED", 1) => Reply::Buried(Some(JobId(number(0)?))),
        ("USING", 1) => Reply::Using(args[0].to_string()),
        ("WATCHING", 1) => Reply::Watching(u32::try_from(number(0)?).map_err(|_| unexpected())?),
        ("RESERVED", 2) => Reply::Reserved {
            id: JobId(number(0)?),
            bytes: usize::try_from(number(1)?).map_err(|_| unexpected())?,
        },
        ("DELETED", 0) => Reply::Deleted,
        ("RELEASED", 0) => Reply::Released,
        ("OK", 1) => Reply::Ok {
            bytes: usize::try_from(number(0)?).map_err(|_| unexpected())?,
        },
        ("TIMED_OUT", 0) => Reply::TimedOut,
        ("DEADLINE_SOON", 0) => Reply::DeadlineSoon,
        ("NOT_FOUND", 0) => Reply::NotFound,
        ("NOT_IGNORED", 0) => Reply::NotIgnored,
        ("EXPECTED_CRLF", 0) => Reply::ExpectedCrlf,
        ("JOB_TOO_BIG", 0) => Reply::JobTooBig,
        ("DRAINING", 0) => Reply::Draining,
        ("OUT_OF_MEMORY" | "INTERNAL_ERROR" | "BAD_FORMAT" | "UNKNOWN_COMMAND", 0) => {
            return Err(BrokerError::Server {
                command,
                code: word.to_string(),
            })
        }
        _ => return Err(unexpected()),
    };
    Ok(reply)
}

/// Check a tube name against the server's naming rules
///
/// Names are 1-200 bytes of letters, digits and `-+/;.$_()`, and may not
/// start with a hyphen.
pub fn validate_tube_name(name: &str) -> Result<(), BrokerError> {
    let invalid = |reason| {
        Err(BrokerError::InvalidTubeName {
            name: name.to_string(),
            reason,
        })
    };

    if name.is_empty() {
        return invalid("name is empty");
    }
    if name.len() > MAX_TUBE_NAME_LEN {
        return invalid("name is longer than 200 bytes");
    }
    if name.starts_with('-') {
        return invalid("name starts with a hyphen");
    }
    let allowed = |c: char| c.is_ascii_alphanumeric() || "-+/;.$_()".contains(c);
    if !name.chars().all(allowed) {
        return invalid("name contains a character outside [A-Za-z0-9-+/;.$_()]");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_put_appends_body_and_crlf() {
        let cmd = Command::Put {
            priority: 1,
            delay: Duration::ZERO,
            ttr: Duration::from_secs(120),
            body: b"hello",
        };
        assert_eq!(cmd.encode(), b"put 1 0 120 5\r\nhello\r\n".to_vec());
    }

    #[test]
    fn test_encode_truncates_sub_second_durations() {
        let cmd = Command::ReserveWithTimeout(Duration::from_millis(5_900));
        assert_eq!(cmd.encode(), b"reserve-with-timeout 5\r\n".to_vec());

        let cmd = Command::Release(JobId(7), 10, Duration::from_millis(500));
        assert_eq!(cmd.encode(), b"release 7 10 0\r\n".to_vec());
    }

    #[test]
    fn test_encode_simple_commands() {
        assert_eq!(Command::Bury(JobId(3), 99).encode(), b"bury 3 99\r\n".to_vec());
        assert_eq!(Command::Watch("jobs").encode(), b"watch jobs\r\n".to_vec());
        assert_eq!(Command::StatsTube("jobs").encode(), b"stats-tube jobs\r\n".to_vec());
        assert_eq!(Command::ListTubes.encode(), b"list-tubes\r\n".to_vec());
    }

    #[test]
    fn test_parse_reserved() {
        let reply = parse_reply("reserve-with-timeout", "RESERVED 42 18").unwrap();
        assert_eq!(
            reply,
            Reply::Reserved {
                id: JobId(42),
                bytes: 18
            }
        );
    }

    #[test]
    fn test_parse_buried_with_and_without_id() {
        assert_eq!(parse_reply("bury", "BURIED").unwrap(), Reply::Buried(None));
        assert_eq!(
            parse_reply("put", "BURIED 9").unwrap(),
            Reply::Buried(Some(JobId(9)))
        );
    }

    #[test]
    fn test_parse_server_errors() {
        let err = parse_reply("put", "OUT_OF_MEMORY").unwrap_err();
        assert!(matches!(err, BrokerError::Server { code, .. } if code == "OUT_OF_MEMORY"));

        let err = parse_reply("stats", "UNKNOWN_COMMAND").unwrap_err();
        assert!(matches!(err, BrokerError::Server { .. }));
    }

    #[test]
    fn test_parse_rejects_malformed_lines() {
        assert!(matches!(
            parse_reply("put", "INSERTED abc"),
            Err(BrokerError::UnexpectedResponse { .. })
        ));
        assert!(matches!(
            parse_reply("reserve-with-timeout", "RESERVED 1"),
            Err(BrokerError::UnexpectedResponse { .. })
        ));
        assert!(matches!(
            parse_reply("delete", "HELLO"),
            Err(BrokerError::UnexpectedResponse { .. })
        ));
    }

    #[test]
    fn test_tube_name_rules() {
        assert!(validate_tube_name("default").is_ok());
        assert!(validate_tube_name("emails.v2_(eu);$x+y/z").is_ok());
        assert!(validate_tube_name("").is_err());
        assert!(validate_tube_name("-jobs").is_err());
        assert!(validate_tube_name("has space").is_err());
        assert!(validate_tube_name(&"a".repeat(201)).is_err());
        assert!(validate_tube_name(&"a".repeat(200)).is_ok());
    }
}
