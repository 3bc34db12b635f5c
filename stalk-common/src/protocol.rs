//! # Wire Protocol Definitions
//!
//! Purpose: Define the line-oriented text protocol spoken between the driver
//! and a work-queue server: command framing, reply status keywords, and the
//! YAML-ish bodies returned by the stats and list commands.
//!
//! ## Design Principles
//!
//! 1. **Canonical Arguments**: Every argument has one text form. Integers are
//!    unsigned decimal and durations are whole seconds.
//! 2. **Minimal Allocation**: Commands are encoded straight into a caller
//!    buffer that the connection reuses across requests.
//! 3. **Closed Status Set**: Failure replies map onto the `Status` enum so
//!    callers can match on them instead of comparing strings.
//!
//! ## Frame Layout
//!
//! ```text
//! command:  <op> SP <arg> ... [SP <bytes>] CRLF [<body> CRLF]
//!
//!           put 0 0 60 5\r\n
//!           hello\r\n
//!
//! reply:    <KEYWORD> [SP <arg> ...] [SP <bytes>] CRLF [<body> CRLF]
//!
//!           RESERVED 12 5\r\n
//!           hello\r\n
//!
//! echoes:   USING <tube> CRLF       (reply to `use`)
//!           WATCHING <count> CRLF   (reply to `watch` / `ignore`)
//! ```

use std::borrow::Cow;
use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

use crate::types::TubeName;

/// Line terminator for commands, replies and bodies.
pub const CRLF: &[u8] = b"\r\n";

/// Prefix of the echo sent in reply to `use`.
pub const USING_PREFIX: &str = "USING ";

/// Prefix of the echo sent in reply to `watch` and `ignore`.
pub const WATCHING_PREFIX: &str = "WATCHING ";

const YAML_HEAD: &str = "---";

/// Failure keywords a server may answer with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Status {
    /// The command line was malformed.
    BadFormat,
    /// The server ran out of memory and buried the job.
    Buried,
    /// A reserved job's time-to-run is about to expire.
    DeadlineSoon,
    /// The server is draining and refuses new jobs.
    Draining,
    /// A job body was not followed by CRLF.
    ExpectedCrlf,
    /// The server hit an internal error.
    InternalError,
    /// The job body is larger than the server accepts.
    JobTooBig,
    /// The job or tube does not exist.
    NotFound,
    /// The last watched tube cannot be ignored.
    NotIgnored,
    /// The server could not allocate memory for the request.
    OutOfMemory,
    /// No job arrived before the reserve timeout.
    TimedOut,
    /// The server does not know the command.
    UnknownCommand,
}

impl Status {
    /// All known statuses, in keyword order.
    pub const ALL: [Status; 12] = [
        Status::BadFormat,
        Status::Buried,
        Status::DeadlineSoon,
        Status::Draining,
        Status::ExpectedCrlf,
        Status::InternalError,
        Status::JobTooBig,
        Status::NotFound,
        Status::NotIgnored,
        Status::OutOfMemory,
        Status::TimedOut,
        Status::UnknownCommand,
    ];

    /// Returns the keyword as it appears on the wire.
    pub const fn keyword(self) -> &'static str {
        match self {
            Status::BadFormat => "BAD_FORMAT",
            Status::Buried => "BURIED",
            Status::DeadlineSoon => "DEADLINE_SOON",
            Status::Draining => "DRAINING",
            Status::ExpectedCrlf => "EXPECTED_CRLF",
            Status::InternalError => "INTERNAL_ERROR",
            Status::JobTooBig => "JOB_TOO_BIG",
            Status::NotFound => "NOT_FOUND",
            Status::NotIgnored => "NOT_IGNORED",
            Status::OutOfMemory => "OUT_OF_MEMORY",
            Status::TimedOut => "TIMED_OUT",
            Status::UnknownCommand => "UNKNOWN_COMMAND",
        }
    }

    /// Looks up a status by its wire keyword.
    pub fn from_keyword(word: &str) -> Option<Self> {
        Status::ALL.into_iter().find(|status| status.keyword() == word)
    }

    /// Derives a status from the first word of a reply line.
    pub fn from_reply(line: &str) -> Option<Self> {
        line.split(' ').next().and_then(Status::from_keyword)
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            Status::BadFormat => "bad command format",
            Status::Buried => "buried",
            Status::DeadlineSoon => "deadline soon",
            Status::Draining => "server in drain mode",
            Status::ExpectedCrlf => "expected CR LF",
            Status::InternalError => "internal error",
            Status::JobTooBig => "job too big",
            Status::NotFound => "not found",
            Status::NotIgnored => "not ignored",
            Status::OutOfMemory => "server is out of memory",
            Status::TimedOut => "timeout for reserve",
            Status::UnknownCommand => "unknown command",
        };
        f.write_str(text)
    }
}

/// One argument of a command line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Arg<'a> {
    /// Unsigned decimal integer (job id, priority, count).
    Int(u64),
    /// Duration sent as whole seconds.
    Secs(Duration),
    /// Bare word, such as a tube name.
    Word(&'a str),
}

impl Arg<'_> {
    /// Appends the canonical text form to `out`.
    pub fn encode(&self, out: &mut Vec<u8>) {
        match self {
            Arg::Int(value) => push_u64(out, *value),
            Arg::Secs(duration) => push_u64(out, duration_secs(*duration)),
            Arg::Word(word) => out.extend_from_slice(word.as_bytes()),
        }
    }
}

impl From<u64> for Arg<'_> {
    fn from(value: u64) -> Self {
        Arg::Int(value)
    }
}

impl From<u32> for Arg<'_> {
    fn from(value: u32) -> Self {
        Arg::Int(u64::from(value))
    }
}

impl From<Duration> for Arg<'_> {
    fn from(value: Duration) -> Self {
        Arg::Secs(value)
    }
}

impl<'a> From<&'a str> for Arg<'a> {
    fn from(value: &'a str) -> Self {
        Arg::Word(value)
    }
}

impl<'a> From<&'a TubeName> for Arg<'a> {
    fn from(value: &'a TubeName) -> Self {
        Arg::Word(value.as_str())
    }
}

impl fmt::Display for Arg<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Arg::Int(value) => write!(f, "{value}"),
            Arg::Secs(duration) => write!(f, "{}", duration_secs(*duration)),
            Arg::Word(word) => f.write_str(word),
        }
    }
}

/// Whole seconds of `duration`, with any fraction truncated.
///
/// `Duration` cannot be negative; spans computed with `saturating_sub` or
/// `Instant::saturating_duration_since` therefore floor at zero before they
/// get here.
#[inline]
pub fn duration_secs(duration: Duration) -> u64 {
    duration.as_secs()
}

/// Text form of a duration argument.
pub fn format_duration(duration: Duration) -> String {
    duration_secs(duration).to_string()
}

/// Encodes one command line into `out`.
///
/// When `body_len` is set it is appended as the trailing byte-count argument;
/// the body itself is written separately by the caller.
pub fn encode_command(out: &mut Vec<u8>, op: &str, args: &[Arg<'_>], body_len: Option<usize>) {
    out.extend_from_slice(op.as_bytes());
    for arg in args {
        out.push(b' ');
        arg.encode(out);
    }
    if let Some(len) = body_len {
        out.push(b' ');
        push_u64(out, len as u64);
    }
    out.extend_from_slice(CRLF);
}

/// Parses a YAML dictionary body (`stats`, `stats-job`, `stats-tube`).
///
/// Lines without a `": "` separator are skipped.
pub fn parse_dict(body: &[u8]) -> BTreeMap<String, String> {
    yaml_lines(body)
        .filter_map(|line| {
            let (key, value) = line.split_once(": ")?;
            Some((key.to_string(), value.to_string()))
        })
        .collect()
}

/// Parses a YAML list body (`list-tubes`).
///
/// Lines that are not `"- "` items are skipped.
pub fn parse_list(body: &[u8]) -> Vec<String> {
    yaml_lines(body)
        .filter_map(|line| line.strip_prefix("- ").map(str::to_string))
        .collect()
}

/// Splits a body into lines, decoding each one on its own so a stray invalid
/// byte only garbles the line it sits on.
fn yaml_lines(body: &[u8]) -> impl Iterator<Item = Cow<'_, str>> {
    body.split(|byte| *byte == b'\n')
        .map(|line| line.strip_suffix(b"\r").unwrap_or(line))
        .filter(|line| !line.is_empty() && *line != YAML_HEAD.as_bytes())
        .map(String::from_utf8_lossy)
}

fn push_u64(out: &mut Vec<u8>, mut value: u64) {
    // Write digits into a small stack buffer to avoid heap allocations.
    let mut buf = [0u8; 20];
    let mut len = 0;
    if value == 0 {
        buf[0] = b'0';
        len = 1;
    } else {
        while value > 0 {
            buf[len] = b'0' + (value % 10) as u8;
            value /= 10;
            len += 1;
        }
    }
    for idx in (0..len).rev() {
        out.push(buf[idx]);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_duration() {
        let cases = [
            (Duration::from_secs(100), "100"),
            (Duration::ZERO, "0"),
            (Duration::from_millis(1900), "1"),
            (Duration::from_nanos(999_999_999), "0"),
            (Duration::from_secs(1).saturating_sub(Duration::from_secs(2)), "0"),
        ];
        for (duration, want) in cases {
            assert_eq!(format_duration(duration), want, "{duration:?}");
        }
    }

    #[test]
    fn test_encode_command_without_body() {
        let mut buf = Vec::new();
        encode_command(&mut buf, "reserve-with-timeout", &[Duration::from_secs(1).into()], None);
        assert_eq!(&buf, b"reserve-with-timeout 1\r\n");
    }

    #[test]
    fn test_encode_command_appends_body_len() {
        let mut buf = Vec::new();
        let args = [Arg::from(1024u32), Arg::from(Duration::ZERO), Arg::from(Duration::from_secs(60))];
        encode_command(&mut buf, "put", &args, Some(5));
        assert_eq!(&buf, b"put 1024 0 60 5\r\n");
    }

    #[test]
    fn test_encode_words_and_large_ints() {
        let tube = TubeName::new("jobs").unwrap();
        let mut buf = Vec::new();
        encode_command(&mut buf, "stats-tube", &[Arg::from(&tube)], None);
        encode_command(&mut buf, "delete", &[Arg::Int(u64::MAX)], None);
        assert_eq!(&buf, b"stats-tube jobs\r\ndelete 18446744073709551615\r\n");
    }

    #[test]
    fn test_arg_display_matches_encoding() {
        let args = [Arg::Int(0), Arg::Secs(Duration::from_millis(2500)), Arg::Word("tube")];
        for arg in args {
            let mut buf = Vec::new();
            arg.encode(&mut buf);
            assert_eq!(String::from_utf8(buf).unwrap(), arg.to_string());
        }
    }

    #[test]
    fn test_status_keywords_roundtrip() {
        for status in Status::ALL {
            assert_eq!(Status::from_keyword(status.keyword()), Some(status));
        }
        assert_eq!(Status::from_keyword("RESERVED"), None);
        assert_eq!(Status::from_reply("NOT_FOUND"), Some(Status::NotFound));
        assert_eq!(Status::from_reply("DEADLINE_SOON extra"), Some(Status::DeadlineSoon));
        assert_eq!(Status::from_reply(""), None);
    }

    #[test]
    fn test_parse_dict() {
        let body = b"---\ncurrent-jobs-ready: 3\nname: default\nbroken line\n";
        let dict = parse_dict(body);
        assert_eq!(dict.len(), 2);
        assert_eq!(dict["current-jobs-ready"], "3");
        assert_eq!(dict["name"], "default");
    }

    #[test]
    fn test_parse_list() {
        let body = b"---\n- default\n- emails\nnot an item\n";
        assert_eq!(parse_list(body), vec!["default".to_string(), "emails".to_string()]);
        assert!(parse_list(b"").is_empty());
    }

    #[test]
    fn test_invalid_utf8_only_garbles_its_line() {
        let dict = parse_dict(b"---\nname: a\xffb\r\nuptime: 5\n");
        assert_eq!(dict.get("uptime").map(String::as_str), Some("5"));
        assert_eq!(dict.get("name").map(String::as_str), Some("a\u{FFFD}b"));

        let list = parse_list(b"---\n- \xfe\n- default\n");
        assert_eq!(list, vec!["\u{FFFD}".to_string(), "default".to_string()]);
    }
}
