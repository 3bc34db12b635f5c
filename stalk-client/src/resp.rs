//! # Reply Parsing
//!
//! Purpose: Read one server reply from a buffered stream: skip inline state
//! echoes, split off and read a declared body, and match the remaining line
//! against the shape the command expects.
//!
//! ## Design Principles
//! 1. **State-Free Parsing**: Each reply is parsed top-down with no carried state.
//! 2. **Buffer Reuse**: Caller provides the line buffer to avoid per-call allocations.
//! 3. **Binary-Safe**: Bodies are read by length and treated as raw bytes.
//! 4. **Fail Fast**: A mismatched reply is classified immediately as a known
//!    failure status or an unexpected reply.

use std::io::{self, BufRead, Read};

use stalk_common::{Status, CRLF, USING_PREFIX, WATCHING_PREFIX};

use crate::error::{StalkError, StalkResult};

/// Largest body buffer allocated before any body bytes are read.
const MAX_PREALLOC: usize = 64 * 1024;

/// Shape of a successful reply: a keyword followed by unsigned integer fields.
///
/// The body size field, when the reply carries a body, is not counted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Expect {
    keyword: &'static str,
    args: usize,
}

impl Expect {
    /// Expects `keyword` followed by exactly `args` integers.
    pub const fn new(keyword: &'static str, args: usize) -> Self {
        Expect { keyword, args }
    }

    /// Keyword of a successful reply.
    pub const fn keyword(&self) -> &'static str {
        self.keyword
    }
}

/// A parsed successful reply.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Reply {
    /// Integer fields after the keyword, in order.
    pub args: Vec<u64>,
    /// Body bytes with the terminator stripped; empty when none was read.
    pub body: Vec<u8>,
}

impl Reply {
    /// Interprets `<KEYWORD> <id>` plus body as a job.
    pub(crate) fn into_job(self) -> Job {
        Job {
            id: self.args.first().copied().unwrap_or_default(),
            body: self.body,
        }
    }
}

/// A job as returned by reserve and the peek commands.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Job {
    pub id: u64,
    pub body: Vec<u8>,
}

/// Reads one reply for `op`.
///
/// I/O failures, including the stream ending mid-reply, become connection
/// errors; a reply of the wrong shape becomes a protocol or unexpected-reply
/// error.
pub(crate) fn read_reply<R: BufRead>(
    reader: &mut R,
    line_buf: &mut Vec<u8>,
    op: &'static str,
    wants_body: bool,
    expect: Expect,
) -> StalkResult<Reply> {
    read_reply_line(reader, line_buf).map_err(|err| StalkError::connection(op, err))?;
    let line = String::from_utf8_lossy(line_buf).into_owned();

    let (head, body) = if wants_body {
        let (head, size) = split_size(&line).ok_or_else(|| reply_fault(op, &line))?;
        let body = read_body(reader, size).map_err(|err| StalkError::connection(op, err))?;
        (head, body)
    } else {
        (line.as_str(), Vec::new())
    };

    let args = match_reply(head, expect).ok_or_else(|| reply_fault(op, &line))?;
    Ok(Reply { args, body })
}

/// Reads the next line that is not a `USING` / `WATCHING` echo.
fn read_reply_line<R: BufRead>(reader: &mut R, buf: &mut Vec<u8>) -> io::Result<()> {
    loop {
        read_line(reader, buf)?;
        if !(buf.starts_with(USING_PREFIX.as_bytes()) || buf.starts_with(WATCHING_PREFIX.as_bytes())) {
            return Ok(());
        }
    }
}

fn read_line<R: BufRead>(reader: &mut R, buf: &mut Vec<u8>) -> io::Result<()> {
    buf.clear();
    let bytes = reader.read_until(b'\n', buf)?;
    if bytes == 0 || buf.last() != Some(&b'\n') {
        return Err(io::Error::new(io::ErrorKind::UnexpectedEof, "connection closed by peer"));
    }
    buf.pop();
    if buf.last() == Some(&b'\r') {
        buf.pop();
    }
    Ok(())
}

/// Splits the trailing body size off a reply line.
fn split_size(line: &str) -> Option<(&str, usize)> {
    let (head, size) = line.rsplit_once(' ')?;
    let size = size.parse().ok()?;
    Some((head, size))
}

fn read_body<R: BufRead>(reader: &mut R, size: usize) -> io::Result<Vec<u8>> {
    // Body plus its CRLF terminator.
    let total = size
        .checked_add(CRLF.len())
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidData, "job body size out of range"))?;
    // The buffer grows with the bytes that arrive, not with the declared size.
    let mut data = Vec::with_capacity(total.min(MAX_PREALLOC));
    reader.by_ref().take(total as u64).read_to_end(&mut data)?;
    if data.len() < total {
        return Err(io::Error::new(io::ErrorKind::UnexpectedEof, "connection closed mid body"));
    }
    if !data.ends_with(CRLF) {
        return Err(io::Error::new(io::ErrorKind::InvalidData, "job body not terminated by CRLF"));
    }
    data.truncate(size);
    Ok(data)
}

fn match_reply(line: &str, expect: Expect) -> Option<Vec<u64>> {
    let mut words = line.split(' ');
    if words.next()? != expect.keyword {
        return None;
    }
    let args = words.map(|word| word.parse().ok()).collect::<Option<Vec<u64>>>()?;
    (args.len() == expect.args).then_some(args)
}

fn reply_fault(op: &'static str, line: &str) -> StalkError {
    match Status::from_reply(line) {
        Some(status) => StalkError::Protocol { op, status },
        None => StalkError::UnexpectedReply {
            op,
            line: line.to_string(),
        },
    }
}
