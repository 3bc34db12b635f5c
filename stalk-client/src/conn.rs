//! # Protocol Driver
//!
//! Purpose: Own one byte stream to the server, frame commands, read their
//! replies in strict FIFO order, keep the connection's used tube and watched
//! set in step with what the caller asks for, and recover once from a peer
//! that closed the stream.
//!
//! ## Design Principles
//! 1. **Two Primitives**: Every command is `cmd` (write) followed by
//!    `read_resp` (read). Callers may pipeline several `cmd`s before reading.
//! 2. **Lazy Tube State**: `use` / `watch` / `ignore` are only sent when a
//!    command needs a different tube state than the one already tracked, and
//!    they ride in the same flush as the command.
//! 3. **Bounded Recovery**: An end-of-file triggers one reconnect and one retry.
//!    Nothing else is retried.
//! 4. **Buffer Reuse**: The line and write buffers live on the connection.

use std::collections::{BTreeMap, BTreeSet};
use std::io::{self, BufReader, Read, Write};
use std::net::{TcpStream, ToSocketAddrs};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use serde::Deserialize;
use stalk_common::{encode_command, parse_dict, parse_list, Arg, TubeName, CRLF};
use tracing::{debug, info, warn};

use crate::error::{StalkError, StalkResult};
use crate::resp::{read_reply, Expect, Job, Reply};
use crate::tube::Tube;
use crate::tubeset::{tube_set_from, TubeSet};

/// Default number of dial attempts made by `Conn::reconnect`.
pub const DEFAULT_RECONNECT_ATTEMPTS: usize = 120;

/// Default pause between reconnect attempts.
pub const DEFAULT_RECONNECT_DELAY: Duration = Duration::from_secs(1);

/// Bidirectional byte stream a connection can run over.
pub trait Stream: Read + Write + Send {}

impl<T: Read + Write + Send> Stream for T {}

/// Configuration for a single connection.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ConnConfig {
    /// Optional TCP read timeout.
    #[serde(with = "humantime_serde")]
    pub read_timeout: Option<Duration>,
    /// Optional TCP write timeout.
    #[serde(with = "humantime_serde")]
    pub write_timeout: Option<Duration>,
    /// Optional TCP connect timeout, also used for reconnects.
    #[serde(with = "humantime_serde")]
    pub connect_timeout: Option<Duration>,
    /// Dial attempts made by one reconnect.
    pub reconnect_attempts: usize,
    /// Pause between failed reconnect attempts.
    #[serde(with = "humantime_serde")]
    pub reconnect_delay: Duration,
}

impl Default for ConnConfig {
    fn default() -> Self {
        ConnConfig {
            read_timeout: None,
            write_timeout: None,
            connect_timeout: None,
            reconnect_attempts: DEFAULT_RECONNECT_ATTEMPTS,
            reconnect_delay: DEFAULT_RECONNECT_DELAY,
        }
    }
}

/// Token for one command in flight.
///
/// Returned by `Conn::cmd` and consumed by `Conn::read_resp`. Tokens must be
/// consumed in the order they were issued.
#[derive(Debug)]
#[must_use = "the reply to every command must be read"]
pub struct Request {
    id: u64,
    op: &'static str,
}

impl Request {
    /// Sequence number on its connection.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Operation name the command was sent with.
    pub fn op(&self) -> &'static str {
        self.op
    }
}

/// Request sequencing for the FIFO pipeline.
#[derive(Debug, Default)]
struct Pipeline {
    next_id: u64,
    // Id of the only token whose reply may be read next.
    expected: u64,
}

impl Pipeline {
    fn issue(&mut self) -> u64 {
        let id = self.next_id;
        self.next_id += 1;
        id
    }

    fn answer(&mut self, req: &Request) -> StalkResult<()> {
        if req.id != self.expected {
            return Err(StalkError::OutOfOrder {
                op: req.op,
                id: req.id,
                expected: self.expected,
            });
        }
        self.expected += 1;
        Ok(())
    }

    /// Abandons every outstanding token; their replies died with the stream.
    fn abandon(&mut self) {
        self.expected = self.next_id;
    }
}

/// A connection to a work-queue server.
///
/// Carries a default tube (for `put`, `peek_ready`, `kick`, ...) and a default
/// tube set (for `reserve`); `use_tube` and `watch` change them. Other tubes
/// are reached through `tube_named` / `tube_set_named` handles.
///
/// Not for concurrent use: every operation takes `&mut self`. Share
/// connections between threads through a `Pool`.
pub struct Conn {
    // Buffered reader reduces syscalls while still allowing direct writes.
    reader: BufReader<Box<dyn Stream>>,
    line_buf: Vec<u8>,
    write_buf: Vec<u8>,
    addr: String,
    config: ConnConfig,
    pipeline: Pipeline,
    // Tube state on the server side of this stream.
    used: TubeName,
    watched: BTreeSet<TubeName>,
    // What the delegating methods act on.
    default_tube: TubeName,
    default_tube_set: BTreeSet<TubeName>,
}

impl Conn {
    /// Connects to `addr` over TCP with the default configuration.
    pub fn dial(addr: impl Into<String>) -> StalkResult<Self> {
        Self::dial_with_config(addr, ConnConfig::default())
    }

    /// Connects to `addr` over TCP.
    pub fn dial_with_config(addr: impl Into<String>, config: ConnConfig) -> StalkResult<Self> {
        let addr = addr.into();
        let stream = connect_stream(&addr, &config).map_err(|err| StalkError::Dial {
            addr: addr.clone(),
            source: Arc::new(err),
        })?;
        debug!(%addr, "connected");
        Ok(Self::from_stream(stream, addr, config))
    }

    /// Wraps an already-open stream.
    ///
    /// `addr` is only used when the stream has to be re-established, which
    /// always dials TCP.
    pub fn from_stream(stream: impl Stream + 'static, addr: impl Into<String>, config: ConnConfig) -> Self {
        Conn {
            reader: BufReader::new(Box::new(stream)),
            line_buf: Vec::with_capacity(128),
            write_buf: Vec::with_capacity(256),
            addr: addr.into(),
            config,
            pipeline: Pipeline::default(),
            used: TubeName::default_tube(),
            watched: BTreeSet::from([TubeName::default_tube()]),
            default_tube: TubeName::default_tube(),
            default_tube_set: BTreeSet::from([TubeName::default_tube()]),
        }
    }

    /// Address the connection dials on reconnect.
    pub fn addr(&self) -> &str {
        &self.addr
    }

    pub fn config(&self) -> &ConnConfig {
        &self.config
    }

    /// Tube the server currently has in use for this connection.
    pub fn used_tube(&self) -> &TubeName {
        &self.used
    }

    /// Tubes the server currently watches for this connection.
    pub fn watched_tubes(&self) -> &BTreeSet<TubeName> {
        &self.watched
    }

    pub fn default_tube(&self) -> &TubeName {
        &self.default_tube
    }

    pub fn default_tube_set(&self) -> &BTreeSet<TubeName> {
        &self.default_tube_set
    }

    /// Makes `name` the tube the delegating methods (`put`, `kick`, ...) use.
    ///
    /// Nothing is sent until the next command that needs it.
    pub fn use_tube(&mut self, name: &str) -> StalkResult<()> {
        self.default_tube = TubeName::new(name).map_err(|reason| StalkError::invalid_name(name, reason))?;
        Ok(())
    }

    /// Makes `names` the tube set `reserve` draws from.
    pub fn watch<I, S>(&mut self, names: I) -> StalkResult<()>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        self.default_tube_set = tube_set_from(names)?;
        Ok(())
    }

    /// Handle for the default tube.
    pub fn tube(&mut self) -> Tube<'_> {
        let name = self.default_tube.clone();
        Tube::new(self, name)
    }

    /// Handle for another tube on this connection.
    pub fn tube_named(&mut self, name: &str) -> StalkResult<Tube<'_>> {
        let name = TubeName::new(name).map_err(|reason| StalkError::invalid_name(name, reason))?;
        Ok(Tube::new(self, name))
    }

    /// Handle for the default tube set.
    pub fn tube_set(&mut self) -> TubeSet<'_> {
        let names = self.default_tube_set.clone();
        TubeSet::new(self, names)
    }

    /// Handle for another set of tubes on this connection.
    pub fn tube_set_named<I, S>(&mut self, names: I) -> StalkResult<TubeSet<'_>>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let names = tube_set_from(names)?;
        Ok(TubeSet::new(self, names))
    }

    /// Writes one command, preceded by any tube changes it needs.
    ///
    /// `use_tube` is switched to when it differs from the tube in use.
    /// `watch` replaces the watched set: `watch` lines go out for added
    /// tubes, then `ignore` lines for dropped ones. `body`, when present, is
    /// sent after the command line and its length is appended as the last
    /// argument. Everything goes out in one flush.
    pub fn cmd(
        &mut self,
        use_tube: Option<&TubeName>,
        watch: Option<&BTreeSet<TubeName>>,
        body: Option<&[u8]>,
        op: &'static str,
        args: &[Arg<'_>],
    ) -> StalkResult<Request> {
        if watch.is_some_and(BTreeSet::is_empty) {
            return Err(StalkError::EmptyTubeSet);
        }

        self.write_buf.clear();

        let switch_to = use_tube.filter(|tube| **tube != self.used);
        if let Some(tube) = switch_to {
            encode_command(&mut self.write_buf, "use", &[Arg::from(tube)], None);
        }
        if let Some(wanted) = watch {
            for name in wanted.difference(&self.watched) {
                encode_command(&mut self.write_buf, "watch", &[Arg::from(name)], None);
            }
            for name in self.watched.difference(wanted) {
                encode_command(&mut self.write_buf, "ignore", &[Arg::from(name)], None);
            }
        }

        encode_command(&mut self.write_buf, op, args, body.map(<[u8]>::len));
        if let Some(body) = body {
            self.write_buf.extend_from_slice(body);
            self.write_buf.extend_from_slice(CRLF);
        }

        let stream = self.reader.get_mut();
        stream
            .write_all(&self.write_buf)
            .and_then(|()| stream.flush())
            .map_err(|err| StalkError::connection(op, err))?;

        let id = self.pipeline.issue();
        if let Some(tube) = switch_to {
            self.used = tube.clone();
        }
        if let Some(wanted) = watch {
            self.watched = wanted.clone();
        }
        Ok(Request { id, op })
    }

    /// Reads the reply to `req`.
    ///
    /// Leading `USING` / `WATCHING` echoes from pipelined tube changes are
    /// skipped. With `wants_body` the trailing size field is split off and
    /// that many bytes of body are read. The rest of the line must match
    /// `expect`; otherwise the reply's status keyword becomes the error.
    pub fn read_resp(&mut self, req: Request, wants_body: bool, expect: Expect) -> StalkResult<Reply> {
        self.pipeline.answer(&req)?;
        read_reply(&mut self.reader, &mut self.line_buf, req.op, wants_body, expect)
    }

    /// Re-establishes the stream after the server went away.
    ///
    /// Dials `addr` up to `reconnect_attempts` times, sleeping
    /// `reconnect_delay` between failures. On success the tube state goes back
    /// to `"default"` (used, watched, and the default tube set); subscriptions
    /// made before the drop are not replayed. On exhaustion the last dial
    /// error is returned.
    pub fn reconnect(&mut self) -> StalkResult<()> {
        let attempts = self.config.reconnect_attempts;
        let mut last_err = None;

        for attempt in 1..=attempts {
            match connect_stream(&self.addr, &self.config) {
                Ok(stream) => {
                    self.reset(Box::new(stream));
                    info!(addr = %self.addr, attempt, "reconnected");
                    return Ok(());
                }
                Err(err) => {
                    warn!(addr = %self.addr, attempt, attempts, error = %err, "reconnect attempt failed");
                    last_err = Some(err);
                    if attempt < attempts {
                        thread::sleep(self.config.reconnect_delay);
                    }
                }
            }
        }

        let err = last_err.unwrap_or_else(|| io::Error::new(io::ErrorKind::Other, "no reconnect attempts configured"));
        Err(StalkError::Dial {
            addr: self.addr.clone(),
            source: Arc::new(err),
        })
    }

    fn reset(&mut self, stream: Box<dyn Stream>) {
        self.reader = BufReader::new(stream);
        self.pipeline.abandon();
        self.used = TubeName::default_tube();
        self.watched = BTreeSet::from([TubeName::default_tube()]);
        self.default_tube_set = BTreeSet::from([TubeName::default_tube()]);
    }

    /// Runs `attempt`, and once more after a reconnect if the peer closed the
    /// stream.
    ///
    /// If the reconnect itself fails, the first end-of-file error is
    /// returned. A second end-of-file is returned as is.
    pub(crate) fn with_reconnect<T>(&mut self, mut attempt: impl FnMut(&mut Conn) -> StalkResult<T>) -> StalkResult<T> {
        let mut retried = false;
        loop {
            match attempt(&mut *self) {
                Err(err) if err.is_eof() && !retried => {
                    retried = true;
                    warn!(addr = %self.addr, op = err.op().unwrap_or_default(), "server closed the connection");
                    if let Err(dial_err) = self.reconnect() {
                        debug!(error = %dial_err, "giving up after reconnect failure");
                        return Err(err);
                    }
                }
                result => return result,
            }
        }
    }

    /// Closes the connection.
    ///
    /// The stream is shut by dropping it, which cannot fail; the `Result`
    /// matches `JobConn::close`, whose implementors may have a fallible close.
    pub fn close(self) -> StalkResult<()> {
        debug!(addr = %self.addr, "closing connection");
        Ok(())
    }

    /// Deletes a job.
    pub fn delete(&mut self, id: u64) -> StalkResult<()> {
        self.with_reconnect(|conn| {
            let req = conn.cmd(None, None, None, "delete", &[id.into()])?;
            conn.read_resp(req, false, Expect::new("DELETED", 0))?;
            Ok(())
        })
    }

    /// Puts a reserved job back in the ready queue with priority `pri` after
    /// `delay`.
    pub fn release(&mut self, id: u64, pri: u32, delay: Duration) -> StalkResult<()> {
        self.with_reconnect(|conn| {
            let req = conn.cmd(None, None, None, "release", &[id.into(), pri.into(), delay.into()])?;
            conn.read_resp(req, false, Expect::new("RELEASED", 0))?;
            Ok(())
        })
    }

    /// Moves a reserved job to its tube's buried list with priority `pri`.
    pub fn bury(&mut self, id: u64, pri: u32) -> StalkResult<()> {
        self.with_reconnect(|conn| {
            let req = conn.cmd(None, None, None, "bury", &[id.into(), pri.into()])?;
            conn.read_resp(req, false, Expect::new("BURIED", 0))?;
            Ok(())
        })
    }

    /// Restarts the time-to-run of a job reserved by this connection.
    pub fn touch(&mut self, id: u64) -> StalkResult<()> {
        self.with_reconnect(|conn| {
            let req = conn.cmd(None, None, None, "touch", &[id.into()])?;
            conn.read_resp(req, false, Expect::new("TOUCHED", 0))?;
            Ok(())
        })
    }

    /// Fetches a copy of a job.
    pub fn peek(&mut self, id: u64) -> StalkResult<Job> {
        self.with_reconnect(|conn| {
            let req = conn.cmd(None, None, None, "peek", &[id.into()])?;
            Ok(conn.read_resp(req, true, Expect::new("FOUND", 1))?.into_job())
        })
    }

    /// Server-wide statistics.
    pub fn stats(&mut self) -> StalkResult<BTreeMap<String, String>> {
        self.with_reconnect(|conn| {
            let req = conn.cmd(None, None, None, "stats", &[])?;
            let reply = conn.read_resp(req, true, Expect::new("OK", 0))?;
            Ok(parse_dict(&reply.body))
        })
    }

    /// Statistics for one job.
    pub fn stats_job(&mut self, id: u64) -> StalkResult<BTreeMap<String, String>> {
        self.with_reconnect(|conn| {
            let req = conn.cmd(None, None, None, "stats-job", &[id.into()])?;
            let reply = conn.read_resp(req, true, Expect::new("OK", 0))?;
            Ok(parse_dict(&reply.body))
        })
    }

    /// Names of all tubes that exist on the server.
    pub fn list_tubes(&mut self) -> StalkResult<Vec<String>> {
        self.with_reconnect(|conn| {
            let req = conn.cmd(None, None, None, "list-tubes", &[])?;
            let reply = conn.read_resp(req, true, Expect::new("OK", 0))?;
            Ok(parse_list(&reply.body))
        })
    }

    /// `Tube::put` on the default tube.
    pub fn put(&mut self, body: &[u8], pri: u32, delay: Duration, ttr: Duration) -> StalkResult<u64> {
        self.tube().put(body, pri, delay, ttr)
    }

    /// `Tube::peek_ready` on the default tube.
    pub fn peek_ready(&mut self) -> StalkResult<Job> {
        self.tube().peek_ready()
    }

    /// `Tube::peek_delayed` on the default tube.
    pub fn peek_delayed(&mut self) -> StalkResult<Job> {
        self.tube().peek_delayed()
    }

    /// `Tube::peek_buried` on the default tube.
    pub fn peek_buried(&mut self) -> StalkResult<Job> {
        self.tube().peek_buried()
    }

    /// `Tube::kick` on the default tube.
    pub fn kick(&mut self, bound: u64) -> StalkResult<u64> {
        self.tube().kick(bound)
    }

    /// `Tube::pause` on the default tube.
    pub fn pause_tube(&mut self, delay: Duration) -> StalkResult<()> {
        self.tube().pause(delay)
    }

    /// `Tube::stats` on the default tube.
    pub fn stats_tube(&mut self) -> StalkResult<BTreeMap<String, String>> {
        self.tube().stats()
    }

    /// `TubeSet::reserve` on the default tube set.
    pub fn reserve(&mut self, timeout: Option<Duration>) -> StalkResult<Job> {
        self.tube_set().reserve(timeout)
    }
}

fn connect_stream(addr: &str, config: &ConnConfig) -> io::Result<TcpStream> {
    let stream = match config.connect_timeout {
        Some(timeout) => connect_with_timeout(addr, timeout)?,
        None => TcpStream::connect(addr)?,
    };
    if let Some(timeout) = config.read_timeout {
        stream.set_read_timeout(Some(timeout))?;
    }
    if let Some(timeout) = config.write_timeout {
        stream.set_write_timeout(Some(timeout))?;
    }
    // Disable Nagle to keep request latency low for small commands.
    stream.set_nodelay(true)?;
    Ok(stream)
}

fn connect_with_timeout(addr: &str, timeout: Duration) -> io::Result<TcpStream> {
    let mut last_err = None;
    for socket_addr in addr.to_socket_addrs()? {
        match TcpStream::connect_timeout(&socket_addr, timeout) {
            Ok(stream) => return Ok(stream),
            Err(err) => last_err = Some(err),
        }
    }
    Err(last_err.unwrap_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "address resolved to nothing")))
}
