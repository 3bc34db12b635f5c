//! # Tube Handle
//!
//! Purpose: Run producer-side commands against one named tube. Each command
//! asks the connection to have that tube in use; the `use` line is only sent
//! when the connection is on a different tube.

use std::collections::BTreeMap;
use std::time::Duration;

use stalk_common::{parse_dict, TubeName};

use crate::conn::Conn;
use crate::error::StalkResult;
use crate::resp::{Expect, Job};

/// A named tube on a borrowed connection.
pub struct Tube<'c> {
    conn: &'c mut Conn,
    name: TubeName,
}

impl<'c> Tube<'c> {
    pub(crate) fn new(conn: &'c mut Conn, name: TubeName) -> Self {
        Tube { conn, name }
    }

    pub fn name(&self) -> &TubeName {
        &self.name
    }

    /// Inserts a job and returns its id.
    ///
    /// `delay` holds the job back before it becomes ready; `ttr` is how long
    /// a worker may hold it once reserved. Both go out as whole seconds.
    pub fn put(&mut self, body: &[u8], pri: u32, delay: Duration, ttr: Duration) -> StalkResult<u64> {
        let name = &self.name;
        self.conn.with_reconnect(|conn| {
            let req = conn.cmd(Some(name), None, Some(body), "put", &[pri.into(), delay.into(), ttr.into()])?;
            let reply = conn.read_resp(req, false, Expect::new("INSERTED", 1))?;
            Ok(reply.args[0])
        })
    }

    /// Next ready job in this tube.
    pub fn peek_ready(&mut self) -> StalkResult<Job> {
        self.peek_state("peek-ready")
    }

    /// Delayed job with the shortest remaining delay.
    pub fn peek_delayed(&mut self) -> StalkResult<Job> {
        self.peek_state("peek-delayed")
    }

    /// Next job in the buried list.
    pub fn peek_buried(&mut self) -> StalkResult<Job> {
        self.peek_state("peek-buried")
    }

    fn peek_state(&mut self, op: &'static str) -> StalkResult<Job> {
        let name = &self.name;
        self.conn.with_reconnect(|conn| {
            let req = conn.cmd(Some(name), None, None, op, &[])?;
            Ok(conn.read_resp(req, true, Expect::new("FOUND", 1))?.into_job())
        })
    }

    /// Moves up to `bound` buried (or, when none are buried, delayed) jobs
    /// into the ready queue and returns how many moved.
    pub fn kick(&mut self, bound: u64) -> StalkResult<u64> {
        let name = &self.name;
        self.conn.with_reconnect(|conn| {
            let req = conn.cmd(Some(name), None, None, "kick", &[bound.into()])?;
            let reply = conn.read_resp(req, false, Expect::new("KICKED", 1))?;
            Ok(reply.args[0])
        })
    }

    /// Statistics for this tube.
    pub fn stats(&mut self) -> StalkResult<BTreeMap<String, String>> {
        let name = &self.name;
        self.conn.with_reconnect(|conn| {
            let req = conn.cmd(None, None, None, "stats-tube", &[name.into()])?;
            let reply = conn.read_resp(req, true, Expect::new("OK", 0))?;
            Ok(parse_dict(&reply.body))
        })
    }

    /// Stops handing out jobs from this tube for `delay`.
    pub fn pause(&mut self, delay: Duration) -> StalkResult<()> {
        let name = &self.name;
        self.conn.with_reconnect(|conn| {
            let req = conn.cmd(None, None, None, "pause-tube", &[name.into(), delay.into()])?;
            conn.read_resp(req, false, Expect::new("PAUSED", 0))?;
            Ok(())
        })
    }
}
