//! # Tube Set Handle
//!
//! Purpose: Reserve jobs from any tube in a set. The connection's watched
//! set is reconciled to exactly this set before each reserve.

use std::collections::BTreeSet;
use std::time::Duration;

use stalk_common::TubeName;

use crate::conn::Conn;
use crate::error::{StalkError, StalkResult};
use crate::resp::{Expect, Job};

/// A set of watched tubes on a borrowed connection.
pub struct TubeSet<'c> {
    conn: &'c mut Conn,
    names: BTreeSet<TubeName>,
}

impl<'c> TubeSet<'c> {
    pub(crate) fn new(conn: &'c mut Conn, names: BTreeSet<TubeName>) -> Self {
        TubeSet { conn, names }
    }

    pub fn names(&self) -> &BTreeSet<TubeName> {
        &self.names
    }

    /// Reserves the next ready job from any tube in the set.
    ///
    /// `None` blocks until a job is available. `Some(timeout)` gives up after
    /// `timeout` with a `TIMED_OUT` protocol fault; a zero timeout polls.
    /// A `DEADLINE_SOON` fault means a job this connection holds is about to
    /// expire.
    pub fn reserve(&mut self, timeout: Option<Duration>) -> StalkResult<Job> {
        let names = &self.names;
        self.conn.with_reconnect(|conn| {
            let req = match timeout {
                Some(timeout) => conn.cmd(None, Some(names), None, "reserve-with-timeout", &[timeout.into()])?,
                None => conn.cmd(None, Some(names), None, "reserve", &[])?,
            };
            Ok(conn.read_resp(req, true, Expect::new("RESERVED", 1))?.into_job())
        })
    }
}

/// Validates a list of tube names into a non-empty set.
pub(crate) fn tube_set_from<I, S>(names: I) -> StalkResult<BTreeSet<TubeName>>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let set = names
        .into_iter()
        .map(|name| {
            let name = name.as_ref();
            TubeName::new(name).map_err(|reason| StalkError::invalid_name(name, reason))
        })
        .collect::<StalkResult<BTreeSet<_>>>()?;
    if set.is_empty() {
        return Err(StalkError::EmptyTubeSet);
    }
    Ok(set)
}
