//! Idle connection pool keyed by `(host, port, is_tls)`. Scanned
//! most-recent-first, expired entries dropped along the way, eviction oldest
//! first when full — `spec.md` §4.6 Acquire/Release, reusing the
//! `VecDeque`-per-key shape the glossary names.

use crate::client::stream::Stream;
use std::{collections::HashMap, collections::VecDeque, time::Instant};

pub(crate) type PoolKey = (String, u16, bool);

pub(crate) struct IdleConnection {
    pub(crate) stream: Stream,
    pub(crate) idle_deadline: Instant,
    pub(crate) request_count: usize,
    pub(crate) max_requests: Option<usize>,
}

#[derive(Default)]
pub(crate) struct Pool {
    idle: HashMap<PoolKey, VecDeque<IdleConnection>>,
    max_idle_per_host: usize,
}

impl Pool {
    pub(crate) fn new(max_idle_per_host: usize) -> Self {
        Self {
            idle: HashMap::new(),
            max_idle_per_host,
        }
    }

    /// Pops the most recently released connection for `key`, skipping and
    /// dropping any whose idle deadline has already passed.
    pub(crate) fn acquire(&mut self, key: &PoolKey) -> Option<IdleConnection> {
        let list = self.idle.get_mut(key)?;
        let now = Instant::now();
        while let Some(conn) = list.pop_back() {
            if conn.idle_deadline > now {
                return Some(conn);
            }
        }
        None
    }

    /// Returns a connection to the idle list, evicting the oldest entry
    /// first if the per-host cap is already reached.
    pub(crate) fn release(&mut self, key: PoolKey, conn: IdleConnection) {
        if self.max_idle_per_host == 0 {
            return;
        }
        let list = self.idle.entry(key).or_default();
        if list.len() >= self.max_idle_per_host {
            list.pop_front();
        }
        list.push_back(conn);
    }

    #[cfg(test)]
    pub(crate) fn idle_len(&self, key: &PoolKey) -> usize {
        self.idle.get(key).map_or(0, VecDeque::len)
    }
}
