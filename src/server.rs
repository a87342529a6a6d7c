//! The single value that owns every store, as the loop's sole mutator
//! (spec §3 "Ownership", §9 "Global mutable stores"). No process-wide
//! singletons — everything hangs off one `Server`, constructed once in
//! `event_loop::run` and threaded through command dispatch.

use std::collections::HashMap;

use crate::blocking::BlockingRegistry;
use crate::config::Config;
use crate::connection::{Connection, ConnId, ConnectionMode};
use crate::dispatcher::build_xread_reply;
use crate::store::{StreamStore, StringStore};

pub struct Server {
    pub config: Config,
    pub strings: StringStore,
    pub streams: StreamStore,
    pub blocking: BlockingRegistry,
    pub connections: HashMap<ConnId, Connection>,
}

impl Server {
    pub fn new(config: Config) -> Self {
        Self {
            config,
            strings: StringStore::new(),
            streams: StreamStore::new(),
            blocking: BlockingRegistry::new(),
            connections: HashMap::new(),
        }
    }

    /// Called after an XADD appends `new_id` onto `stream_name`: re-checks
    /// every registered waiter touching that stream and wakes (writes the
    /// reply for, and deregisters) the ones now satisfied (spec §4.4).
    pub fn wake_waiters(&mut self, stream_name: &[u8]) {
        let Server { streams, blocking, connections, .. } = self;

        let woken = blocking.wake_satisfied(stream_name, |waiter| {
            waiter
                .watches
                .iter()
                .any(|(name, since)| streams.get(name).map_or(false, |s| s.tail() > *since))
        });

        for waiter in woken {
            let reply = build_xread_reply(streams, &waiter.watches);
            if let Some(conn) = connections.get_mut(&waiter.conn_id) {
                conn.queue_reply(&reply.to_bytes());
                conn.mode = ConnectionMode::Normal;
            }
        }
    }
}
