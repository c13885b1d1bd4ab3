//! Simulated discovery mesh
//!
//! Scripted reply streams for exercising the collector without a
//! network. Each suffix can be scripted with a sequence of delayed
//! replies; after the script drains, reads run into the quiet-period
//! timeout like a real query that nobody answers anymore.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::time::{sleep, Duration};

use super::{DiscoveryReply, DiscoverySource, ReplyStream, ReplyStreamEnd};
use crate::resources::PeerEndpoint;

/// Parameters the mesh was queried with, kept for assertions.
#[derive(Clone, Debug)]
pub struct RecordedQuery {
    pub suffix: String,
    pub linkup_servers: Vec<String>,
    pub query_url: String,
    pub count: usize,
    pub timeout_secs: u32,
    pub include_errors: bool,
}

/// Plays back a script of (delay_ms, reply) steps, then reports a
/// quiet-period timeout. Uses tokio time, so paused clocks apply.
pub struct ScriptedReplyStream {
    script: VecDeque<(u64, DiscoveryReply)>,
    closed: Arc<AtomicBool>,
}

#[async_trait]
impl ReplyStream for ScriptedReplyStream {
    async fn next(&mut self, wait_ms: u64) -> Result<DiscoveryReply, ReplyStreamEnd> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(ReplyStreamEnd::Closed);
        }
        match self.script.pop_front() {
            Some((delay, reply)) if delay < wait_ms => {
                sleep(Duration::from_millis(delay)).await;
                Ok(reply)
            }
            Some(step) => {
                self.script.push_front(step);
                sleep(Duration::from_millis(wait_ms)).await;
                Err(ReplyStreamEnd::Timeout)
            }
            None => {
                sleep(Duration::from_millis(wait_ms)).await;
                Err(ReplyStreamEnd::Timeout)
            }
        }
    }

    async fn close(&mut self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}

/// An in-memory mesh serving scripted reply streams per suffix.
pub struct SimulatedMesh {
    scripts: Mutex<HashMap<String, Vec<(u64, DiscoveryReply)>>>,
    queries: Mutex<Vec<RecordedQuery>>,
    closed_flags: Mutex<Vec<Arc<AtomicBool>>>,
}

impl SimulatedMesh {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            scripts: Mutex::new(HashMap::new()),
            queries: Mutex::new(Vec::new()),
            closed_flags: Mutex::new(Vec::new()),
        })
    }

    /// Script the replies served for one suffix. A suffix with no script
    /// yields a stream that only ever times out.
    pub fn script(&self, suffix: &str, replies: Vec<(u64, DiscoveryReply)>) {
        self.scripts
            .lock()
            .unwrap()
            .insert(suffix.to_string(), replies);
    }

    pub fn recorded_queries(&self) -> Vec<RecordedQuery> {
        self.queries.lock().unwrap().clone()
    }

    /// True when every stream this mesh ever opened has been closed.
    pub fn all_streams_closed(&self) -> bool {
        self.closed_flags
            .lock()
            .unwrap()
            .iter()
            .all(|flag| flag.load(Ordering::SeqCst))
    }
}

impl DiscoverySource for SimulatedMesh {
    fn find_by_hash_suffix(
        &self,
        suffix: &str,
        linkup_servers: &[String],
        query_address: &PeerEndpoint,
        count: usize,
        timeout_secs: u32,
        _exact_match_only: bool,
        include_errors: bool,
    ) -> Box<dyn ReplyStream> {
        self.queries.lock().unwrap().push(RecordedQuery {
            suffix: suffix.to_string(),
            linkup_servers: linkup_servers.to_vec(),
            query_url: query_address.url.clone(),
            count,
            timeout_secs,
            include_errors,
        });

        let script = self
            .scripts
            .lock()
            .unwrap()
            .remove(suffix)
            .unwrap_or_default();
        let closed = Arc::new(AtomicBool::new(false));
        self.closed_flags.lock().unwrap().push(Arc::clone(&closed));

        Box::new(ScriptedReplyStream {
            script: script.into_iter().collect(),
            closed,
        })
    }
}
