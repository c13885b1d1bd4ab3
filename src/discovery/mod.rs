//! Object discovery collection
//!
//! Opens an asynchronous reply stream scoped to a hash suffix and folds
//! the replies into a deduplicated result set under a best-reply-wins
//! merge: an error-only reply is superseded by a later reply carrying a
//! resolved object for the same hash, and a resolved object is never
//! overwritten. Each read waits a bounded amount of time; a quiet period,
//! source completion, or cancellation ends collection silently.

pub mod simulated;
mod wordcode;

pub use wordcode::WordDecoder;

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::{watch, Notify};

use crate::entity::{HashedEntity, ObjectHash, DEFAULT_SUFFIX_BITS};
use crate::resources::{PeerEndpoint, Resources, ResourcesConfig};

/// Wait budget for each reply read, in milliseconds.
pub const REPLY_WAIT_MS: u64 = 30_000;

/// Error types for discovery configuration
#[derive(Error, Debug)]
pub enum DiscoveryError {
    #[error("No discovery peers configured (query suffix {0})")]
    MissingPeerConfig(String),

    #[error("Unknown language for decoding word code: {0}")]
    UnknownLanguage(String),

    #[error("Invalid word code: {0}")]
    InvalidWordCode(String),
}

/// One answer to a discovery query: a resolved object, or an error
/// reported by the answering peer.
#[derive(Clone)]
pub struct DiscoveryReply {
    pub hash: ObjectHash,
    pub object: Option<Arc<dyn HashedEntity>>,
    pub error: Option<String>,
}

impl std::fmt::Debug for DiscoveryReply {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DiscoveryReply")
            .field("hash", &self.hash)
            .field("object", &self.object.is_some())
            .field("error", &self.error)
            .finish()
    }
}

/// Why a reply stream stopped producing replies.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplyStreamEnd {
    /// The bounded wait elapsed with no reply.
    Timeout,
    /// The source finished or was closed.
    Closed,
}

/// An open discovery query delivering replies as peers answer.
#[async_trait]
pub trait ReplyStream: Send {
    /// Await the next reply, waiting at most `wait_ms`.
    async fn next(&mut self, wait_ms: u64) -> Result<DiscoveryReply, ReplyStreamEnd>;

    /// Release the underlying query.
    async fn close(&mut self);
}

/// The discovery mesh: broadcasts suffix queries to peers.
pub trait DiscoverySource: Send + Sync {
    fn find_by_hash_suffix(
        &self,
        suffix: &str,
        linkup_servers: &[String],
        query_address: &PeerEndpoint,
        count: usize,
        timeout_secs: u32,
        exact_match_only: bool,
        include_errors: bool,
    ) -> Box<dyn ReplyStream>;
}

/// Deduplicated discovery results: the best reply seen so far per hash.
#[derive(Clone, Debug, Default)]
pub struct DiscoveryResults {
    entries: HashMap<ObjectHash, DiscoveryReply>,
}

impl DiscoveryResults {
    pub fn get(&self, hash: &ObjectHash) -> Option<&DiscoveryReply> {
        self.entries.get(hash)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&ObjectHash, &DiscoveryReply)> {
        self.entries.iter()
    }

    /// Apply the best-wins rule. Returns true if the entry changed: a new
    /// hash always lands; an existing error-only entry is replaced by a
    /// reply carrying an object; a resolved object is never overwritten.
    fn merge(&mut self, reply: DiscoveryReply) -> bool {
        match self.entries.get(&reply.hash) {
            Some(current) if !(current.object.is_none() && reply.object.is_some()) => false,
            _ => {
                self.entries.insert(reply.hash.clone(), reply);
                true
            }
        }
    }
}

/// What to discover: a word code, a raw suffix, or a known hash.
#[derive(Clone, Debug)]
pub enum DiscoveryQuery {
    WordCode { words: Vec<String>, lang: String },
    HashSuffix(String),
    ForHash(ObjectHash),
}

impl DiscoveryQuery {
    /// Split a dash-separated word code, e.g. "grape-castle-lantern".
    pub fn word_code(code: &str, lang: &str) -> Self {
        DiscoveryQuery::WordCode {
            words: code.split('-').map(str::to_string).collect(),
            lang: lang.to_string(),
        }
    }

    fn suffix(&self, config: &ResourcesConfig) -> Result<String, DiscoveryError> {
        match self {
            DiscoveryQuery::WordCode { words, lang } => {
                let decoder = config
                    .word_decoders
                    .get(lang)
                    .ok_or_else(|| DiscoveryError::UnknownLanguage(lang.clone()))?;
                decoder.decode(words)
            }
            DiscoveryQuery::HashSuffix(suffix) => Ok(suffix.clone()),
            DiscoveryQuery::ForHash(hash) => Ok(hash.hex_suffix(DEFAULT_SUFFIX_BITS)),
        }
    }
}

/// Tuning knobs for one discovery run.
#[derive(Clone, Copy, Debug)]
pub struct DiscoveryParams {
    /// How many distinct objects the source should try to collect.
    pub count: usize,
    /// Query lifetime advertised to peers, in seconds.
    pub timeout_secs: u32,
    /// Whether error replies should be delivered at all.
    pub include_errors: bool,
}

impl Default for DiscoveryParams {
    fn default() -> Self {
        Self {
            count: 10,
            timeout_secs: 30,
            include_errors: false,
        }
    }
}

/// Cancellation handle for a discovery run.
///
/// `cancel` stops collection, closes the reply source, and resets the
/// published result set to empty. Idempotent; runs on drop.
pub struct DiscoveryHandle {
    cancelled: Arc<AtomicBool>,
    cancel_notify: Arc<Notify>,
    results_tx: Arc<watch::Sender<DiscoveryResults>>,
}

impl DiscoveryHandle {
    pub fn cancel(&self) {
        if self.cancelled.swap(true, Ordering::SeqCst) {
            return;
        }
        self.cancel_notify.notify_waiters();
        self.results_tx.send_replace(DiscoveryResults::default());
    }
}

impl Drop for DiscoveryHandle {
    fn drop(&mut self) {
        self.cancel();
    }
}

/// Start collecting discovery replies for `query`.
///
/// Fatal configuration errors (no discovery peers, unknown word-code
/// language) are returned immediately. The collection loop republishes
/// the result set only when the best-wins rule changed it, and ends
/// silently when a read times out, the source completes, or the handle is
/// cancelled; the reply source is closed on every exit path. Results
/// collected before a quiet-period timeout stay visible; only
/// cancellation resets them.
pub fn start_discovery(
    resources: &Resources,
    query: DiscoveryQuery,
    params: DiscoveryParams,
) -> Result<(watch::Receiver<DiscoveryResults>, DiscoveryHandle), DiscoveryError> {
    let suffix = query.suffix(&resources.config)?;
    let query_address = resources
        .config
        .discovery_peers
        .first()
        .cloned()
        .ok_or_else(|| DiscoveryError::MissingPeerConfig(suffix.clone()))?;

    let mut stream = resources.mesh.find_by_hash_suffix(
        &suffix,
        &resources.config.linkup_servers,
        &query_address,
        params.count,
        params.timeout_secs,
        false,
        params.include_errors,
    );

    let (results_tx, results_rx) = watch::channel(DiscoveryResults::default());
    let results_tx = Arc::new(results_tx);
    let cancel_notify = Arc::new(Notify::new());
    let cancelled = Arc::new(AtomicBool::new(false));

    {
        let results_tx = Arc::clone(&results_tx);
        let cancel_notify = Arc::clone(&cancel_notify);
        let cancelled = Arc::clone(&cancelled);
        tokio::spawn(async move {
            let mut results = DiscoveryResults::default();
            loop {
                if cancelled.load(Ordering::SeqCst) {
                    break;
                }
                tokio::select! {
                    _ = cancel_notify.notified() => break,
                    next = stream.next(REPLY_WAIT_MS) => match next {
                        Ok(reply) => {
                            if results.merge(reply) {
                                results_tx.send_replace(results.clone());
                            }
                        }
                        Err(end) => {
                            log::debug!(
                                "Discovery reply stream for suffix {} ended: {:?}",
                                suffix,
                                end
                            );
                            break;
                        }
                    }
                }
            }
            stream.close().await;
        });
    }

    Ok((
        results_rx,
        DiscoveryHandle {
            cancelled,
            cancel_notify,
            results_tx,
        },
    ))
}

/// Resolve one specific object, discovering it only when not already at
/// hand.
///
/// With `existing` present, the receiver resolves immediately and no
/// query is opened. Otherwise a single-result discovery runs against the
/// hash's broadcast suffix, and the first resolved-object reply whose
/// hash equals `hash` becomes the stable result; all other replies are
/// ignored.
pub fn discover_if_missing(
    resources: &Resources,
    hash: ObjectHash,
    existing: Option<Arc<dyn HashedEntity>>,
) -> Result<
    (
        watch::Receiver<Option<Arc<dyn HashedEntity>>>,
        Option<DiscoveryHandle>,
    ),
    DiscoveryError,
> {
    if let Some(object) = existing {
        let (_tx, rx) = watch::channel(Some(object));
        return Ok((rx, None));
    }

    let (mut results_rx, handle) = start_discovery(
        resources,
        DiscoveryQuery::ForHash(hash.clone()),
        DiscoveryParams {
            count: 1,
            include_errors: false,
            ..Default::default()
        },
    )?;

    let (tx, rx) = watch::channel(None);
    tokio::spawn(async move {
        while results_rx.changed().await.is_ok() {
            let matched = {
                let results = results_rx.borrow_and_update();
                results
                    .get(&hash)
                    .and_then(|reply| reply.object.clone())
                    .filter(|object| object.current_hash() == hash)
            };
            if let Some(object) = matched {
                let _ = tx.send(Some(object));
                break;
            }
        }
    });

    Ok((rx, Some(handle)))
}
