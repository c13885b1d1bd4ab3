//! Explicit dependency bundle for the view layer
//!
//! Every operation that needs external services receives a `Resources`
//! reference; nothing is ambient. The bundle carries the object store, the
//! discovery mesh, and static configuration.

use std::collections::HashMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::discovery::{DiscoverySource, WordDecoder};
use crate::entity::{EntityStore, ObjectHash};

/// Address of a remote peer endpoint, as found in configuration.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PeerEndpoint {
    /// Endpoint URL of the peer's linkup listener.
    pub url: String,
    /// Identity hash the peer answers under, when pinned.
    pub identity: Option<ObjectHash>,
}

/// Static configuration for discovery and word-code handling.
#[derive(Clone, Default)]
pub struct ResourcesConfig {
    /// Linkup servers replies are routed through.
    pub linkup_servers: Vec<String>,
    /// Peers that answer discovery queries. Discovery is a configuration
    /// error when this is empty.
    pub discovery_peers: Vec<PeerEndpoint>,
    /// Word-code decoders, keyed by language.
    pub word_decoders: HashMap<String, Arc<dyn WordDecoder>>,
}

/// The service bundle handed to every view-layer operation.
#[derive(Clone)]
pub struct Resources {
    pub store: Arc<dyn EntityStore>,
    pub mesh: Arc<dyn DiscoverySource>,
    pub config: ResourcesConfig,
}

impl Resources {
    pub fn new(
        store: Arc<dyn EntityStore>,
        mesh: Arc<dyn DiscoverySource>,
        config: ResourcesConfig,
    ) -> Self {
        Self {
            store,
            mesh,
            config,
        }
    }
}
