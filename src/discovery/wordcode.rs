//! Word code decoding capability
//!
//! Human-readable word codes ("grape-castle-lantern") decode to the hash
//! suffix an object broadcasts under. Decoders are registered per
//! language in the resources configuration; asking for an unregistered
//! language is a configuration error, surfaced immediately and never
//! retried.

use super::DiscoveryError;

/// Decodes an ordered word sequence into a hex hash suffix.
pub trait WordDecoder: Send + Sync {
    fn decode(&self, words: &[String]) -> Result<String, DiscoveryError>;
}
