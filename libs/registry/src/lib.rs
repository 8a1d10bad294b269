//! Provider capability registry: merges a base trait table with per-provider
//! manifest declarations and resolves the effective outbound/inbound backend.

pub mod registry;
pub mod traits;

pub use registry::{ProviderRegistry, RegistrySettings};
pub use traits::{CANONICAL_TRAIT_KEYS, Direction, ProviderEntry, ProviderTraits};
