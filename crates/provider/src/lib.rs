//! Nimbus compute providers
//!
//! One [`ComputeProvider`] interface over every supported backend, plus the
//! registry the lifecycle manager resolves providers through.

pub mod client;
pub mod hetzner;
pub mod provider;
pub mod simulated;

pub use hetzner::HetznerProvider;
pub use provider::{
    Catalog, ComputeProvider, CreateRequest, DeleteOutcome, ProviderInstance, ProviderRegistry,
    ProviderStatus, Retrying, SizeInfo,
};
pub use simulated::{Fault, SimulatedProvider};
