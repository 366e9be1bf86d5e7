//! transmem: translation memory + batch translation orchestration core.
//!
//! The crate is organized around one data flow: a batch of content fragments
//! comes in, the [`memory`] store resolves what it already knows (exact by
//! content hash, fuzzy via the [`similarity`] engine), oversized fragments go
//! through the [`chunker`], everything still untranslated goes out through the
//! retrying [`client`], and fresh results are written back to memory. The
//! [`batch`] module owns that pipeline; the rest are its collaborators.
//!
//! There is no global state. Construct a [`MemoryStore`] and a
//! [`TranslationService`] explicitly and share them via `Arc`.

pub mod batch;
pub mod chunker;
pub mod client;
pub mod config;
pub mod error;
pub mod memory;
pub mod metrics;
pub mod similarity;

pub use batch::{BatchInput, BatchOptions, ObjectRef, RequestItem, TranslationService};
pub use client::{HttpTransport, ModelTransport, NoopMeter, RequestClient, UsageMeter};
pub use config::{Credential, FuzzyTuning, TranslatorConfig};
pub use error::TranslateError;
pub use memory::{
    content_hash, FuzzyMatch, HitSource, MemoryHit, MemorySession, MemoryStats, MemoryStore,
    ObjectIdentity, TranslationRecord,
};
pub use metrics::{MetricSummary, MetricsRegistry};

/// Install the default tracing subscriber for binaries embedding this crate.
/// Honors `RUST_LOG`; defaults to debug for this crate and info elsewhere.
/// Library callers with their own subscriber should skip this.
pub fn init_tracing() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "transmem=debug,info".into());
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .try_init();
}
