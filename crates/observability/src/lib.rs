//! Process-wide tracing setup shared by the batchforge binaries.

/// Initialize process-wide observability (tracing/logging).
///
/// This is safe to call multiple times; subsequent calls become no-ops.
pub fn init() {
    tracing::init();
}

/// Like [`init`], with `default_filter` used when `RUST_LOG` is unset.
pub fn init_with_filter(default_filter: &str) {
    tracing::init_with_filter(default_filter);
}

/// Tracing configuration (filters, layers).
pub mod tracing;
