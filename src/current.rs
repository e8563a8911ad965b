//! The only process-wide state this crate touches: a snapshot of the
//! parent's own environment (spec §9 "Global state").

use std::collections::HashMap;

/// Accessor for ambient process state.
pub struct Current;

impl Current {
    /// A fresh snapshot of the parent's environment, read from the OS at
    /// call time (not cached) — callers that spawn many children with
    /// slightly different environments should call this once and layer
    /// their own overrides on top, rather than calling it per-child.
    pub fn environment() -> HashMap<String, String> {
        std::env::vars().collect()
    }
}
