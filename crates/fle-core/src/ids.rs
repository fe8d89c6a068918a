//! Monotonic, process-wide unique context identifiers.

use std::sync::atomic::{AtomicU32, Ordering};

static NEXT_CONTEXT_ID: AtomicU32 = AtomicU32::new(1);

/// Allocate the next context id. Ids start at 1; 0 is reserved to mean
/// "no dependent context" in [`next_dependent_ctx_id`](crate)-style return
/// values.
pub fn next_context_id() -> u32 {
    NEXT_CONTEXT_ID.fetch_add(1, Ordering::Relaxed)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn monotonic_increments() {
        let a = next_context_id();
        let b = next_context_id();
        assert!(b > a);
    }

    #[test]
    fn never_zero() {
        assert_ne!(next_context_id(), 0);
    }
}
