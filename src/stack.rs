//! Keeps deep recursion in the evaluator and parser off the guard page.
//!
//! Script recursion is bounded by the call-depth limit, but each script call
//! costs several host frames. Growing the stack on demand lets that limit be
//! the thing that stops a runaway script, whatever thread runs it.

/// Runs `f`, first moving to a fresh stack segment when less than the red
/// zone remains.
#[inline]
#[cfg(not(target_arch = "wasm32"))]
pub fn ensure_sufficient_stack<R>(f: impl FnOnce() -> R) -> R {
    const RED_ZONE: usize = 128 * 1024;
    const STACK_PER_SEGMENT: usize = 2 * 1024 * 1024;

    stacker::maybe_grow(RED_ZONE, STACK_PER_SEGMENT, f)
}

#[inline]
#[cfg(target_arch = "wasm32")]
pub fn ensure_sufficient_stack<R>(f: impl FnOnce() -> R) -> R {
    f()
}
