// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! Process-wide, dynamically-scoped configuration (spec.md §5, §9).
//!
//! The original implementation represents this as a registry of named
//! dynamic variables, pushed and popped by hand with explicit unwind-protect
//! chains. In idiomatic Rust, "push a binding on scope entry, restore it on
//! every exit including unwind" is exactly what [`Drop`] already gives an
//! RAII guard, so that's what this module is: a thread-local stack per
//! variable, with a guard type that pops on drop.
//!
//! The only dynamic variable the core recognizes is `origin`: the preferred
//! origin name consulted by the (external) policy layer.

use std::cell::RefCell;

thread_local! {
    static ORIGIN_STACK: RefCell<Vec<String>> = const { RefCell::new(Vec::new()) };
}

/// Returns the currently bound origin, if any scope has set one.
#[must_use]
pub fn origin() -> Option<String> {
    ORIGIN_STACK.with(|stack| stack.borrow().last().cloned())
}

/// Binds `origin` for the lifetime of the returned guard.
///
/// Restores the previous binding (or the absence of one) when the guard is
/// dropped, on every exit path — normal return, early return, or panic
/// unwind.
#[must_use]
pub fn bind_origin(origin: impl Into<String>) -> OriginGuard {
    ORIGIN_STACK.with(|stack| stack.borrow_mut().push(origin.into()));
    OriginGuard { _private: () }
}

/// RAII guard returned by [`bind_origin`]. Pops the binding on drop.
pub struct OriginGuard {
    _private: (),
}

impl Drop for OriginGuard {
    fn drop(&mut self) {
        ORIGIN_STACK.with(|stack| {
            stack.borrow_mut().pop();
        });
    }
}
