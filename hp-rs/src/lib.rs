//! Hazard pointers with frontier protection.
//!
//! A thread that unlinks a node may publish the nodes the victim still points to (its frontier)
//! until the victim is freed. Threads that protect the victim can then follow its links without
//! validation, which is what back-link traversals need.

mod domain;
mod hazard;
mod pile;
mod retire;
mod thread;

pub use domain::Domain;
pub use hazard::HazardPointer;
pub use thread::Thread;

use std::thread_local;

/// Domain used by [`HazardPointer::default`] and the free functions of this crate.
pub static DEFAULT_DOMAIN: Domain = Domain::new();

// NOTE: the boxed thread does not move, so hazard pointers may keep a raw pointer to it.
thread_local! {
    static DEFAULT_THREAD: Box<Thread<'static>> = Box::new(Thread::new(&DEFAULT_DOMAIN));
}

impl Default for HazardPointer<'static> {
    fn default() -> Self {
        DEFAULT_THREAD.with(|t| HazardPointer::new(t))
    }
}

/// Retire a pointer, in the thread-local retired pointer bag.
///
/// # Safety
/// `ptr` was allocated by `Box<T>`, is unreachable from shared memory and is retired only once.
#[inline]
pub unsafe fn retire<T>(ptr: *mut T) {
    DEFAULT_THREAD.with(|t| t.retire(ptr))
}

/// Trigger reclamation
pub fn do_reclamation() {
    DEFAULT_THREAD.with(|t| t.do_reclamation())
}
