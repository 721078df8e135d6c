//! Ordered multi-object locking.
//!
//! Every mutable object body sits behind its own mutex. Any operation that
//! must observe two or more objects atomically acquires their mutexes in
//! ascending address order; this is the single global order that makes the
//! discipline deadlock-free. No caller may hold one of these locks while
//! blocking on another thread's long-running operation.

use parking_lot::{Mutex, MutexGuard};

/// Lock two distinct object mutexes in address order.
///
/// Guards are returned in argument order regardless of acquisition order.
/// Callers must short-circuit identity (`Arc::ptr_eq`) before calling; the
/// same mutex twice would self-deadlock.
pub fn lock_pair<'a, T>(
    a: &'a Mutex<T>,
    b: &'a Mutex<T>,
) -> (MutexGuard<'a, T>, MutexGuard<'a, T>) {
    let pa = a as *const _ as usize;
    let pb = b as *const _ as usize;
    debug_assert_ne!(pa, pb, "lock_pair on the same mutex");
    if pa < pb {
        let ga = a.lock();
        let gb = b.lock();
        (ga, gb)
    } else {
        let gb = b.lock();
        let ga = a.lock();
        (ga, gb)
    }
}

/// Lock a set of object mutexes in address order.
///
/// Guards come back ordered by address, not by argument position; callers
/// that need positional access should use [`lock_pair`].
pub fn lock_all<'a, T>(mutexes: &mut Vec<&'a Mutex<T>>) -> Vec<MutexGuard<'a, T>> {
    mutexes.sort_by_key(|m| *m as *const _ as usize);
    mutexes.dedup_by_key(|m| *m as *const _ as usize);
    mutexes.iter().map(|m| m.lock()).collect()
}
