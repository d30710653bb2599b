use super::*;
use std::sync::Arc;
use std::time::Duration;

#[test]
fn reentry_deepens_without_blocking() {
    let lock = ProcLock::new(0u32);
    lock.lock();
    lock.lock();
    lock.lock();
    assert_eq!(lock.depth(), 3);
    assert!(lock.held());
    lock.unlock();
    assert_eq!(lock.depth(), 2);
    lock.unlock();
    lock.unlock();
    assert_eq!(lock.depth(), 0);
    assert!(!lock.held());
}

#[test]
fn contended_acquire_waits_for_release() {
    let lock = Arc::new(ProcLock::new(0u32));
    lock.lock();
    lock.with(|v| *v = 1);

    let peer = {
        let lock = Arc::clone(&lock);
        std::thread::spawn(move || {
            lock.lock();
            let seen = lock.with(|v| *v);
            lock.unlock();
            seen
        })
    };

    // Give the peer time to block, then publish and release.
    std::thread::sleep(Duration::from_millis(20));
    lock.with(|v| *v = 2);
    lock.unlock();

    assert_eq!(peer.join().unwrap(), 2);
}

#[test]
#[should_panic(expected = "lock violation")]
fn unlock_by_non_owner_is_a_violation() {
    let lock = ProcLock::new(());
    lock.unlock();
}

#[test]
fn condition_wait_parks_and_restores_depth() {
    let lock = Arc::new(ProcLock::new(false));
    let cv = Arc::new(LockCondvar::new());

    lock.lock();
    lock.lock();
    assert_eq!(lock.depth(), 2);

    let peer = {
        let lock = Arc::clone(&lock);
        let cv = Arc::clone(&cv);
        std::thread::spawn(move || {
            // Runs while the main thread is parked in wait_while: the
            // logical lock must be takeable despite its nominal depth.
            lock.lock();
            lock.with(|ready| *ready = true);
            lock.unlock();
            cv.broadcast();
        })
    };

    lock.wait_while(&cv, |ready| !*ready);
    peer.join().unwrap();

    // Full nesting restored after the wait.
    assert_eq!(lock.depth(), 2);
    assert!(lock.held());
    lock.unlock();
    lock.unlock();
}

#[test]
fn force_release_flattens_any_depth() {
    let lock = Arc::new(ProcLock::new(()));
    lock.lock();
    lock.lock();
    lock.lock();
    lock.force_release();
    assert_eq!(lock.depth(), 0);

    // Released exactly once: another thread can take it straight away.
    let peer = {
        let lock = Arc::clone(&lock);
        std::thread::spawn(move || {
            lock.lock();
            lock.unlock();
        })
    };
    peer.join().unwrap();
}

#[test]
fn force_owner_reasserts_from_clean_state() {
    let lock = ProcLock::new(());
    lock.force_owner();
    assert!(lock.held());
    assert_eq!(lock.depth(), 1);
    lock.force_release();
}

#[test]
fn force_owner_flattens_own_nesting() {
    let lock = ProcLock::new(());
    lock.lock();
    lock.lock();
    lock.force_owner();
    assert_eq!(lock.depth(), 1);
    lock.force_release();
}
