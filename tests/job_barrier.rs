use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use anyhow::Result;

use cachetable::sync::JobBarrier;

#[test]
fn drain_waits_for_registered_jobs_and_refuses_new_ones() -> Result<()> {
    let bjm = Arc::new(JobBarrier::new());
    assert!(bjm.is_accepting());
    assert!(bjm.try_add());
    assert!(bjm.try_add());
    assert_eq!(bjm.count(), 2);

    let drained = Arc::new(AtomicBool::new(false));
    let h = {
        let bjm = bjm.clone();
        let drained = drained.clone();
        thread::spawn(move || {
            bjm.drain();
            drained.store(true, Ordering::SeqCst);
        })
    };

    // drain ещё висит: две задачи в полёте
    thread::sleep(Duration::from_millis(30));
    assert!(!drained.load(Ordering::SeqCst));
    bjm.remove();
    thread::sleep(Duration::from_millis(30));
    assert!(!drained.load(Ordering::SeqCst));

    bjm.remove();
    h.join().expect("drain thread");
    assert!(drained.load(Ordering::SeqCst));
    assert!(!bjm.is_accepting());
    assert!(!bjm.try_add(), "no new jobs after drain");
    assert_eq!(bjm.count(), 0);

    bjm.reset();
    assert!(bjm.try_add());
    bjm.remove();
    Ok(())
}

#[test]
fn drain_of_an_idle_barrier_returns_at_once() -> Result<()> {
    let bjm = JobBarrier::new();
    bjm.drain();
    bjm.drain();
    assert_eq!(bjm.count(), 0);
    Ok(())
}

#[test]
#[should_panic(expected = "jobs in flight")]
fn reset_with_a_job_in_flight_panics() {
    let bjm = JobBarrier::new();
    assert!(bjm.try_add());
    bjm.reset();
}
