use hmd_stereo::RuntimeSession;
use hmd_stereo::vr::{DeviceRuntime, SimulatedProbe, SimulatedRuntime};
use once_cell::sync::OnceCell;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Barrier};
use std::thread;

const CALLERS: usize = 8;

static FACTORY_CALLS: AtomicUsize = AtomicUsize::new(0);
static PROBE: OnceCell<SimulatedProbe> = OnceCell::new();

fn counting_factory() -> Box<dyn DeviceRuntime> {
    FACTORY_CALLS.fetch_add(1, Ordering::SeqCst);
    let runtime = SimulatedRuntime::new();
    let _ = PROBE.set(runtime.probe());
    Box::new(runtime)
}

#[test]
fn concurrent_initialization_runs_once() {
    assert!(RuntimeSession::global().is_none());

    let barrier = Barrier::new(CALLERS);
    let sessions: Vec<Arc<RuntimeSession>> = thread::scope(|scope| {
        let handles: Vec<_> = (0..CALLERS)
            .map(|_| {
                scope.spawn(|| {
                    barrier.wait();
                    RuntimeSession::initialize(counting_factory)
                        .expect("simulated runtime initializes")
                })
            })
            .collect();
        handles
            .into_iter()
            .map(|handle| handle.join().expect("caller thread panicked"))
            .collect()
    });

    assert_eq!(FACTORY_CALLS.load(Ordering::SeqCst), 1);
    assert_eq!(PROBE.get().expect("factory ran").initialize_count(), 1);
    assert!(sessions.windows(2).all(|pair| Arc::ptr_eq(&pair[0], &pair[1])));

    let global = RuntimeSession::global().expect("global session");
    assert!(Arc::ptr_eq(&global, &sessions[0]));
    assert!(!global.is_shut_down());

    let again = RuntimeSession::initialize(counting_factory).expect("cached session");
    assert!(Arc::ptr_eq(&again, &global));
    assert_eq!(FACTORY_CALLS.load(Ordering::SeqCst), 1);
}
