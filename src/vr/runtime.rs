use crate::vr::{DeviceRuntime, VrError, VrResult};
use once_cell::sync::OnceCell;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

static GLOBAL: OnceCell<VrResult<Arc<RuntimeSession>>> = OnceCell::new();

/// Owns one initialized VR runtime. Devices can only be acquired through a
/// session, so no device outlives or predates runtime initialization.
pub struct RuntimeSession {
    runtime: Box<dyn DeviceRuntime>,
    shut_down: AtomicBool,
}

impl RuntimeSession {
    /// Initializes `runtime` and wraps it in a session owned by the caller.
    /// The runtime is shut down when the last reference is dropped.
    pub fn new(runtime: Box<dyn DeviceRuntime>) -> VrResult<Arc<Self>> {
        let label = runtime.label();
        if let Err(err) = runtime.initialize() {
            log::error!("[vr] {label} failed to initialize: {err}");
            runtime_failure(&err);
            return Err(match err {
                VrError::Initialization(reason) => VrError::Initialization(reason),
                other => VrError::Initialization(other.to_string()),
            });
        }

        log::info!("[vr] {label} runtime initialized");
        Ok(Arc::new(Self {
            runtime,
            shut_down: AtomicBool::new(false),
        }))
    }

    /// Initializes the process-wide session. The factory and the runtime's
    /// initialization run at most once per process, whichever thread gets
    /// there first; every caller observes the same session or the same error.
    pub fn initialize<F>(factory: F) -> VrResult<Arc<Self>>
    where
        F: FnOnce() -> Box<dyn DeviceRuntime>,
    {
        GLOBAL.get_or_init(|| Self::new(factory())).clone()
    }

    pub fn global() -> Option<Arc<Self>> {
        GLOBAL.get().and_then(|result| result.as_ref().ok()).cloned()
    }

    pub fn runtime(&self) -> &dyn DeviceRuntime {
        self.runtime.as_ref()
    }

    pub fn label(&self) -> &'static str {
        self.runtime.label()
    }

    pub fn is_shut_down(&self) -> bool {
        self.shut_down.load(Ordering::Acquire)
    }

    /// Shuts the runtime down. Only the first call reaches the runtime.
    pub fn shutdown(&self) {
        if self
            .shut_down
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            log::info!("[vr] {} runtime shut down", self.runtime.label());
            self.runtime.shutdown();
        }
    }
}

impl fmt::Debug for RuntimeSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RuntimeSession")
            .field("runtime", &self.runtime.label())
            .field("shut_down", &self.is_shut_down())
            .finish()
    }
}

impl Drop for RuntimeSession {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[ctor::dtor]
fn shutdown_global_runtime() {
    if let Some(Ok(session)) = GLOBAL.get() {
        session.shutdown();
    }
}

/// Funnels a runtime result through the shared failure path: errors are
/// logged and reported to [`runtime_failure`], successes pass through.
pub fn check<T>(context: &str, result: VrResult<T>) -> Option<T> {
    match result {
        Ok(value) => Some(value),
        Err(err) => {
            log::error!("[vr] {context}: {err}");
            runtime_failure(&err);
            None
        }
    }
}

/// Every runtime failure passes through here; set a breakpoint on this
/// function to stop on the first one.
#[cold]
#[inline(never)]
fn runtime_failure(err: &VrError) {
    if cfg!(debug_assertions) {
        log::trace!("[vr] runtime failure recorded: {err:?}");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vr::SimulatedRuntime;

    #[test]
    fn injected_session_shuts_down_on_drop() {
        let runtime = SimulatedRuntime::new();
        let probe = runtime.probe();

        let session = RuntimeSession::new(Box::new(runtime)).expect("simulated runtime initializes");
        assert_eq!(probe.initialize_count(), 1);
        assert_eq!(probe.shutdown_count(), 0);

        drop(session);
        assert_eq!(probe.shutdown_count(), 1);
    }

    #[test]
    fn explicit_shutdown_is_not_repeated_on_drop() {
        let runtime = SimulatedRuntime::new();
        let probe = runtime.probe();
        let session = RuntimeSession::new(Box::new(runtime)).unwrap();

        session.shutdown();
        session.shutdown();
        assert!(session.is_shut_down());
        drop(session);

        assert_eq!(probe.shutdown_count(), 1);
    }

    #[test]
    fn failed_initialization_reports_runtime_reason() {
        let runtime = SimulatedRuntime::new().failing_initialization("LibOVR not installed");
        let err = RuntimeSession::new(Box::new(runtime)).unwrap_err();

        assert_eq!(
            err,
            VrError::Initialization("LibOVR not installed".to_string())
        );
        assert!(err.to_string().contains("LibOVR not installed"));
    }

    #[test]
    fn check_passes_values_and_swallows_errors() {
        assert_eq!(check("ok", Ok::<_, VrError>(3)), Some(3));
        assert_eq!(check::<u32>("fails", Err(VrError::NoDevice)), None);
    }
}
