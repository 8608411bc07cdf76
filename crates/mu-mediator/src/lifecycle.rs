//! Keeps the enhancement backend running while anyone needs it.
//!
//! `ensure_running` is single-flight: concurrent callers join one shared
//! start attempt.  `reconcile` is debounced and compares the number of
//! active consumers against what the supervisor was last told.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};

use futures_util::future::{BoxFuture, FutureExt, Shared};
use mu_proto::config::LifecycleConfig;
use mu_proto::native::SupervisorCommand;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::backend::EnhanceBackend;
use crate::debounce::Debouncer;
use crate::error::LifecycleError;
use crate::supervisor::Supervisor;

type StartFlight = Shared<BoxFuture<'static, Result<(), LifecycleError>>>;

#[derive(Default)]
struct State {
    health_ok_until: Option<Instant>,
    in_flight: Option<StartFlight>,
    /// What the supervisor was last told: `Some(true)` after tray start,
    /// `Some(false)` after a full stop.
    supervisor_active: Option<bool>,
    last_known_running: Option<bool>,
}

pub struct Lifecycle {
    cfg: LifecycleConfig,
    backend: Arc<dyn EnhanceBackend>,
    supervisor: Arc<dyn Supervisor>,
    active_consumers: AtomicUsize,
    state: Mutex<State>,
    reconciler: Debouncer<String>,
    weak: Weak<Lifecycle>,
}

impl Lifecycle {
    /// Must be called inside a tokio runtime; the reconcile debouncer is a
    /// spawned task.
    pub fn new(
        cfg: LifecycleConfig,
        backend: Arc<dyn EnhanceBackend>,
        supervisor: Arc<dyn Supervisor>,
    ) -> Arc<Self> {
        let window = cfg.reconcile_debounce();
        Arc::new_cyclic(|weak: &Weak<Lifecycle>| {
            let target = weak.clone();
            let reconciler = Debouncer::spawn(window, move |reason: String| {
                let target = target.clone();
                async move {
                    if let Some(this) = target.upgrade() {
                        this.reconcile_now(&reason).await;
                    }
                }
            });
            Self {
                cfg,
                backend,
                supervisor,
                active_consumers: AtomicUsize::new(0),
                state: Mutex::new(State::default()),
                reconciler,
                weak: weak.clone(),
            }
        })
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn set_active_consumers(&self, count: usize) {
        self.active_consumers.store(count, Ordering::SeqCst);
    }

    pub fn active_consumers(&self) -> usize {
        self.active_consumers.load(Ordering::SeqCst)
    }

    pub fn health_is_fresh(&self) -> bool {
        self.lock()
            .health_ok_until
            .map_or(false, |t| Instant::now() < t)
    }

    pub fn last_known_running(&self) -> Option<bool> {
        self.lock().last_known_running
    }

    /// Forget the cached health signal so the next call probes again.
    pub fn invalidate_health(&self) {
        self.lock().health_ok_until = None;
    }

    pub async fn ensure_running(&self, reason: &str) -> Result<(), LifecycleError> {
        let flight = {
            let mut st = self.lock();
            if st.health_ok_until.map_or(false, |t| Instant::now() < t) {
                return Ok(());
            }
            match &st.in_flight {
                Some(flight) => {
                    debug!("lifecycle: joining start in flight ({})", reason);
                    flight.clone()
                }
                None => {
                    let flight = self.start_flight(reason.to_string()).boxed().shared();
                    st.in_flight = Some(flight.clone());
                    flight
                }
            }
        };
        flight.await
    }

    fn start_flight(&self, reason: String) -> impl std::future::Future<Output = Result<(), LifecycleError>> + Send + 'static {
        let weak = self.weak.clone();
        async move {
            let this = weak.upgrade().ok_or(LifecycleError::Gone)?;
            let outcome = this.start_and_wait(&reason).await;
            let mut st = this.lock();
            st.in_flight = None;
            match outcome {
                Ok(()) => {
                    st.health_ok_until = Some(Instant::now() + this.cfg.health_ttl());
                    st.last_known_running = Some(true);
                }
                Err(_) => st.last_known_running = Some(false),
            }
            outcome
        }
    }

    async fn start_and_wait(&self, reason: &str) -> Result<(), LifecycleError> {
        if self.backend.health().await {
            return Ok(());
        }
        info!("lifecycle: starting backend ({})", reason);
        if let Err(e) = self.supervisor.command(SupervisorCommand::Start).await {
            warn!("lifecycle: start command failed: {}", e);
        }
        let attempts = self.cfg.start_poll_attempts;
        for attempt in 1..=attempts {
            tokio::time::sleep(self.cfg.start_poll_interval()).await;
            if self.backend.health().await {
                info!("lifecycle: backend healthy after {} checks", attempt);
                return Ok(());
            }
        }
        warn!("lifecycle: backend not healthy after {} checks", attempts);
        Err(LifecycleError::StartTimedOut { attempts })
    }

    /// Debounced; the decision uses the consumer count at window close.
    pub fn reconcile(&self, reason: &str) {
        self.reconciler.trigger(reason.to_string());
    }

    pub async fn reconcile_now(&self, reason: &str) {
        let active = self.active_consumers();
        debug!("lifecycle: reconcile ({}), {} active consumers", reason, active);
        if active == 0 {
            if self.lock().supervisor_active == Some(false) {
                return;
            }
            self.stop(reason).await;
            if let Err(e) = self.supervisor.command(SupervisorCommand::TrayStop).await {
                warn!("lifecycle: tray stop failed: {}", e);
            }
            self.lock().supervisor_active = Some(false);
        } else {
            if self.lock().supervisor_active != Some(true) {
                if let Err(e) = self.supervisor.command(SupervisorCommand::TrayStart).await {
                    warn!("lifecycle: tray start failed: {}", e);
                }
                self.lock().supervisor_active = Some(true);
            }
            if let Err(e) = self.ensure_running(reason).await {
                warn!("lifecycle: {}", e);
            }
        }
    }

    /// Best-effort stop.  Always drops the cached health signal.
    pub async fn stop(&self, reason: &str) {
        info!("lifecycle: stopping backend ({})", reason);
        self.invalidate_health();
        if let Err(e) = self.supervisor.command(SupervisorCommand::Stop).await {
            debug!("lifecycle: stop command failed: {}", e);
        }
        if let Err(e) = self.backend.shutdown().await {
            debug!("lifecycle: shutdown request failed: {}", e);
        }
        let mut st = self.lock();
        st.health_ok_until = None;
        st.last_known_running = Some(false);
    }

    pub async fn restart(&self, reason: &str) -> Result<(), LifecycleError> {
        self.stop(reason).await;
        self.ensure_running(reason).await
    }
}
