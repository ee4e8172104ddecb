use std::{
    sync::{Arc, Mutex, MutexGuard},
    time::Duration,
};

use tokio::{task::JoinHandle, time::Instant};

/// Called once per expiry with the generation that fired.
pub type IdleCallback = Arc<dyn Fn(u64) + Send + Sync>;

#[derive(Debug, Default)]
struct TimerState {
    // Bumped by every arm/disarm; a fire only counts if it still matches.
    generation: u64,
    arms: u64,
    deadline: Option<Instant>,
    task: Option<JoinHandle<()>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IdleSnapshot {
    pub armed: bool,
    pub remaining: Option<Duration>,
    /// Total number of `arm()` calls so far.
    pub arms: u64,
}

/// A single rearmable, cancellable delayed idle-stop.
#[derive(Clone)]
pub struct IdleScheduler {
    inner: Arc<Mutex<TimerState>>,
    timeout: Duration,
    on_idle: IdleCallback,
}

impl std::fmt::Debug for IdleScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IdleScheduler")
            .field("timeout", &self.timeout)
            .field("state", &self.snapshot())
            .finish()
    }
}

fn lock(inner: &Mutex<TimerState>) -> MutexGuard<'_, TimerState> {
    inner.lock().unwrap_or_else(|e| e.into_inner())
}

impl IdleScheduler {
    pub fn new(timeout: Duration, on_idle: impl Fn(u64) + Send + Sync + 'static) -> Self {
        Self {
            inner: Arc::new(Mutex::new(TimerState::default())),
            timeout,
            on_idle: Arc::new(on_idle),
        }
    }

    /// Schedule the idle stop `timeout` from now, replacing any pending one.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn arm(&self) {
        let mut st = lock(&self.inner);
        if let Some(task) = st.task.take() {
            task.abort();
        }
        st.generation = st.generation.wrapping_add(1);
        st.arms = st.arms.saturating_add(1);

        let generation = st.generation;
        let deadline = Instant::now() + self.timeout;
        st.deadline = Some(deadline);

        let inner = self.inner.clone();
        let on_idle = self.on_idle.clone();
        let timeout = self.timeout;
        st.task = Some(tokio::spawn(async move {
            tokio::time::sleep_until(deadline).await;
            {
                let mut st = lock(&inner);
                if st.generation != generation {
                    return;
                }
                st.deadline = None;
                st.task = None;
            }
            tracing::warn!(
                timeout_secs = timeout.as_secs(),
                generation,
                "idle timeout reached; stopping server"
            );
            on_idle(generation);
        }));

        tracing::info!(timeout_secs = self.timeout.as_secs(), generation, "idle timer armed");
    }

    /// Cancel the pending idle stop, if any. Safe to call repeatedly.
    pub fn disarm(&self) {
        let mut st = lock(&self.inner);
        st.generation = st.generation.wrapping_add(1);
        st.deadline = None;
        if let Some(task) = st.task.take() {
            task.abort();
            tracing::info!("idle timer disarmed");
        }
    }

    /// Whether a fire carrying `generation` has not been superseded.
    pub fn is_current(&self, generation: u64) -> bool {
        lock(&self.inner).generation == generation
    }

    pub fn snapshot(&self) -> IdleSnapshot {
        let st = lock(&self.inner);
        IdleSnapshot {
            armed: st.deadline.is_some(),
            remaining: st
                .deadline
                .map(|d| d.saturating_duration_since(Instant::now())),
            arms: st.arms,
        }
    }
}
