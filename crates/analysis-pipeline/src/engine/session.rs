//! One restartable engine slot.
//!
//! A session starts its process lazily, bounds every search with a
//! wall-clock timeout, and throws the process away after any failure so
//! the next request starts from a fresh engine.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, warn};

use super::{Engine, EngineFactory, EngineRequest, EngineResponse};
use crate::error::PipelineError;

/// Pool-wide view of the sessions' processes.
///
/// A start failure while no session holds a running engine means the
/// whole pool is out, whichever session happened to try.
#[derive(Debug)]
pub(crate) struct PoolHealth {
    size: usize,
    /// Sessions whose last start attempt failed
    down: AtomicUsize,
    /// Sessions holding a started process
    running: AtomicUsize,
}

impl PoolHealth {
    pub(crate) fn new(size: usize) -> Self {
        Self {
            size,
            down: AtomicUsize::new(0),
            running: AtomicUsize::new(0),
        }
    }

    pub(crate) fn down(&self) -> usize {
        self.down.load(Ordering::SeqCst)
    }

    pub(crate) fn running(&self) -> usize {
        self.running.load(Ordering::SeqCst)
    }
}

pub struct EngineSession<F: EngineFactory> {
    id: usize,
    factory: Arc<F>,
    engine: Option<F::Engine>,
    response_timeout: Duration,
    health: Arc<PoolHealth>,
    marked_down: bool,
    started: bool,
    /// Set while a search is outstanding; still set if the caller dropped it
    searching: bool,
    restarts: u64,
}

impl<F: EngineFactory> EngineSession<F> {
    pub(crate) fn new(
        id: usize,
        factory: Arc<F>,
        response_timeout: Duration,
        health: Arc<PoolHealth>,
    ) -> Self {
        Self {
            id,
            factory,
            engine: None,
            response_timeout,
            health,
            marked_down: false,
            started: false,
            searching: false,
            restarts: 0,
        }
    }

    pub async fn evaluate(&mut self, request: &EngineRequest) -> Result<EngineResponse, PipelineError> {
        if self.searching {
            debug!(session = self.id, "Previous search was abandoned, discarding process");
            self.discard();
        }
        self.ensure_started().await?;
        let Some(engine) = self.engine.as_mut() else {
            return Err(PipelineError::EngineUnavailable(format!(
                "session {} has no engine",
                self.id
            )));
        };

        self.searching = true;
        let outcome = tokio::time::timeout(self.response_timeout, engine.evaluate(request)).await;
        self.searching = false;

        match outcome {
            Ok(Ok(response)) => Ok(response),
            Ok(Err(e)) => {
                warn!(session = self.id, error = %e, "Engine search failed, discarding process");
                self.discard();
                Err(e)
            }
            Err(_) => {
                warn!(session = self.id, timeout = ?self.response_timeout, "Engine search timed out, discarding process");
                self.discard();
                Err(PipelineError::EngineTimeout(format!(
                    "no answer within {:?} for {}",
                    self.response_timeout, request.fen
                )))
            }
        }
    }

    async fn ensure_started(&mut self) -> Result<(), PipelineError> {
        if self.engine.is_some() {
            return Ok(());
        }

        match self.factory.spawn().await {
            Ok(engine) => {
                if self.marked_down {
                    self.marked_down = false;
                    self.health.down.fetch_sub(1, Ordering::SeqCst);
                }
                if self.started {
                    self.restarts += 1;
                    debug!(session = self.id, restarts = self.restarts, "Engine restarted");
                }
                self.started = true;
                self.engine = Some(engine);
                self.health.running.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
            Err(e) => {
                if !self.marked_down {
                    self.marked_down = true;
                    self.health.down.fetch_add(1, Ordering::SeqCst);
                }
                if self.health.running() == 0 {
                    warn!(session = self.id, down = self.health.down(), "No engine running in the pool");
                    Err(PipelineError::EnginePoolExhausted(self.health.size))
                } else {
                    Err(match e {
                        PipelineError::EngineUnavailable(_) => e,
                        other => PipelineError::EngineUnavailable(other.to_string()),
                    })
                }
            }
        }
    }

    fn take_engine(&mut self) -> Option<F::Engine> {
        let engine = self.engine.take();
        if engine.is_some() {
            self.health.running.fetch_sub(1, Ordering::SeqCst);
        }
        engine
    }

    /// Drop the process; the drop kills it if it is still alive.
    fn discard(&mut self) {
        drop(self.take_engine());
        self.searching = false;
    }

    pub async fn quit(&mut self) {
        if let Some(mut engine) = self.take_engine() {
            engine.quit().await;
        }
    }
}
