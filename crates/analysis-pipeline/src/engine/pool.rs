//! Fixed-size pool of engine sessions.
//!
//! Acquisition is FIFO (tokio's semaphore is fair) and bounded by a
//! timeout. A session that failed comes back without a process and is
//! restarted by whoever acquires it next.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tokio::sync::{Semaphore, SemaphorePermit};
use tracing::{info, warn};

use super::session::PoolHealth;
use super::{EngineFactory, EngineRequest, EngineResponse, EngineSession};
use crate::config::{EngineSettings, RetryPolicy};
use crate::error::PipelineError;

pub struct EnginePool<F: EngineFactory> {
    idle: Mutex<VecDeque<EngineSession<F>>>,
    permits: Semaphore,
    size: usize,
    acquire_timeout: Duration,
    health: Arc<PoolHealth>,
}

impl<F: EngineFactory> EnginePool<F> {
    pub fn new(factory: F, size: usize, response_timeout: Duration, acquire_timeout: Duration) -> Self {
        let size = size.max(1);
        let factory = Arc::new(factory);
        let health = Arc::new(PoolHealth::new(size));
        let idle = (0..size)
            .map(|id| EngineSession::new(id, factory.clone(), response_timeout, health.clone()))
            .collect();

        Self {
            idle: Mutex::new(idle),
            permits: Semaphore::new(size),
            size,
            acquire_timeout,
            health,
        }
    }

    pub fn from_settings(factory: F, settings: &EngineSettings) -> Self {
        Self::new(
            factory,
            settings.pool_size,
            settings.response_timeout,
            settings.acquire_timeout,
        )
    }

    pub fn size(&self) -> usize {
        self.size
    }

    /// Sessions whose last start attempt failed
    pub fn sessions_down(&self) -> usize {
        self.health.down()
    }

    fn idle(&self) -> MutexGuard<'_, VecDeque<EngineSession<F>>> {
        self.idle.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Wait for a free session, at most `acquire_timeout`.
    pub async fn acquire(&self) -> Result<SessionGuard<'_, F>, PipelineError> {
        let permit = tokio::time::timeout(self.acquire_timeout, self.permits.acquire())
            .await
            .map_err(|_| {
                PipelineError::EngineTimeout(format!(
                    "no engine session free within {:?}",
                    self.acquire_timeout
                ))
            })?
            .map_err(|_| PipelineError::EngineUnavailable("engine pool is shut down".into()))?;

        let session = self.idle().pop_front().ok_or_else(|| {
            PipelineError::EngineUnavailable("permit granted but no idle session".into())
        })?;

        Ok(SessionGuard {
            pool: self,
            session: Some(session),
            _permit: permit,
        })
    }

    /// Acquire, evaluate and release, retrying retryable failures with backoff.
    pub async fn evaluate(
        &self,
        request: &EngineRequest,
        retry: &RetryPolicy,
    ) -> Result<EngineResponse, PipelineError> {
        let mut attempt = 0u32;
        loop {
            let result = match self.acquire().await {
                Ok(mut session) => session.evaluate(request).await,
                Err(e) => Err(e),
            };

            match result {
                Ok(response) => return Ok(response),
                Err(e) if e.is_retryable() && attempt < retry.max_retries => {
                    attempt += 1;
                    let delay = retry.delay_for(attempt);
                    warn!(attempt, error = %e, delay = ?delay, "Engine request failed, retrying");
                    tokio::time::sleep(delay).await;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Wait for every session to come back, quit the engines and close the pool.
    pub async fn shutdown(&self) {
        let Ok(all) = self.permits.acquire_many(self.size as u32).await else {
            return;
        };
        let sessions: Vec<EngineSession<F>> = self.idle().drain(..).collect();
        info!(sessions = sessions.len(), "Shutting down engine pool");
        for mut session in sessions {
            session.quit().await;
            self.idle().push_back(session);
        }
        self.permits.close();
        drop(all);
    }
}

/// Exclusive use of one session; returns it to the pool on drop.
pub struct SessionGuard<'a, F: EngineFactory> {
    pool: &'a EnginePool<F>,
    session: Option<EngineSession<F>>,
    _permit: SemaphorePermit<'a>,
}

impl<F: EngineFactory> SessionGuard<'_, F> {
    pub async fn evaluate(&mut self, request: &EngineRequest) -> Result<EngineResponse, PipelineError> {
        match self.session.as_mut() {
            Some(session) => session.evaluate(request).await,
            None => Err(PipelineError::EngineUnavailable("session already released".into())),
        }
    }

    pub fn release(self) {}
}

impl<F: EngineFactory> Drop for SessionGuard<'_, F> {
    fn drop(&mut self) {
        if let Some(session) = self.session.take() {
            self.pool.idle().push_back(session);
        }
    }
}
