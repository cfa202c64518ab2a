use std::sync::Arc;

use thiserror::Error;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;

use crate::mapper::{self, MappingParams, TerminationPolicy};
use crate::models::{Config, LedRecord, MappingRecord, Roi};
use crate::serial::{LedDriver, SerialChannel, SerialError};
use crate::session::{SessionConflict, SessionStore};

#[derive(Debug, Error)]
pub enum StartError {
    #[error(transparent)]
    Conflict(#[from] SessionConflict),
    #[error("serial connect failed: {0}")]
    Serial(#[from] SerialError),
    #[error("no previous mapping to resume from")]
    NoPriorSession,
}

/// At most one mapping worker lives here; the handle stays joinable and
/// abortable instead of being fired and forgotten.
struct TaskSlot(Mutex<Option<JoinHandle<()>>>);

impl TaskSlot {
    fn new() -> Self {
        Self(Mutex::new(None))
    }

    async fn replace(&self, handle: JoinHandle<()>) {
        if let Some(old) = self.0.lock().await.replace(handle) {
            if !old.is_finished() {
                // Single-flight is enforced by the session store; a live
                // handle here means the store was bypassed
                warn!("replacing a live mapping task");
                old.abort();
            }
        }
    }

    async fn shutdown(&self) {
        if let Some(handle) = self.0.lock().await.take() {
            handle.abort();
            handle.await.ok();
        }
    }
}

#[derive(Debug, Clone)]
pub struct SessionRequest {
    pub roi: Roi,
    pub brightness: f32,
    pub led_count: Option<usize>,
    pub resume_from: Option<usize>,
}

pub struct GlobalData {
    config: Config,
    serial: Arc<SerialChannel>,
    sessions: SessionStore,
    mapper: TaskSlot,
}

#[derive(Clone)]
pub struct Global(Arc<GlobalData>);

impl GlobalData {
    pub fn new(config: Config) -> Self {
        let serial = Arc::new(SerialChannel::new(config.serial.clone()));

        Self {
            config,
            serial,
            sessions: SessionStore::new(),
            mapper: TaskSlot::new(),
        }
    }

    pub fn wrap(self) -> Global {
        Global(Arc::new(self))
    }
}

impl Global {
    pub fn config(&self) -> &Config {
        &self.0.config
    }

    pub fn serial(&self) -> &SerialChannel {
        &self.0.serial
    }

    pub fn sessions(&self) -> &SessionStore {
        &self.0.sessions
    }

    /// Start a mapping session: resolve the seed for resumes, make sure the
    /// serial link is up, claim the single-flight slot and spawn the worker.
    pub async fn start_session(&self, request: SessionRequest) -> Result<(), StartError> {
        let config = &self.0.config;

        let seed = match request.resume_from {
            Some(resume_from) => self.prior_records(resume_from).await?,
            None => Vec::new(),
        };

        let policy = match request.led_count {
            Some(count) => TerminationPolicy::FixedCount {
                count,
                failure_threshold: config.mapping.failure_threshold,
            },
            None => TerminationPolicy::Adaptive {
                failure_threshold: config.mapping.failure_threshold,
            },
        };

        if !self.0.serial.is_open().await {
            self.0.serial.connect(None, None).await?;
        }

        self.0.sessions.try_start(Some(request.roi), seed.clone())?;

        let params = MappingParams {
            roi: request.roi,
            brightness: request.brightness,
            policy,
            resume_from: seed.len(),
        };

        info!(
            roi = ?request.roi,
            brightness = request.brightness,
            resume_from = params.resume_from,
            "starting mapping session"
        );

        let handle = tokio::spawn({
            let store = self.0.sessions.clone();
            let driver: Arc<dyn LedDriver> = self.0.serial.clone();
            let camera = config.camera.clone();
            let mapping = config.mapping.clone();

            async move {
                if let Err(error) =
                    mapper::run_session(store, driver, camera, mapping, params, seed).await
                {
                    error!(error = %error, "mapping session failed");
                }
            }
        });
        self.0.mapper.replace(handle).await;

        Ok(())
    }

    /// Resume from a given LED index, reusing the previous session's ROI.
    pub async fn resume_session(&self, resume_from: usize, brightness: f32) -> Result<(), StartError> {
        let snapshot = self.0.sessions.snapshot();
        let roi = match snapshot.roi {
            Some(roi) => roi,
            None => {
                MappingRecord::load(&self.0.config.mapping.output)
                    .await
                    .map_err(|_| StartError::NoPriorSession)?
                    .roi
            }
        };

        self.start_session(SessionRequest {
            roi,
            brightness,
            led_count: None,
            resume_from: Some(resume_from),
        })
        .await
    }

    /// Records up to `resume_from`, taken from the live store when it still
    /// holds them, else decoded from the persisted mapping.
    async fn prior_records(&self, resume_from: usize) -> Result<Vec<LedRecord>, StartError> {
        let snapshot = self.0.sessions.snapshot();

        let mut records = if snapshot.roi.is_some() && !snapshot.records.is_empty() {
            snapshot.records
        } else {
            MappingRecord::load(&self.0.config.mapping.output)
                .await
                .map_err(|_| StartError::NoPriorSession)?
                .records()
        };

        records.truncate(resume_from);
        Ok(records)
    }

    /// Stop the worker, darken the strip and drop the serial link. Runs on
    /// every process exit path.
    pub async fn shutdown(&self) {
        self.0.mapper.shutdown().await;
        self.0.serial.close().await;
    }
}
