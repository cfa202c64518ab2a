use std::sync::Arc;
use std::time::Duration;

use image::RgbImage;
use thiserror::Error;
use tokio::time::Instant;

use crate::camera::{CameraError, CameraSource, FrameSource};
use crate::detect;
use crate::models::{
    CameraConfig, LedRecord, MappingConfig, MappingFileError, MappingRecord, RoiPixels,
};
use crate::serial::{LedDriver, SerialError};
use crate::session::SessionStore;

#[cfg(test)]
mod tests;

#[derive(Debug, Error)]
pub enum MappingError {
    #[error("serial error: {0}")]
    Serial(#[from] SerialError),
    #[error("camera error: {0}")]
    Camera(#[from] CameraError),
    #[error("cannot persist mapping: {0}")]
    Persist(#[from] MappingFileError),
}

/// When the per-LED discovery loop ends.
///
/// The true LED count is usually not known in advance: the adaptive policy
/// scans until enough LEDs in a row yield no spot, which is read as having
/// walked past the physical end of the strip. The failure breaker also
/// applies when the count is known.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TerminationPolicy {
    Adaptive {
        failure_threshold: u32,
    },
    FixedCount {
        count: usize,
        failure_threshold: u32,
    },
}

impl TerminationPolicy {
    fn reached(&self, next_index: usize, consecutive_failures: u32) -> bool {
        match *self {
            TerminationPolicy::Adaptive { failure_threshold } => {
                consecutive_failures >= failure_threshold
            }
            TerminationPolicy::FixedCount {
                count,
                failure_threshold,
            } => next_index >= count || consecutive_failures >= failure_threshold,
        }
    }
}

#[derive(Debug, Clone)]
pub struct MappingParams {
    pub roi: crate::models::Roi,
    pub brightness: f32,
    pub policy: TerminationPolicy,
    /// First LED index to process; equals the number of seed records.
    pub resume_from: usize,
}

#[derive(Debug)]
pub struct MappingOutcome {
    pub records: Vec<LedRecord>,
    pub consecutive_failures: u32,
}

enum LedOutcome {
    Found { x: f32, y: f32 },
    NotFound,
}

/// The per-session discovery loop: one engine, one worker, one camera.
pub struct MappingEngine {
    frames: Box<dyn FrameSource>,
    driver: Arc<dyn LedDriver>,
    store: SessionStore,
    config: MappingConfig,
    params: MappingParams,
    bounds: RoiPixels,
    frame_width: u32,
    frame_height: u32,
    records: Vec<LedRecord>,
    consecutive_failures: u32,
}

impl MappingEngine {
    pub fn new(
        frames: Box<dyn FrameSource>,
        first_frame: &RgbImage,
        driver: Arc<dyn LedDriver>,
        store: SessionStore,
        config: MappingConfig,
        params: MappingParams,
        seed: Vec<LedRecord>,
    ) -> Self {
        let (frame_width, frame_height) = first_frame.dimensions();
        let bounds = params.roi.to_pixels(frame_width, frame_height);

        Self {
            frames,
            driver,
            store,
            config,
            params,
            bounds,
            frame_width,
            frame_height,
            records: seed,
            consecutive_failures: 0,
        }
    }

    pub async fn run(mut self) -> Result<MappingOutcome, MappingError> {
        let base = self
            .params
            .brightness
            .clamp(self.config.min_brightness, self.config.max_brightness);

        // Session-start hardware state: global brightness set, strip dark
        self.driver
            .set_strip_brightness((base * 255.) as u8)
            .await?;
        self.driver.all_off().await?;
        tokio::time::sleep(Duration::from_millis(self.config.start_settle_ms)).await;

        if self.params.resume_from > 0 {
            info!(resume_from = self.params.resume_from, "resuming mapping");
        }

        let mut index = self.params.resume_from;
        while !self.params.policy.reached(index, self.consecutive_failures) {
            self.store
                .apply(|session| session.current_led = Some(index));

            let record = match self.map_led(index, base).await? {
                LedOutcome::Found { x, y } => {
                    self.consecutive_failures = 0;
                    info!(led = index, x = x, y = y, "spot found");
                    LedRecord::Found { x, y }
                }
                LedOutcome::NotFound => {
                    self.consecutive_failures += 1;
                    debug!(
                        led = index,
                        failures = self.consecutive_failures,
                        "no spot"
                    );
                    LedRecord::NotFound
                }
            };

            self.records.push(record);
            index += 1;

            let total_leds = self.records.len();
            let consecutive_failures = self.consecutive_failures;
            self.store.apply(move |session| {
                session.records.push(record);
                session.total_leds = total_leds;
                session.consecutive_failures = consecutive_failures;
            });
        }

        let found = self.records.iter().filter(|r| r.is_found()).count();
        info!(
            total = self.records.len(),
            found = found,
            failures = self.consecutive_failures,
            "mapping loop finished"
        );

        Ok(MappingOutcome {
            records: self.records,
            consecutive_failures: self.consecutive_failures,
        })
    }

    /// Illuminate one LED and search for it until detected or the window is
    /// spent. Returns an error only when the camera went away entirely.
    async fn map_led(&mut self, index: usize, base: f32) -> Result<LedOutcome, MappingError> {
        let mut brightness = base;
        let mut reductions = 0u32;

        if let Err(error) = self.driver.illuminate(index, brightness).await {
            // Not fatal: the channel reconnects on its next use and a dark
            // LED counts as a miss
            warn!(led = index, error = %error, "illuminate failed");
        }

        let lit = Instant::now();
        let deadline = lit + Duration::from_millis(self.config.window_ms);
        let reduce_before = lit + Duration::from_millis(self.config.window_ms * 7 / 10);

        tokio::time::sleep(Duration::from_millis(self.config.settle_ms)).await;

        let mut attempts = 0u32;
        let mut frames_read = 0u32;
        let mut camera_error = None;
        let mut found = None;

        while found.is_none()
            && attempts < self.config.max_attempts
            && Instant::now() < deadline
        {
            attempts += 1;

            let frame = match self.frames.read() {
                Ok(frame) => {
                    frames_read += 1;
                    frame
                }
                Err(error) => {
                    warn!(led = index, error = %error, "frame read failed");
                    camera_error = Some(error);
                    continue;
                }
            };

            let gray = detect::prepare_roi(&frame, &self.bounds);
            match detect::find_spot(&gray, self.config.tolerance) {
                Some(spot) => {
                    let x = (self.bounds.x as f32 + spot.x) / self.frame_width as f32;
                    let y = (self.bounds.y as f32 + spot.y) / self.frame_height as f32;
                    found = Some((x, y));
                }
                None => {
                    // Zero or several blobs. Dimming the LED shrinks its
                    // bloom until it reads as a single spot.
                    if Instant::now() < reduce_before && reductions < self.config.max_reductions {
                        let reduced = brightness * self.config.decay;

                        if reduced > self.config.min_brightness {
                            brightness = reduced;
                            reductions += 1;
                            debug!(led = index, brightness = brightness, "reducing brightness");

                            if let Err(error) = self.driver.illuminate(index, brightness).await {
                                warn!(led = index, error = %error, "re-illuminate failed");
                            }
                            tokio::time::sleep(Duration::from_millis(
                                self.config.reduce_settle_ms,
                            ))
                            .await;
                        } else {
                            // Floor reached: keep watching at this level
                            reductions = self.config.max_reductions;
                        }
                    }
                }
            }
        }

        if let Err(error) = self.driver.extinguish(index).await {
            warn!(led = index, error = %error, "extinguish failed");
        }

        if frames_read == 0 {
            if let Some(error) = camera_error {
                // Not a single frame in the whole window: the camera is gone
                return Err(error.into());
            }
        }

        Ok(match found {
            Some((x, y)) => LedOutcome::Found { x, y },
            None => LedOutcome::NotFound,
        })
    }
}

/// Session worker: acquire the camera, run the engine, hand the result to
/// the persistence sink and publish the terminal snapshot. LEDs are
/// extinguished on every exit path.
pub async fn run_session(
    store: SessionStore,
    driver: Arc<dyn LedDriver>,
    camera: CameraConfig,
    mapping: MappingConfig,
    params: MappingParams,
    seed: Vec<LedRecord>,
) -> Result<(), MappingError> {
    // A frontend preview may still hold the device
    tokio::time::sleep(Duration::from_millis(camera.prestart_delay_ms)).await;

    let (frames, first_frame) = match CameraSource::open(&camera).await {
        Ok(opened) => opened,
        Err(error) => {
            error!(error = %error, "camera unavailable, aborting session");
            if let Err(error) = driver.all_off().await {
                warn!(error = %error, "cannot extinguish LEDs");
            }
            store.finish(true);
            return Err(error.into());
        }
    };

    let (width, height) = first_frame.dimensions();
    let roi = params.roi;
    store.apply(move |session| {
        session.width = width;
        session.height = height;
        session.roi = Some(roi);
    });

    let engine = MappingEngine::new(
        Box::new(frames),
        &first_frame,
        driver.clone(),
        store.clone(),
        mapping.clone(),
        params,
        seed,
    );
    let result = engine.run().await;

    if let Err(error) = driver.all_off().await {
        warn!(error = %error, "cannot extinguish LEDs");
    }

    match result {
        Ok(outcome) => {
            let record = MappingRecord::from_records(
                &outcome.records,
                roi,
                width,
                height,
                outcome.consecutive_failures,
            );
            let saved = record.save(&mapping.output).await;
            store.finish(false);

            match saved {
                Ok(()) => {
                    info!(
                        path = %mapping.output.display(),
                        found = record.found_count,
                        total = record.total_processed,
                        "mapping saved"
                    );
                    Ok(())
                }
                Err(error) => Err(error.into()),
            }
        }
        Err(error) => {
            store.finish(true);
            Err(error)
        }
    }
}
