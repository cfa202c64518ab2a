use std::time::Duration;

use image::RgbImage;
use nokhwa::pixel_format::RgbFormat;
use nokhwa::utils::{CameraIndex, RequestedFormat, RequestedFormatType};
use nokhwa::Camera;
use thiserror::Error;

use crate::models::CameraConfig;

#[derive(Debug, Error)]
pub enum CameraError {
    #[error("cannot open camera {index}: {source}")]
    Open {
        index: u32,
        source: nokhwa::NokhwaError,
    },
    #[error("camera {index} opened but yields no frames: {source}")]
    NoFrame {
        index: u32,
        source: nokhwa::NokhwaError,
    },
    #[error("frame read failed: {0}")]
    Frame(#[from] nokhwa::NokhwaError),
}

/// Seam between the mapping engine and the capture hardware.
pub trait FrameSource: Send {
    fn read(&mut self) -> Result<RgbImage, CameraError>;
}

/// Camera-backed frame source. The stream is released when the value is
/// dropped, at session end.
pub struct CameraSource {
    camera: Camera,
}

impl CameraSource {
    /// Open the device, retrying a bounded number of times. Each attempt must both
    /// open the device and read one frame; a device that opens but never
    /// delivers is as unusable as one that will not open. Returns the first
    /// frame so the caller can latch the session's frame dimensions.
    pub async fn open(config: &CameraConfig) -> Result<(Self, RgbImage), CameraError> {
        let mut attempt = 0;

        loop {
            attempt += 1;

            match Self::try_open(config.index) {
                Ok((camera, frame)) => {
                    info!(
                        attempt = attempt,
                        width = frame.width(),
                        height = frame.height(),
                        "camera ready"
                    );
                    return Ok((Self { camera }, frame));
                }
                Err(error) if attempt >= config.open_attempts => return Err(error),
                Err(error) => {
                    warn!(attempt = attempt, error = %error, "camera attempt failed");
                }
            }

            tokio::time::sleep(Duration::from_millis(config.retry_delay_ms)).await;
        }
    }

    fn try_open(index: u32) -> Result<(Camera, RgbImage), CameraError> {
        let requested = RequestedFormat::new::<RgbFormat>(RequestedFormatType::AbsoluteHighestResolution);

        let mut camera = Camera::new(CameraIndex::Index(index), requested)
            .map_err(|source| CameraError::Open { index, source })?;
        camera
            .open_stream()
            .map_err(|source| CameraError::Open { index, source })?;

        // Distinguish "cannot open" from "opens but yields no frames"
        let frame = camera
            .frame()
            .and_then(decode)
            .map_err(|source| CameraError::NoFrame { index, source })?;

        Ok((camera, frame))
    }
}

impl FrameSource for CameraSource {
    fn read(&mut self) -> Result<RgbImage, CameraError> {
        Ok(self.camera.frame().and_then(decode)?)
    }
}

fn decode(buffer: nokhwa::Buffer) -> Result<RgbImage, nokhwa::NokhwaError> {
    let decoded = buffer.decode_image::<RgbFormat>()?;
    let (width, height) = decoded.dimensions();

    RgbImage::from_raw(width, height, decoded.into_raw()).ok_or_else(|| {
        nokhwa::NokhwaError::GeneralError("decoded frame has inconsistent dimensions".to_owned())
    })
}
