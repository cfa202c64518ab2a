use serde_derive::{Deserialize, Serialize};
use validator::Validate;

use crate::models::{LedRecord, Roi};
use crate::session::MappingSession;

#[derive(Debug, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct StartMappingRequest {
    #[validate(nested)]
    pub roi: Roi,
    #[validate(range(min = 0., max = 1.))]
    pub brightness: f32,
    #[serde(default)]
    pub led_power: bool,
    #[serde(default)]
    pub num_leds: Option<usize>,
    #[serde(default)]
    pub resume_from_led: Option<usize>,
}

#[derive(Debug, Deserialize)]
pub struct ConnectRequest {
    pub port: Option<String>,
    pub baud: Option<u32>,
}

#[derive(Debug, Deserialize)]
pub struct PowerRequest {
    pub on: bool,
}

/// Manual single-LED set: index plus brightness in [0, 1].
#[derive(Debug, Deserialize)]
pub struct SetRequest {
    pub i: usize,
    pub b: f32,
}

#[derive(Debug, Deserialize)]
pub struct PixelRequest {
    pub index: usize,
    pub r: u8,
    pub g: u8,
    pub b: u8,
}

#[derive(Debug, Deserialize)]
pub struct BatchRequest {
    pub pixels: Vec<(usize, u8, u8, u8)>,
}

#[derive(Debug, Deserialize)]
pub struct BlinkRequest {
    pub index: usize,
}

#[derive(Debug, Deserialize)]
pub struct ResumeQuery {
    pub resume_from: usize,
    pub brightness: Option<f32>,
}

/// Live session snapshot for the frontend. Records collapse to the `(0,0)`
/// sentinel here, at the boundary.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusResponse {
    pub running: bool,
    pub done: bool,
    pub aborted: bool,
    pub coords: Vec<[f32; 2]>,
    pub w: u32,
    pub h: u32,
    pub roi: Option<Roi>,
    pub current_led: Option<usize>,
    pub total_leds: usize,
    pub consecutive_failures: u32,
}

impl From<MappingSession> for StatusResponse {
    fn from(session: MappingSession) -> Self {
        Self {
            running: session.running,
            done: session.done,
            aborted: session.aborted,
            coords: session.records.iter().map(LedRecord::encode).collect(),
            w: session.width,
            h: session.height,
            roi: session.roi,
            current_led: session.current_led,
            total_leds: session.total_leds,
            consecutive_failures: session.consecutive_failures,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_encodes_the_sentinel_at_the_boundary() {
        let mut session = MappingSession::default();
        session.records = vec![
            LedRecord::NotFound,
            LedRecord::Found { x: 0.5, y: 0.25 },
        ];
        session.total_leds = 2;

        let response = StatusResponse::from(session);
        assert_eq!(response.coords, vec![[0., 0.], [0.5, 0.25]]);
        assert_eq!(response.total_leds, 2);
    }
}
