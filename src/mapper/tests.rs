use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use approx::assert_abs_diff_eq;
use image::{Rgb, RgbImage};

use super::*;
use crate::models::Roi;

const WIDTH: u32 = 640;
const HEIGHT: u32 = 480;

/// Shared test fixture: the driver mutates the lit LED, the frame source
/// renders it, mirroring the real illuminate/observe split.
struct Rig {
    lit: Option<(usize, f32)>,
    positions: HashMap<usize, (u32, u32)>,
    /// Above this brightness the spot bleeds into a second component.
    bloom_above: f32,
    brightness_log: Vec<f32>,
    illuminated: Vec<usize>,
    fail_reads: bool,
}

impl Rig {
    fn new(positions: HashMap<usize, (u32, u32)>) -> Arc<Mutex<Rig>> {
        Arc::new(Mutex::new(Rig {
            lit: None,
            positions,
            bloom_above: f32::INFINITY,
            brightness_log: Vec::new(),
            illuminated: Vec::new(),
            fail_reads: false,
        }))
    }
}

struct RigDriver(Arc<Mutex<Rig>>);

#[async_trait::async_trait]
impl LedDriver for RigDriver {
    async fn illuminate(&self, index: usize, brightness: f32) -> Result<(), SerialError> {
        let mut rig = self.0.lock().unwrap();
        rig.lit = Some((index, brightness));
        rig.brightness_log.push(brightness);
        rig.illuminated.push(index);
        Ok(())
    }

    async fn extinguish(&self, _index: usize) -> Result<(), SerialError> {
        self.0.lock().unwrap().lit = None;
        Ok(())
    }

    async fn set_strip_brightness(&self, _value: u8) -> Result<(), SerialError> {
        Ok(())
    }

    async fn all_off(&self) -> Result<(), SerialError> {
        self.0.lock().unwrap().lit = None;
        Ok(())
    }
}

struct RigFrames(Arc<Mutex<Rig>>);

impl FrameSource for RigFrames {
    fn read(&mut self) -> Result<RgbImage, CameraError> {
        let rig = self.0.lock().unwrap();

        if rig.fail_reads {
            return Err(CameraError::Frame(nokhwa::NokhwaError::ReadFrameError(
                "camera disconnected".into(),
            )));
        }

        let mut frame = RgbImage::new(WIDTH, HEIGHT);
        if let Some((index, brightness)) = rig.lit {
            if let Some(&(x, y)) = rig.positions.get(&index) {
                frame.put_pixel(x, y, Rgb([255, 255, 255]));
                if brightness > rig.bloom_above {
                    frame.put_pixel(x + 30, y, Rgb([255, 255, 255]));
                }
            }
        }

        Ok(frame)
    }
}

/// The scan region used throughout: pixels 128..320 x 96..240 on 640x480.
fn roi() -> Roi {
    Roi {
        x: 0.2,
        y: 0.2,
        w: 0.3,
        h: 0.3,
    }
}

fn engine(
    rig: &Arc<Mutex<Rig>>,
    store: &SessionStore,
    config: MappingConfig,
    params: MappingParams,
    seed: Vec<LedRecord>,
) -> MappingEngine {
    let first_frame = RgbImage::new(WIDTH, HEIGHT);
    MappingEngine::new(
        Box::new(RigFrames(rig.clone())),
        &first_frame,
        Arc::new(RigDriver(rig.clone())),
        store.clone(),
        config,
        params,
        seed,
    )
}

fn params(policy: TerminationPolicy, brightness: f32, resume_from: usize) -> MappingParams {
    MappingParams {
        roi: roi(),
        brightness,
        policy,
        resume_from,
    }
}

#[tokio::test(start_paused = true)]
async fn maps_a_led_and_stops_at_the_failure_threshold() {
    let mut positions = HashMap::new();
    positions.insert(0, (300, 230));
    let rig = Rig::new(positions);

    let store = SessionStore::new();
    store.try_start(Some(roi()), Vec::new()).unwrap();

    let outcome = engine(
        &rig,
        &store,
        MappingConfig::default(),
        params(
            TerminationPolicy::Adaptive {
                failure_threshold: 3,
            },
            1.0,
            0,
        ),
        Vec::new(),
    )
    .run()
    .await
    .unwrap();

    // LED 0 found, then three misses in a row end the scan
    assert_eq!(outcome.records.len(), 4);
    assert_eq!(outcome.consecutive_failures, 3);
    match outcome.records[0] {
        LedRecord::Found { x, y } => {
            assert_abs_diff_eq!(x, 300. / WIDTH as f32, epsilon = 0.003);
            assert_abs_diff_eq!(y, 230. / HEIGHT as f32, epsilon = 0.003);
        }
        LedRecord::NotFound => panic!("LED 0 not found"),
    }
    assert!(outcome.records[1..].iter().all(|r| !r.is_found()));

    // foundCount == totalProcessed - threshold
    let found = outcome.records.iter().filter(|r| r.is_found()).count();
    assert_eq!(found, outcome.records.len() - 3);

    let snapshot = store.snapshot();
    assert_eq!(snapshot.records.len(), snapshot.total_leds);
    assert_eq!(snapshot.consecutive_failures, 3);
}

#[tokio::test(start_paused = true)]
async fn bloom_is_rejected_until_brightness_decays() {
    let mut positions = HashMap::new();
    positions.insert(0, (200, 150));
    let rig = Rig::new(positions);
    rig.lock().unwrap().bloom_above = 0.7;

    let store = SessionStore::new();
    store.try_start(Some(roi()), Vec::new()).unwrap();

    let outcome = engine(
        &rig,
        &store,
        MappingConfig::default(),
        params(
            TerminationPolicy::FixedCount {
                count: 1,
                failure_threshold: 5,
            },
            1.0,
            0,
        ),
        Vec::new(),
    )
    .run()
    .await
    .unwrap();

    assert_eq!(outcome.records.len(), 1);
    assert!(outcome.records[0].is_found());

    // Two bloomed attempts, then the decayed level reads as one spot
    let log = rig.lock().unwrap().brightness_log.clone();
    assert!(log.len() >= 3, "log = {:?}", log);
    assert_abs_diff_eq!(log[0], 1.0, epsilon = 1e-6);
    assert_abs_diff_eq!(log[1], 0.8, epsilon = 1e-6);
    assert_abs_diff_eq!(log[2], 0.64, epsilon = 1e-6);
}

#[tokio::test(start_paused = true)]
async fn brightness_never_reaches_the_floor() {
    let mut positions = HashMap::new();
    positions.insert(0, (200, 150));
    let rig = Rig::new(positions);
    // Always blooming: the spot is never accepted at any level
    rig.lock().unwrap().bloom_above = 0.;

    let config = MappingConfig {
        min_brightness: 0.5,
        ..MappingConfig::default()
    };

    let store = SessionStore::new();
    store.try_start(Some(roi()), Vec::new()).unwrap();

    let outcome = engine(
        &rig,
        &store,
        config,
        params(
            TerminationPolicy::Adaptive {
                failure_threshold: 1,
            },
            0.6,
            0,
        ),
        Vec::new(),
    )
    .run()
    .await
    .unwrap();

    assert_eq!(outcome.records, vec![LedRecord::NotFound]);

    // 0.6 * 0.8 would land below the floor, so no reduction is issued
    let log = rig.lock().unwrap().brightness_log.clone();
    assert_eq!(log.len(), 1);
    assert!(log.iter().all(|&b| b > 0.5), "log = {:?}", log);
}

#[tokio::test(start_paused = true)]
async fn fixed_count_policy_stops_at_the_count() {
    let mut positions = HashMap::new();
    for i in 0..5usize {
        positions.insert(i, (140 + 20 * i as u32, 120));
    }
    let rig = Rig::new(positions);

    let store = SessionStore::new();
    store.try_start(Some(roi()), Vec::new()).unwrap();

    let outcome = engine(
        &rig,
        &store,
        MappingConfig::default(),
        params(
            TerminationPolicy::FixedCount {
                count: 3,
                failure_threshold: 5,
            },
            0.8,
            0,
        ),
        Vec::new(),
    )
    .run()
    .await
    .unwrap();

    assert_eq!(outcome.records.len(), 3);
    assert!(outcome.records.iter().all(|r| r.is_found()));
    assert_eq!(outcome.consecutive_failures, 0);
}

#[tokio::test(start_paused = true)]
async fn resume_leaves_seed_records_untouched() {
    let seed = vec![
        LedRecord::Found { x: 0.11, y: 0.12 },
        LedRecord::NotFound,
        LedRecord::Found { x: 0.2, y: 0.25 },
    ];

    let mut positions = HashMap::new();
    positions.insert(3, (200, 150));
    let rig = Rig::new(positions);

    let store = SessionStore::new();
    store.try_start(Some(roi()), seed.clone()).unwrap();

    let outcome = engine(
        &rig,
        &store,
        MappingConfig::default(),
        params(
            TerminationPolicy::Adaptive {
                failure_threshold: 2,
            },
            1.0,
            3,
        ),
        seed.clone(),
    )
    .run()
    .await
    .unwrap();

    // LED 3 found, LEDs 4 and 5 missing
    assert_eq!(outcome.records.len(), 6);
    assert_eq!(&outcome.records[..3], &seed[..]);
    match outcome.records[3] {
        LedRecord::Found { x, y } => {
            assert_abs_diff_eq!(x, 200. / WIDTH as f32, epsilon = 0.003);
            assert_abs_diff_eq!(y, 150. / HEIGHT as f32, epsilon = 0.003);
        }
        LedRecord::NotFound => panic!("LED 3 not found"),
    }

    // Earlier LEDs are never re-processed
    let illuminated = rig.lock().unwrap().illuminated.clone();
    assert!(illuminated.iter().all(|&i| i >= 3), "lit = {:?}", illuminated);

    let snapshot = store.snapshot();
    assert_eq!(snapshot.records.len(), 6);
    assert_eq!(&snapshot.records[..3], &seed[..]);
}

#[tokio::test(start_paused = true)]
async fn frameless_window_aborts_the_session() {
    let rig = Rig::new(HashMap::new());
    rig.lock().unwrap().fail_reads = true;

    let store = SessionStore::new();
    store.try_start(Some(roi()), Vec::new()).unwrap();

    let result = engine(
        &rig,
        &store,
        MappingConfig::default(),
        params(
            TerminationPolicy::Adaptive {
                failure_threshold: 5,
            },
            1.0,
            0,
        ),
        Vec::new(),
    )
    .run()
    .await;

    assert!(matches!(result, Err(MappingError::Camera(_))));
}

/// A dead serial link mid-session degrades to misses instead of failing the
/// scan; the circuit breaker ends it.
#[tokio::test(start_paused = true)]
async fn write_failures_degrade_to_misses() {
    struct DeafDriver;

    #[async_trait::async_trait]
    impl LedDriver for DeafDriver {
        async fn illuminate(&self, _index: usize, _brightness: f32) -> Result<(), SerialError> {
            Err(SerialError::NoDevice)
        }

        async fn extinguish(&self, _index: usize) -> Result<(), SerialError> {
            Err(SerialError::NoDevice)
        }

        async fn set_strip_brightness(&self, _value: u8) -> Result<(), SerialError> {
            Ok(())
        }

        async fn all_off(&self) -> Result<(), SerialError> {
            Ok(())
        }
    }

    let rig = Rig::new(HashMap::new());
    let store = SessionStore::new();
    store.try_start(Some(roi()), Vec::new()).unwrap();

    let first_frame = RgbImage::new(WIDTH, HEIGHT);
    let engine = MappingEngine::new(
        Box::new(RigFrames(rig.clone())),
        &first_frame,
        Arc::new(DeafDriver),
        store.clone(),
        MappingConfig::default(),
        params(
            TerminationPolicy::Adaptive {
                failure_threshold: 2,
            },
            1.0,
            0,
        ),
        Vec::new(),
    );

    let outcome = engine.run().await.unwrap();
    assert_eq!(outcome.records, vec![LedRecord::NotFound, LedRecord::NotFound]);
    assert_eq!(outcome.consecutive_failures, 2);
}
