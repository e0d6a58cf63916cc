//! Random sensor values for running the relay without hardware or a cloud
//! account.

use super::{RawSample, SampleSource, SourceError};
use async_trait::async_trait;
use chrono::Utc;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::sync::Mutex;

#[derive(Debug, Clone, Copy, PartialEq)]
enum Profile {
    /// Uniform in `[low, high)`, rounded to one decimal.
    Decimal { low: f64, high: f64 },
    /// Uniform integer in `[low, high]`.
    Whole { low: u32, high: u32 },
    Constant(f64),
}

fn profile_for(metric: &str) -> Option<Profile> {
    match metric.to_ascii_lowercase().as_str() {
        "temp" | "rt" => Some(Profile::Decimal {
            low: 24.0,
            high: 32.0,
        }),
        "humi" | "rh" => Some(Profile::Decimal {
            low: 40.0,
            high: 75.0,
        }),
        "light" | "lux" => Some(Profile::Whole { low: 0, high: 800 }),
        // Motion stays idle.
        "pir" => Some(Profile::Constant(0.0)),
        _ => None,
    }
}

/// Produces a fresh, now-stamped sample on every fetch for the sensor kinds it
/// knows (temperature, humidity, light, motion). Other metrics get nothing.
pub struct SimulatedSource {
    rng: Mutex<StdRng>,
}

impl SimulatedSource {
    /// A fixed `seed` makes the value sequence reproducible.
    pub fn new(seed: Option<u64>) -> Self {
        let rng = match seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        Self {
            rng: Mutex::new(rng),
        }
    }

    fn draw(&self, profile: Profile) -> Result<f64, SourceError> {
        let mut rng = self
            .rng
            .lock()
            .map_err(|_| SourceError::Decode("simulator state poisoned".to_string()))?;
        Ok(match profile {
            Profile::Decimal { low, high } => (rng.gen_range(low..high) * 10.0).round() / 10.0,
            Profile::Whole { low, high } => f64::from(rng.gen_range(low..=high)),
            Profile::Constant(value) => value,
        })
    }
}

#[async_trait]
impl SampleSource for SimulatedSource {
    async fn fetch_latest(&self, metric: &str) -> Result<Option<RawSample>, SourceError> {
        let Some(profile) = profile_for(metric) else {
            return Ok(None);
        };
        let value = self.draw(profile)?;
        Ok(Some(RawSample::new(metric, value, Utc::now())))
    }
}
