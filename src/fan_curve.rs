//! Fan curve calculations for temperature-based speed control.
//!
//! A curve is a sorted list of thresholds; the target speed is the speed of
//! the greatest threshold at or below the current temperature, clamped to
//! the first and last points. [`CurveFollower`] adds hysteresis on top so
//! that a fan does not oscillate around a threshold.

use serde::{Deserialize, Serialize};

use crate::error::{FanControlError, Result};

/// Default hysteresis margin in °C.
pub const DEFAULT_HYSTERESIS: f32 = 2.0;

/// Speed forced while the critical temperature is exceeded.
pub const CRITICAL_SPEED: f32 = 100.0;

/// One threshold of a fan curve.
///
/// # Example
///
/// ```
/// use nbfcd::fan_curve::FanCurvePoint;
///
/// let point = FanCurvePoint { temperature: 60.0, speed: 45.0 }; // 60°C -> 45%
/// let from_tuple: FanCurvePoint = (60.0, 45.0).into();
/// assert_eq!(point, from_tuple);
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct FanCurvePoint {
    /// Threshold in °C.
    pub temperature: f32,
    /// Target speed in percent (0-100).
    pub speed: f32,
}

impl From<(f32, f32)> for FanCurvePoint {
    fn from(value: (f32, f32)) -> Self {
        Self {
            temperature: value.0,
            speed: value.1,
        }
    }
}

/// Validated fan curve.
///
/// Thresholds are strictly increasing, speeds are non-decreasing and lie in
/// 0..=100. Deserializing goes through the same validation.
///
/// # Example
///
/// ```
/// use nbfcd::fan_curve::FanCurve;
///
/// let curve = FanCurve::from_pairs(&[(40.0, 30.0), (60.0, 60.0), (80.0, 100.0)])?;
/// assert_eq!(curve.map(20.0), 30.0);
/// assert_eq!(curve.map(65.0), 60.0);
/// assert_eq!(curve.map(95.0), 100.0);
/// # Ok::<(), nbfcd::error::FanControlError>(())
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "Vec<FanCurvePoint>", into = "Vec<FanCurvePoint>")]
pub struct FanCurve {
    points: Vec<FanCurvePoint>,
}

impl FanCurve {
    pub fn new(points: Vec<FanCurvePoint>) -> Result<Self> {
        validate_points(&points)?;
        Ok(Self { points })
    }

    /// Builds a curve from `(temperature, speed)` pairs.
    pub fn from_pairs(pairs: &[(f32, f32)]) -> Result<Self> {
        Self::new(pairs.iter().copied().map(Into::into).collect())
    }

    pub fn points(&self) -> &[FanCurvePoint] {
        &self.points
    }

    /// Target speed for `temperature` without hysteresis.
    pub fn map(&self, temperature: f32) -> f32 {
        lookup(&self.points, temperature)
    }
}

impl TryFrom<Vec<FanCurvePoint>> for FanCurve {
    type Error = FanControlError;

    fn try_from(points: Vec<FanCurvePoint>) -> Result<Self> {
        Self::new(points)
    }
}

impl From<FanCurve> for Vec<FanCurvePoint> {
    fn from(curve: FanCurve) -> Self {
        curve.points
    }
}

/// Maps a temperature onto an unvalidated list of points.
///
/// Fails with `InvalidConfiguration` on an empty curve.
pub fn map(curve: &[FanCurvePoint], temperature: f32) -> Result<f32> {
    if curve.is_empty() {
        return Err(FanControlError::invalid("fan curve has no points"));
    }
    Ok(lookup(curve, temperature))
}

fn lookup(points: &[FanCurvePoint], temperature: f32) -> f32 {
    points
        .iter()
        .rfind(|p| p.temperature <= temperature)
        .or(points.first())
        .map(|p| p.speed)
        .unwrap_or(CRITICAL_SPEED)
}

fn validate_points(points: &[FanCurvePoint]) -> Result<()> {
    if points.is_empty() {
        return Err(FanControlError::invalid("fan curve has no points"));
    }

    if let Some(p) = points
        .iter()
        .find(|p| !p.temperature.is_finite() || !(0.0..=100.0).contains(&p.speed))
    {
        return Err(FanControlError::invalid(format!(
            "curve point ({}°C, {}%) is out of range",
            p.temperature, p.speed
        )));
    }

    for pair in points.windows(2) {
        let (a, b) = (pair[0], pair[1]);
        if b.temperature <= a.temperature {
            return Err(FanControlError::invalid(format!(
                "curve thresholds must strictly increase ({}°C is followed by {}°C)",
                a.temperature, b.temperature
            )));
        }
        if b.speed < a.speed {
            return Err(FanControlError::invalid(format!(
                "curve speeds must not decrease ({}% at {}°C is followed by {}% at {}°C)",
                a.speed, a.temperature, b.speed, b.temperature
            )));
        }
    }

    Ok(())
}

/// Curve evaluation with hysteresis for one fan.
///
/// Raising the speed is never delayed. Lowering only happens once
/// `curve.map(t + margin)` is below the applied speed, so a fan stays at
/// its tier until the temperature has fallen more than `margin` below the
/// threshold that raised it.
#[derive(Debug, Clone)]
pub struct CurveFollower {
    hysteresis: f32,
    critical_temperature: Option<f32>,
    critical: bool,
    applied: Option<f32>,
}

impl CurveFollower {
    pub fn new(hysteresis: f32) -> Self {
        Self {
            hysteresis: hysteresis.max(0.0),
            critical_temperature: None,
            critical: false,
            applied: None,
        }
    }

    pub fn with_critical_temperature(mut self, critical: Option<f32>) -> Self {
        self.critical_temperature = critical;
        self
    }

    /// Computes the next target against the last committed speed.
    ///
    /// The target only counts as applied once it is passed to
    /// [`commit`](Self::commit).
    pub fn next(&mut self, curve: &FanCurve, temperature: f32) -> f32 {
        if self.is_critical(temperature) {
            return CRITICAL_SPEED;
        }

        let raw = curve.map(temperature);
        match self.applied {
            Some(current) if raw < current => {
                if curve.map(temperature + self.hysteresis) < current {
                    raw
                } else {
                    current
                }
            }
            _ => raw,
        }
    }

    /// Records `speed` as written to the fan.
    pub fn commit(&mut self, speed: f32) {
        self.applied = Some(speed);
    }

    pub fn reset(&mut self) {
        self.applied = None;
        self.critical = false;
    }

    fn is_critical(&mut self, temperature: f32) -> bool {
        let Some(limit) = self.critical_temperature else {
            return false;
        };

        self.critical = if self.critical {
            temperature >= limit - self.hysteresis
        } else {
            temperature >= limit
        };
        self.critical
    }
}

impl Default for CurveFollower {
    fn default() -> Self {
        Self::new(DEFAULT_HYSTERESIS)
    }
}
