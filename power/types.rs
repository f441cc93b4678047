use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Outcome distribution assumed by both the response generator and the fit.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Distribution {
    Gaussian,
    Exponential,
    Lognormal,
}

impl Distribution {
    pub fn name(self) -> &'static str {
        match self {
            Self::Gaussian => "gaussian",
            Self::Exponential => "exponential",
            Self::Lognormal => "lognormal",
        }
    }

    /// Whether the regression is fit on the log of the observed times.
    #[inline]
    pub fn is_log_scale(self) -> bool {
        !matches!(self, Self::Gaussian)
    }
}

impl fmt::Display for Distribution {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Distribution {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "gaussian" => Ok(Self::Gaussian),
            "exponential" => Ok(Self::Exponential),
            "lognormal" => Ok(Self::Lognormal),
            other => Err(format!(
                "unknown distribution '{other}' (expected gaussian, exponential or lognormal)"
            )),
        }
    }
}

/// Side of the censor point on which values are censored.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CensorType {
    Left,
    #[default]
    Right,
}

impl fmt::Display for CensorType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Left => f.write_str("left"),
            Self::Right => f.write_str("right"),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CensorDirection {
    Left,
    Right,
    None,
}

/// Censoring predicate fixed for a whole run.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct CensoringRule {
    direction: CensorDirection,
    threshold: f64,
}

impl CensoringRule {
    pub fn new(censor_point: Option<f64>, censor_type: CensorType) -> Self {
        match (censor_point, censor_type) {
            (None, _) => Self::none(),
            (Some(threshold), CensorType::Left) => Self::left(threshold),
            (Some(threshold), CensorType::Right) => Self::right(threshold),
        }
    }

    pub fn none() -> Self {
        Self {
            direction: CensorDirection::None,
            threshold: f64::NAN,
        }
    }

    pub fn left(threshold: f64) -> Self {
        Self {
            direction: CensorDirection::Left,
            threshold,
        }
    }

    pub fn right(threshold: f64) -> Self {
        Self {
            direction: CensorDirection::Right,
            threshold,
        }
    }

    #[inline]
    pub fn direction(&self) -> CensorDirection {
        self.direction
    }

    /// The censor point, or `None` when nothing is ever censored.
    #[inline]
    pub fn threshold(&self) -> Option<f64> {
        match self.direction {
            CensorDirection::None => None,
            CensorDirection::Left | CensorDirection::Right => Some(self.threshold),
        }
    }

    /// How censored observations enter the likelihood. Right when nothing is censored.
    #[inline]
    pub fn censor_type(&self) -> CensorType {
        match self.direction {
            CensorDirection::Left => CensorType::Left,
            CensorDirection::Right | CensorDirection::None => CensorType::Right,
        }
    }

    #[inline]
    pub fn is_censored(&self, value: f64) -> bool {
        match self.direction {
            CensorDirection::Left => value < self.threshold,
            CensorDirection::Right => value > self.threshold,
            CensorDirection::None => false,
        }
    }

    /// Clamps a censored draw to the censor point and tags its event indicator.
    #[inline]
    pub fn apply(&self, value: f64) -> SimulatedObservation {
        if self.is_censored(value) {
            SimulatedObservation::censored(self.threshold)
        } else {
            SimulatedObservation::event(value)
        }
    }
}

/// One synthetic outcome: the recorded value and whether the event was observed.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct SimulatedObservation {
    pub value: f64,
    pub event: bool,
}

impl SimulatedObservation {
    #[inline]
    pub fn event(value: f64) -> Self {
        Self { value, event: true }
    }

    #[inline]
    pub fn censored(value: f64) -> Self {
        Self {
            value,
            event: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn right_rule_clamps_values_above_the_threshold() {
        let rule = CensoringRule::right(5.0);
        assert_eq!(rule.apply(7.5), SimulatedObservation::censored(5.0));
        assert_eq!(rule.apply(2.0), SimulatedObservation::event(2.0));
        assert_eq!(rule.apply(5.0), SimulatedObservation::event(5.0));
    }

    #[test]
    fn left_rule_clamps_values_below_the_threshold() {
        let rule = CensoringRule::left(1.0);
        assert_eq!(rule.apply(0.25), SimulatedObservation::censored(1.0));
        assert_eq!(rule.apply(3.0), SimulatedObservation::event(3.0));
        assert_eq!(rule.censor_type(), CensorType::Left);
    }

    #[test]
    fn missing_censor_point_never_censors() {
        let rule = CensoringRule::new(None, CensorType::Left);
        assert_eq!(rule.direction(), CensorDirection::None);
        assert_eq!(rule.threshold(), None);
        for value in [-1e300, -1.0, 0.0, 1.0, 1e300] {
            assert!(rule.apply(value).event);
        }
    }

    #[test]
    fn distribution_parses_case_insensitively() {
        assert_eq!("LogNormal".parse::<Distribution>(), Ok(Distribution::Lognormal));
        assert!("weibull".parse::<Distribution>().is_err());
        assert!(Distribution::Exponential.is_log_scale());
        assert!(!Distribution::Gaussian.is_log_scale());
    }
}
