//! Hysteresis comparisons.
//!
//! A setpoint with a dead band around it: values inside the band are
//! "close enough" so callers don't toggle equipment on every small
//! fluctuation.

/// Where a value sits relative to `target - low ..= target + high`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
pub enum Hysteresis {
    /// At or below `target - low`.
    Below,
    /// Inside the band, or exactly on target.
    Within,
    /// At or above `target + high`.
    Above,
}

/// Classify `value` against `target` with a band of `low` below and `high`
/// above.
///
/// A value equal to the target is always `Within`, even when the band is
/// empty.
///
/// ```
/// use rulekit::hysteresis::{hysteresis, Hysteresis};
///
/// assert_eq!(hysteresis(70.0, 69.0, 2.0, 3.0), Hysteresis::Within);
/// assert_eq!(hysteresis(70.0, 67.0, 2.0, 3.0), Hysteresis::Below);
/// assert_eq!(hysteresis(70.0, 74.0, 2.0, 3.0), Hysteresis::Above);
/// ```
pub fn hysteresis(target: f64, value: f64, low: f64, high: f64) -> Hysteresis {
    if value == target || (target - low < value && value < target + high) {
        Hysteresis::Within
    } else if value <= target - low {
        Hysteresis::Below
    } else {
        Hysteresis::Above
    }
}

/// Result of [`HysteresisSwitch::update`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SwitchChange {
    TurnedOn,
    TurnedOff,
    Unchanged,
}

/// An on/off output driven through a dead band.
///
/// Turns on once the value reaches `target + high` and off once it drops to
/// `target - low`; in between it holds its previous state.
#[derive(Debug, Clone)]
pub struct HysteresisSwitch {
    target: f64,
    low: f64,
    high: f64,
    on: bool,
}

impl HysteresisSwitch {
    pub fn new(target: f64, low: f64, high: f64) -> Self {
        Self {
            target,
            low,
            high,
            on: false,
        }
    }

    pub fn is_on(&self) -> bool {
        self.on
    }

    /// Move the setpoint. The output is re-evaluated on the next update.
    pub fn set_target(&mut self, target: f64) {
        self.target = target;
    }

    pub fn update(&mut self, value: f64) -> SwitchChange {
        match (hysteresis(self.target, value, self.low, self.high), self.on) {
            (Hysteresis::Above, false) => {
                self.on = true;
                SwitchChange::TurnedOn
            }
            (Hysteresis::Below, true) => {
                self.on = false;
                SwitchChange::TurnedOff
            }
            _ => SwitchChange::Unchanged,
        }
    }
}

#[cfg(test)]
mod tests {
    use test_case::test_case;

    use super::*;

    #[test_case(30.0, 30.0, 1.0, 1.0, Hysteresis::Within; "on target with band")]
    #[test_case(30.0, 29.0, 1.0, 1.0, Hysteresis::Below; "at lower edge")]
    #[test_case(30.0, 31.0, 1.0, 1.0, Hysteresis::Above; "at upper edge")]
    #[test_case(30.0, 30.0, 0.0, 0.0, Hysteresis::Within; "on target without band")]
    #[test_case(30.0, 31.0, 0.0, 0.0, Hysteresis::Above; "above without band")]
    #[test_case(30.0, 29.0, 0.0, 0.0, Hysteresis::Below; "below without band")]
    #[test_case(70.0, 69.0, 2.0, 3.0, Hysteresis::Within; "inside asymmetric band low side")]
    #[test_case(70.0, 71.0, 2.0, 3.0, Hysteresis::Within; "inside asymmetric band high side")]
    #[test_case(70.0, 67.0, 2.0, 3.0, Hysteresis::Below; "below asymmetric band")]
    #[test_case(70.0, 74.0, 2.0, 3.0, Hysteresis::Above; "above asymmetric band")]
    fn classifies(target: f64, value: f64, low: f64, high: f64, expected: Hysteresis) {
        assert_eq!(hysteresis(target, value, low, high), expected);
    }

    #[test]
    fn switch_holds_state_inside_band() {
        let mut fan = HysteresisSwitch::new(25.0, 1.0, 1.0);

        assert_eq!(fan.update(25.5), SwitchChange::Unchanged);
        assert!(!fan.is_on());

        assert_eq!(fan.update(26.0), SwitchChange::TurnedOn);
        assert_eq!(fan.update(27.0), SwitchChange::Unchanged);
        assert_eq!(fan.update(24.5), SwitchChange::Unchanged);
        assert!(fan.is_on());

        assert_eq!(fan.update(24.0), SwitchChange::TurnedOff);
        assert_eq!(fan.update(23.0), SwitchChange::Unchanged);
        assert!(!fan.is_on());
    }

    #[test]
    fn moving_target_applies_on_next_update() {
        let mut fan = HysteresisSwitch::new(25.0, 1.0, 1.0);
        fan.update(26.0);

        fan.set_target(30.0);
        assert!(fan.is_on());
        assert_eq!(fan.update(26.0), SwitchChange::TurnedOff);
    }
}
