//! Vector PID controller with decaying integral and self-tuning gains

use crate::core::config::BalancerConfig;

const GAIN_CEILING: f64 = 10.0;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Gains {
    pub kp: f64,
    pub ki: f64,
    pub kd: f64,
}

/// One controller channel per priority group.
#[derive(Debug, Clone)]
pub struct Pid {
    gains: Gains,
    learning_rate: f64,
    decay_rate: f64,
    integral: Vec<f64>,
    prev_error: Vec<f64>,
}

impl Pid {
    pub fn new(channels: usize, config: &BalancerConfig) -> Self {
        Self {
            gains: Gains {
                kp: config.kp,
                ki: config.ki,
                kd: config.kd,
            },
            learning_rate: config.learning_rate,
            decay_rate: config.decay_rate,
            integral: vec![0.0; channels],
            prev_error: vec![0.0; channels],
        }
    }

    pub fn gains(&self) -> Gains {
        self.gains
    }

    /// Feeds one error vector and returns the control output per channel.
    ///
    /// `output = kp*e + ki*I + kd*(e - e_prev)`, with `I` decayed every step.
    /// Each gain then moves by `learning_rate` times the correlation between
    /// the error and its term, clamped to `[0, GAIN_CEILING]`.
    pub fn update(&mut self, errors: &[f64]) -> Vec<f64> {
        debug_assert_eq!(errors.len(), self.integral.len());

        let mut output = Vec::with_capacity(errors.len());
        let (mut e_sq, mut e_int, mut e_der) = (0.0, 0.0, 0.0);

        for (i, &error) in errors.iter().enumerate() {
            self.integral[i] = self.integral[i] * self.decay_rate + error;
            let derivative = error - self.prev_error[i];
            self.prev_error[i] = error;

            output.push(
                self.gains.kp * error
                    + self.gains.ki * self.integral[i]
                    + self.gains.kd * derivative,
            );

            e_sq += error * error;
            e_int += error * self.integral[i];
            e_der += error * derivative;
        }

        let lr = self.learning_rate;
        self.gains.kp = (self.gains.kp + lr * e_sq).clamp(0.0, GAIN_CEILING);
        self.gains.ki = (self.gains.ki + lr * e_int).clamp(0.0, GAIN_CEILING);
        self.gains.kd = (self.gains.kd + lr * e_der).clamp(0.0, GAIN_CEILING);

        output
    }

    pub fn reset(&mut self) {
        self.integral.iter_mut().for_each(|v| *v = 0.0);
        self.prev_error.iter_mut().for_each(|v| *v = 0.0);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fixed_gains() -> BalancerConfig {
        BalancerConfig {
            kp: 1.0,
            ki: 0.5,
            kd: 0.25,
            learning_rate: 0.0,
            decay_rate: 0.5,
            ..BalancerConfig::default()
        }
    }

    #[test]
    fn test_three_term_law() {
        let mut pid = Pid::new(1, &fixed_gains());

        // I = 0.2, d = 0.2
        let out = pid.update(&[0.2]);
        assert!((out[0] - (0.2 + 0.5 * 0.2 + 0.25 * 0.2)).abs() < 1e-12);

        // I = 0.2 * 0.5 + 0.1 = 0.2, d = -0.1
        let out = pid.update(&[0.1]);
        assert!((out[0] - (0.1 + 0.5 * 0.2 - 0.25 * 0.1)).abs() < 1e-12);
    }

    #[test]
    fn test_positive_error_raises_output() {
        let mut pid = Pid::new(2, &BalancerConfig::default());
        let out = pid.update(&[0.3, -0.3]);
        assert!(out[0] > 0.0);
        assert!(out[1] < 0.0);
    }

    #[test]
    fn test_gains_stay_bounded() {
        let mut pid = Pid::new(
            1,
            &BalancerConfig {
                learning_rate: 100.0,
                ..BalancerConfig::default()
            },
        );
        for _ in 0..100 {
            pid.update(&[1.0]);
        }
        let g = pid.gains();
        assert!(g.kp <= GAIN_CEILING && g.ki <= GAIN_CEILING && g.kd <= GAIN_CEILING);
        assert!(g.kp >= 0.0 && g.ki >= 0.0 && g.kd >= 0.0);
    }
}
