//! Smoothed acceleration from a recorded speed series.

use crate::LabelingConfig;

/// Derives the acceleration (base units / s²) used by the longitudinal
/// detector.
///
/// First difference of the base-unit speed divided by the sample interval,
/// trailing mean over `smoothing_window` samples (any number of present
/// samples counts), then shifted back by `smoothing_shift` samples; the
/// shifted-in tail repeats the last smoothed value. Timesteps whose speed is
/// absent stay absent.
pub fn smoothed_acceleration(speed: &[Option<f64>], cfg: &LabelingConfig) -> Vec<Option<f64>> {
    let n = speed.len();
    if n == 0 {
        return Vec::new();
    }

    let derivative: Vec<Option<f64>> = (0..n)
        .map(|i| {
            if i == 0 {
                return None;
            }
            let (prev, cur) = (speed[i - 1]?, speed[i]?);
            Some((cfg.to_base_speed(cur) - cfg.to_base_speed(prev)) / cfg.sample_interval_s)
        })
        .collect();

    let window = cfg.smoothing_window.max(1);
    let rolled: Vec<Option<f64>> = (0..n)
        .map(|i| {
            let start = (i + 1).saturating_sub(window);
            trailing_mean(&derivative[start..=i])
        })
        .collect();

    let tail = rolled[n - 1];
    (0..n)
        .map(|i| {
            speed[i]?;
            match rolled.get(i + cfg.smoothing_shift) {
                Some(v) => *v,
                None => tail,
            }
        })
        .collect()
}

fn trailing_mean(window: &[Option<f64>]) -> Option<f64> {
    let (sum, count) = window
        .iter()
        .flatten()
        .fold((0.0, 0usize), |(s, c), v| (s + v, c + 1));
    (count > 0).then(|| sum / count as f64)
}
