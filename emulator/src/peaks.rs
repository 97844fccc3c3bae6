//! Raw peak search over a buffered window.
//!
//! Follows the usual `find_peaks` pipeline: local maxima (plateaus resolve to
//! their midpoint), then the height floor, then the minimum sample distance
//! (taller peaks win), then the prominence floor.

use physio_sync_core::config::SyncConfig;
use physio_sync_core::detector::Channel;

use crate::stream::Window;

/// Filters applied after the local-maximum search.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct PeakCriteria {
    /// Minimum distance between peaks, in samples (fractional values round up).
    pub distance: f64,
    pub height: Option<f64>,
    pub prominence: Option<f64>,
}

/// Indices of the peaks of `x` satisfying `criteria`, in ascending order.
pub fn find_peaks(x: &[f64], criteria: &PeakCriteria) -> Vec<usize> {
    let mut peaks = local_maxima(x);
    if let Some(height) = criteria.height {
        peaks.retain(|&peak| x[peak] >= height);
    }
    if criteria.distance > 1.0 {
        peaks = select_by_distance(x, &peaks, criteria.distance);
    }
    if let Some(minimum) = criteria.prominence {
        peaks.retain(|&peak| prominence(x, peak) >= minimum);
    }
    peaks
}

#[allow(clippy::float_cmp)]
fn local_maxima(x: &[f64]) -> Vec<usize> {
    let mut peaks = Vec::new();
    if x.len() < 3 {
        return peaks;
    }

    let last = x.len() - 1;
    let mut index = 1;
    while index < last {
        if x[index - 1] < x[index] {
            let mut ahead = index + 1;
            while ahead < last && x[ahead] == x[index] {
                ahead += 1;
            }
            if x[ahead] < x[index] {
                peaks.push((index + ahead - 1) / 2);
                index = ahead;
                continue;
            }
        }
        index += 1;
    }
    peaks
}

#[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
fn select_by_distance(x: &[f64], peaks: &[usize], distance: f64) -> Vec<usize> {
    let distance = distance.ceil() as usize;
    let mut keep = vec![true; peaks.len()];

    let mut priority: Vec<usize> = (0..peaks.len()).collect();
    priority.sort_by(|&a, &b| x[peaks[a]].total_cmp(&x[peaks[b]]));

    for &current in priority.iter().rev() {
        if !keep[current] {
            continue;
        }
        let position = peaks[current];
        for left in (0..current).rev() {
            if position - peaks[left] >= distance {
                break;
            }
            keep[left] = false;
        }
        for right in current + 1..peaks.len() {
            if peaks[right] - position >= distance {
                break;
            }
            keep[right] = false;
        }
    }

    peaks
        .iter()
        .zip(keep)
        .filter_map(|(&peak, kept)| kept.then_some(peak))
        .collect()
}

/// Height of a peak above the higher of its two surrounding minima.
fn prominence(x: &[f64], peak: usize) -> f64 {
    let height = x[peak];

    let mut left_min = height;
    for &value in x[..peak].iter().rev() {
        if value > height {
            break;
        }
        left_min = left_min.min(value);
    }

    let mut right_min = height;
    for &value in &x[peak + 1..] {
        if value > height {
            break;
        }
        right_min = right_min.min(value);
    }

    height - left_min.max(right_min)
}

/// Linearly interpolated percentile, `q` in `0..=100`.
#[allow(
    clippy::cast_possible_truncation,
    clippy::cast_precision_loss,
    clippy::cast_sign_loss
)]
pub fn percentile(x: &[f64], q: f64) -> Option<f64> {
    if x.is_empty() || !(0.0..=100.0).contains(&q) {
        return None;
    }

    let mut sorted = x.to_vec();
    sorted.sort_by(f64::total_cmp);
    let rank = q / 100.0 * (sorted.len() - 1) as f64;
    let lower = rank.floor() as usize;
    let upper = rank.ceil() as usize;
    let fraction = rank - rank.floor();
    Some(sorted[lower] + (sorted[upper] - sorted[lower]) * fraction)
}

/// Criteria for `channel` at sampling rate `sfreq`, given the window contents.
pub fn criteria_for(
    channel: Channel,
    window: &Window,
    config: &SyncConfig,
    sfreq: f64,
) -> PeakCriteria {
    let channel_config = config.channel(channel);
    let distance = channel_config.distance.as_secs_f64() * sfreq;
    match channel {
        Channel::Respiration => PeakCriteria {
            distance,
            height: None,
            prominence: Some(channel_config.threshold),
        },
        Channel::Cardiac => PeakCriteria {
            distance,
            height: percentile(&window.samples, channel_config.threshold * 100.0),
            prominence: None,
        },
    }
}

/// Timestamps of the raw peaks of `channel` inside `window`.
pub fn detect(channel: Channel, window: &Window, config: &SyncConfig, sfreq: f64) -> Vec<f64> {
    let criteria = criteria_for(channel, window, config, sfreq);
    find_peaks(&window.samples, &criteria)
        .into_iter()
        .map(|index| window.timestamps[index])
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stream::{StreamProfile, SyntheticStream};
    use std::time::Duration;

    #[test]
    fn plateaus_resolve_to_their_midpoint() {
        let x = [0.0, 1.0, 3.0, 3.0, 3.0, 1.0, 2.0, 0.0];
        assert_eq!(find_peaks(&x, &PeakCriteria::default()), vec![3, 6]);
        // A rising edge at the border is not a peak.
        assert!(find_peaks(&[0.0, 1.0, 2.0], &PeakCriteria::default()).is_empty());
    }

    #[test]
    fn distance_keeps_the_tallest_peak() {
        let x = [0.0, 2.0, 0.0, 5.0, 0.0, 3.0, 0.0, 0.0, 4.0, 0.0];
        let criteria = PeakCriteria {
            distance: 2.5,
            ..PeakCriteria::default()
        };
        assert_eq!(find_peaks(&x, &criteria), vec![3, 8]);
    }

    #[test]
    fn height_and_prominence_filter_small_bumps() {
        let x = [0.0, 10.0, 9.0, 9.5, 0.0, 4.0, 0.0];
        let tall = PeakCriteria {
            height: Some(5.0),
            ..PeakCriteria::default()
        };
        assert_eq!(find_peaks(&x, &tall), vec![1, 3]);

        let prominent = PeakCriteria {
            prominence: Some(2.0),
            ..PeakCriteria::default()
        };
        assert_eq!(find_peaks(&x, &prominent), vec![1, 5]);
    }

    #[test]
    fn percentile_interpolates() {
        let x = [4.0, 1.0, 3.0, 2.0];
        assert_eq!(percentile(&x, 0.0), Some(1.0));
        assert_eq!(percentile(&x, 50.0), Some(2.5));
        assert_eq!(percentile(&x, 100.0), Some(4.0));
        assert_eq!(percentile(&[], 50.0), None);
    }

    #[test]
    fn synthetic_beats_are_found_once_each() {
        let config = SyncConfig::default();
        let mut stream = SyntheticStream::new(StreamProfile::default(), Duration::from_secs(4), 3);
        let window = stream.window(Channel::Cardiac, 20.0);
        let found = detect(Channel::Cardiac, &window, &config, stream.sfreq());

        let beats = stream.beat_times();
        let near_beat = |peak: f64| beats.iter().any(|beat| (peak - beat).abs() <= 1.0 / 256.0);
        assert!(found.iter().all(|peak| near_beat(*peak)), "found={found:?}");
        for beat in beats.iter().filter(|beat| **beat > 16.05 && **beat < 19.95) {
            assert!(
                found.iter().any(|peak| (peak - beat).abs() <= 1.0 / 256.0),
                "beat {beat} missed"
            );
        }
    }

    #[test]
    fn synthetic_breaths_pass_the_prominence_floor() {
        let config = SyncConfig::default();
        let mut stream = SyntheticStream::new(StreamProfile::default(), Duration::from_secs(4), 5);
        let window = stream.window(Channel::Respiration, 30.0);
        let found = detect(Channel::Respiration, &window, &config, stream.sfreq());

        let breaths = stream.breath_times();
        assert!(!found.is_empty());
        for peak in &found {
            assert!(breaths.iter().any(|breath| (peak - breath).abs() <= 1.0 / 256.0));
        }
        for breath in breaths.iter().filter(|breath| **breath > 26.5 && **breath < 29.5) {
            assert!(found.iter().any(|peak| (peak - breath).abs() <= 1.0 / 256.0));
        }
    }
}
