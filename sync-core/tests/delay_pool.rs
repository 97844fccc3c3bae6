use physio_sync_core::delays::{DelayPool, DelayPoolError, block_duration};
use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};

#[test]
fn outlier_is_trimmed_and_closest_delay_is_consumed() {
    let mut rng = SmallRng::seed_from_u64(1);
    let mut pool = DelayPool::from_intervals(&[0.9, 1.0, 1.1, 5.0], 10.0).unwrap();

    assert_eq!(pool.match_and_pop(Some(0.95), &mut rng), Ok(1.0));
    assert_eq!(pool.as_slice(), &[0.9, 1.1]);
}

#[test]
fn every_delay_is_consumed_once() {
    let mut rng = SmallRng::seed_from_u64(42);
    let peaks: Vec<f64> = (0..60)
        .scan(0.0, |time, _| {
            *time += rng.gen_range(3.0..5.0);
            Some(*time)
        })
        .collect();
    let mut pool = DelayPool::from_peaks(&peaks, 10.0).unwrap();

    let mut expected: Vec<f64> = pool.as_slice().to_vec();
    let mut consumed = Vec::new();
    let mut observed = None;
    while !pool.is_empty() {
        let before = pool.len();
        let delay = pool.match_and_pop(observed, &mut rng).unwrap();
        assert_eq!(pool.len(), before - 1);
        consumed.push(delay);
        observed = Some(rng.gen_range(2.5..5.5));
    }

    assert_eq!(
        pool.match_and_pop(observed, &mut rng),
        Err(DelayPoolError::Exhausted)
    );
    expected.sort_by(f64::total_cmp);
    consumed.sort_by(f64::total_cmp);
    assert_eq!(consumed, expected);
}

#[test]
fn asynchronous_block_length_follows_bootstrapped_delays() {
    let mut rng = SmallRng::seed_from_u64(7);
    let pool = DelayPool::from_peaks(&[0.0, 4.0, 8.0, 12.0, 16.0], 0.0).unwrap();
    let delays = pool.sample(30, &mut rng).unwrap();

    assert!(delays.iter().all(|delay| (*delay - 4.0).abs() < 1e-12));
    let duration = block_duration(
        &delays,
        core::time::Duration::from_millis(200),
        core::time::Duration::from_millis(200),
    );
    assert_eq!(duration.as_millis(), 30 * 4_000 + 30 * 200 + 220);
}
