//! Tests for token selection and ranking.

use tokstream::sampling::{argmax, RandomSource, SamplingError};
use tokstream::{rank, SamplingPolicy, SeededRng, TokenId, Vocabulary};

fn vocab() -> Vocabulary {
    Vocabulary::new(
        ["<pad>", "<s>", "</s>", "a", "b"]
            .iter()
            .map(|s| s.to_string())
            .collect(),
    )
}

#[test]
fn test_default_policy() {
    let policy = SamplingPolicy::default();
    assert_eq!(policy.temperature, 1.0);
    assert_eq!(policy.top_p, 1.0);
    assert!(policy.validate().is_ok());
}

#[test]
fn test_greedy_is_argmax_with_low_id_ties() {
    let mut rng = SeededRng::new(5);
    let policy = SamplingPolicy::greedy();
    assert_eq!(policy.select(&[0.2, 0.3, 0.3, 0.2], &mut rng).unwrap(), 1);
    assert_eq!(argmax(&[0.5, 0.5]), Some(0));
    assert_eq!(argmax(&[]), None);
}

#[test]
fn test_seeded_draws_repeat() {
    let dist = [0.0, 0.1, 0.2, 0.3, 0.4];
    let policy = SamplingPolicy::new(1.0);
    let draw = |seed| {
        let mut rng = SeededRng::new(seed);
        (0..32)
            .map(|_| policy.select(&dist, &mut rng).unwrap())
            .collect::<Vec<TokenId>>()
    };
    assert_eq!(draw(42), draw(42));
    assert!(draw(42).iter().all(|&id| id != 0));
}

#[test]
fn test_draw_frequencies_follow_distribution() {
    let policy = SamplingPolicy::new(1.0);
    let mut rng = SeededRng::new(2024);
    let mut counts = [0usize; 3];
    for _ in 0..6000 {
        counts[policy.select(&[0.1, 0.6, 0.3], &mut rng).unwrap() as usize] += 1;
    }
    assert!(counts[1] > counts[2] && counts[2] > counts[0]);
}

#[test]
fn test_seeded_rng_range() {
    let mut rng = SeededRng::new(0);
    for _ in 0..1000 {
        let v = rng.next_f32();
        assert!((0.0..1.0).contains(&v));
    }
}

#[test]
fn test_invalid_temperature() {
    let mut rng = SeededRng::new(1);
    assert_eq!(
        SamplingPolicy::new(f32::INFINITY).select(&[1.0], &mut rng),
        Err(SamplingError::InvalidTemperature(f32::INFINITY))
    );
}

#[test]
fn test_rank_orders_candidates() {
    let ranked = rank(&[0.3, 0.1, 0.3, 0.3, 0.0], &vocab());
    let ids: Vec<TokenId> = ranked.iter().map(|t| t.id).collect();
    assert_eq!(ids, vec![2, 3, 1, 4]);
    assert_eq!(ranked[1].text, "a");
}

#[test]
fn test_rank_ignores_entries_beyond_vocabulary() {
    let ranked = rank(&[0.0, 0.1, 0.1, 0.1, 0.1, 0.6], &vocab());
    assert_eq!(ranked.len(), 4);
    assert!(ranked.iter().all(|t| t.id < 5));
}
