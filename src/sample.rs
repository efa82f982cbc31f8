//! Next-token selection from word scores.

use crate::ops::{argmax, softmax};
use rand::Rng;

/// Pick a token from `logits` (overwritten in place when sampling).
///
/// - `temperature` of `None` or `<= 0`: greedy (argmax)
/// - otherwise: multinomial sampling from `softmax(logits / temperature)`
pub fn sample<R: Rng + ?Sized>(logits: &mut [f32], temperature: Option<f32>, rng: &mut R) -> u32 {
    let temp = match temperature {
        Some(t) if t > 0.0 => t,
        _ => return argmax(logits) as u32,
    };

    for l in logits.iter_mut() {
        *l /= temp;
    }
    softmax(logits);

    let r: f32 = rng.random();
    let mut cdf = 0.0f32;
    for (i, &p) in logits.iter().enumerate() {
        cdf += p;
        if r < cdf {
            return i as u32;
        }
    }
    // rounding left the cdf short of r; fall back to the last likely token
    logits.iter().rposition(|&p| p > 0.0).unwrap_or(logits.len() - 1) as u32
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;
    use rand::rngs::StdRng;

    #[test]
    fn test_greedy_without_temperature() {
        let mut rng = StdRng::seed_from_u64(0);
        let mut logits = [0.1, 2.0, 2.0, -1.0];
        assert_eq!(sample(&mut logits, None, &mut rng), 1);
        assert_eq!(sample(&mut logits, Some(0.0), &mut rng), 1);
        // greedy leaves the scores untouched
        assert_eq!(logits, [0.1, 2.0, 2.0, -1.0]);
    }

    #[test]
    fn test_sampling_never_picks_masked_tokens() {
        let mut rng = StdRng::seed_from_u64(42);
        for _ in 0..200 {
            let mut logits = [f32::NEG_INFINITY, 0.5, f32::NEG_INFINITY, 0.3];
            let tok = sample(&mut logits, Some(1.0), &mut rng);
            assert!(tok == 1 || tok == 3);
        }
    }

    #[test]
    fn test_low_temperature_concentrates_mass() {
        let mut rng = StdRng::seed_from_u64(7);
        let hits = (0..100)
            .filter(|_| {
                let mut logits = [1.0, 3.0, 2.0];
                sample(&mut logits, Some(0.05), &mut rng) == 1
            })
            .count();
        assert!(hits >= 99);
    }
}
