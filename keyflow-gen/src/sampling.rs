//! Token sampling
//!
//! Turns one step of model output (a logit vector) into a token id.
//!
//! **Pipeline** (each stage optional):
//! 1. Greedy arg-max short circuit
//! 2. Repetition penalty on the raw logits (in place)
//! 3. Softmax
//! 4. Pre-process hook (blank forbidden ranges)
//! 5. Nucleus (top-p) cutoff
//! 6. Temperature
//! 7. Post-process hook
//! 8. Weighted random draw

use crate::types::{TokenId, PAD_ID};
use rand::Rng;
use std::collections::VecDeque;

/// Probability hook applied in place
pub type ProbsHook<'a> = &'a (dyn Fn(&mut [f32]) + Send + Sync);

/// Fixed-length ring of the most recently emitted token ids
///
/// Starts full of pad ids; pushing evicts the oldest entry.
#[derive(Debug, Clone)]
pub struct RepetitionWindow {
    ids: VecDeque<TokenId>,
}

impl RepetitionWindow {
    pub fn new(length: usize) -> Self {
        Self {
            ids: std::iter::repeat(PAD_ID).take(length).collect(),
        }
    }

    /// Append `id` as the newest entry, evicting the oldest
    pub fn push(&mut self, id: TokenId) {
        if self.ids.is_empty() {
            return;
        }
        self.ids.pop_front();
        self.ids.push_back(id);
    }

    /// Seed from a prompt: the last `len - 1` ids are written into the
    /// oldest slots, in order; the newer slots keep their pad ids
    pub fn seed(&mut self, ids: &[TokenId]) {
        let room = self.ids.len().saturating_sub(1);
        let skip = ids.len().saturating_sub(room);
        for (slot, &id) in self.ids.iter_mut().zip(&ids[skip..]) {
            *slot = id;
        }
    }

    /// Ids ordered oldest to newest
    pub fn iter(&self) -> impl Iterator<Item = TokenId> + '_ {
        self.ids.iter().copied()
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }
}

/// Repetition penalty parameters
#[derive(Debug, Clone)]
pub struct RepetitionPenalty {
    /// Base penalty (> 1 discourages repeats)
    pub penalty: f32,

    /// Factors are clamped to `[1/max_penalty, max_penalty]`
    pub max_penalty: f32,

    /// Per-position decay; the newest window entry has weight 1
    pub decay_factor: f32,

    /// Ids never penalized
    pub exclude_ids: Vec<TokenId>,
}

impl RepetitionPenalty {
    /// Per-token mask weights for the current window
    ///
    /// Position `i` (0 = oldest) weighs `decay_factor^(len - 1 - i)`. A later
    /// occurrence of the same id overwrites an earlier one, so an id's weight
    /// reflects its most recent position. Excluded ids are forced to 0.
    pub fn decay_mask(&self, window: &RepetitionWindow, vocab_size: usize) -> Vec<f32> {
        let mut mask = vec![0.0f32; vocab_size];
        let len = window.len();
        for (i, id) in window.iter().enumerate() {
            if let Some(slot) = mask.get_mut(id as usize) {
                *slot = self.decay_factor.powi((len - 1 - i) as i32);
            }
        }
        for &id in &self.exclude_ids {
            if let Some(slot) = mask.get_mut(id as usize) {
                *slot = 0.0;
            }
        }
        mask
    }

    /// Multiply each logit by its penalty factor
    pub fn apply(&self, logits: &mut [f32], window: &RepetitionWindow) {
        let mask = self.decay_mask(window, logits.len());
        for (logit, weight) in logits.iter_mut().zip(mask) {
            *logit *= penalty_factor(*logit, weight, self.penalty, self.max_penalty);
        }
    }
}

/// Multiplicative factor for one logit
///
/// Negative logits are pushed further down (`penalty^weight`), positive
/// logits are shrunk (`(1/penalty)^weight`). Always within
/// `[1/max_penalty, max_penalty]`.
pub fn penalty_factor(logit: f32, weight: f32, penalty: f32, max_penalty: f32) -> f32 {
    let base = if logit < 0.0 { penalty } else { 1.0 / penalty };
    base.powf(weight).clamp(1.0 / max_penalty, max_penalty)
}

/// Sampling options
///
/// Defaults: no greedy, temperature 1.0, top-p disabled, no penalty, no hooks.
#[derive(Clone, Copy)]
pub struct SampleOptions<'a> {
    pub greedy: bool,
    pub temperature: f32,
    /// 0 disables the nucleus cutoff
    pub top_p: f32,
    pub repetition_penalty: Option<(&'a RepetitionPenalty, &'a RepetitionWindow)>,
    pub pre_process: Option<ProbsHook<'a>>,
    pub post_process: Option<ProbsHook<'a>>,
}

impl Default for SampleOptions<'_> {
    fn default() -> Self {
        Self {
            greedy: false,
            temperature: 1.0,
            top_p: 0.0,
            repetition_penalty: None,
            pre_process: None,
            post_process: None,
        }
    }
}

/// Index of the first maximum
pub fn argmax(x: &[f32]) -> usize {
    let mut idx = 0;
    for (i, &v) in x.iter().enumerate().skip(1) {
        if v > x[idx] {
            idx = i;
        }
    }
    idx
}

/// Numerically stable softmax
pub fn softmax(x: &[f32]) -> Vec<f32> {
    let max = x.iter().copied().fold(f32::NEG_INFINITY, f32::max);
    let mut out: Vec<f32> = x.iter().map(|v| (v - max).exp()).collect();
    let sum: f32 = out.iter().sum();
    for p in &mut out {
        *p /= sum;
    }
    out
}

/// Lowest probability value kept by the nucleus cutoff
///
/// Walks values (not indices) from largest down, subtracting from `top_p`;
/// the value that exhausts it is the cutoff. Every token with exactly that
/// probability survives. If `top_p` is never exhausted (probability mass was
/// blanked by a hook) the cutoff is the largest value, so only the top
/// token(s) survive.
pub fn find_cutoff(probs: &[f32], top_p: f32) -> f32 {
    let mut sorted = probs.to_vec();
    sorted.sort_by(|a, b| a.total_cmp(b));

    let mut remaining = top_p;
    for &p in sorted.iter().rev() {
        remaining -= p;
        if remaining <= 0.0 {
            return p;
        }
    }
    sorted.last().copied().unwrap_or(0.0)
}

/// Draw an index with probability proportional to its weight
///
/// Weights need not be normalized. Falls back to the last index when the
/// scan runs off the end (floating-point edge cases, all-zero weights).
pub fn random_choice<R: Rng + ?Sized>(weights: &[f32], rng: &mut R) -> usize {
    let last = weights.len().saturating_sub(1);
    let total: f64 = weights.iter().map(|&w| w as f64).sum();
    if total <= 0.0 || !total.is_finite() {
        return last;
    }

    let r = rng.gen::<f64>() * total;
    let mut running = 0.0f64;
    for (i, &w) in weights.iter().enumerate() {
        running += w as f64;
        if running > r {
            return i;
        }
    }
    last
}

/// Sample one token id from `logits`
///
/// The repetition penalty rewrites `logits` in place, so callers must not
/// reuse the buffer expecting untouched values.
pub fn sample<R: Rng + ?Sized>(
    logits: &mut [f32],
    options: &SampleOptions<'_>,
    rng: &mut R,
) -> TokenId {
    if options.greedy {
        return argmax(logits) as TokenId;
    }

    if let Some((penalty, window)) = options.repetition_penalty {
        penalty.apply(logits, window);
    }

    let mut probs = softmax(logits);

    if let Some(hook) = options.pre_process {
        hook(&mut probs);
    }

    if options.top_p > 0.0 {
        let cutoff = find_cutoff(&probs, options.top_p);
        for p in &mut probs {
            if *p < cutoff {
                *p = 0.0;
            }
        }
    }

    if options.temperature != 1.0 {
        let exponent = 1.0 / options.temperature;
        for p in &mut probs {
            *p = p.powf(exponent);
        }
    }

    if let Some(hook) = options.post_process {
        hook(&mut probs);
    }

    random_choice(&probs, rng) as TokenId
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn rng() -> StdRng {
        StdRng::seed_from_u64(7)
    }

    #[test]
    fn test_argmax() {
        assert_eq!(argmax(&[1.0, 2.0, 3.0, 2.0, 1.0]), 2);
        assert_eq!(argmax(&[5.0, 5.0, 1.0]), 0);
        assert_eq!(argmax(&[]), 0);
    }

    #[test]
    fn test_softmax_known_values() {
        let probs = softmax(&[1.0, 2.0, 3.0, 2.0, 1.0]);
        let expected = [0.067, 0.183, 0.498, 0.183, 0.067];
        for (p, e) in probs.iter().zip(expected) {
            assert!((p - e).abs() < 1e-3, "{} vs {}", p, e);
        }
    }

    #[test]
    fn test_softmax_sums_to_one_and_is_shift_invariant() {
        let inputs: [&[f32]; 4] = [
            &[0.0],
            &[1.0, -1.0, 0.5],
            &[100.0, 101.0, 99.0, 250.0],
            &[-30.0, -31.0, -29.5, -40.0, -30.0],
        ];
        for x in inputs {
            let probs = softmax(x);
            let sum: f32 = probs.iter().sum();
            assert!((sum - 1.0).abs() < 1e-5);

            for shift in [-50.0f32, 3.25, 1000.0] {
                let shifted: Vec<f32> = x.iter().map(|v| v + shift).collect();
                for (a, b) in probs.iter().zip(softmax(&shifted)) {
                    assert!((a - b).abs() < 1e-5);
                }
            }
        }
    }

    #[test]
    fn test_find_cutoff() {
        assert!((find_cutoff(&[0.1, 0.2, 0.3, 0.2, 0.1], 0.5) - 0.2).abs() < 1e-6);
        assert!((find_cutoff(&[0.1, 0.2, 0.3, 0.2, 0.1], 0.25) - 0.3).abs() < 1e-6);
    }

    #[test]
    fn test_find_cutoff_unreachable_keeps_top_only() {
        // Blanked mass leaves 0.6 in total, short of top_p
        let probs = [0.0, 0.3, 0.2, 0.1, 0.0];
        assert!((find_cutoff(&probs, 0.8) - 0.3).abs() < 1e-6);
        assert_eq!(find_cutoff(&[], 0.8), 0.0);
    }

    #[test]
    fn test_blanked_mass_samples_top_token() {
        // Ends blanked after softmax leave 0.6, short of top_p
        let blank_ends = |p: &mut [f32]| {
            p[0] = 0.0;
            p[4] = 0.0;
        };
        let logits: Vec<f32> = [0.2f32, 0.3, 0.2, 0.1, 0.2].iter().map(|p| p.ln()).collect();
        let options = SampleOptions {
            top_p: 0.8,
            pre_process: Some(&blank_ends),
            ..Default::default()
        };
        let mut rng = rng();
        for _ in 0..500 {
            assert_eq!(sample(&mut logits.clone(), &options, &mut rng), 1);
        }
    }

    #[test]
    fn test_top_p_ties_survive_together() {
        // Cutoff lands on 0.2; both 0.2 entries survive, the 0.1 entries do not
        let logits: Vec<f32> = [0.1f32, 0.2, 0.3, 0.2, 0.1].iter().map(|p| p.ln()).collect();
        let options = SampleOptions {
            top_p: 0.5,
            ..Default::default()
        };
        let mut rng = rng();
        for _ in 0..500 {
            let id = sample(&mut logits.clone(), &options, &mut rng);
            assert!(matches!(id, 1..=3), "sampled {}", id);
        }
    }

    #[test]
    fn test_greedy_is_argmax() {
        let mut logits = [1.0, 2.0, 3.0, 2.0, 1.0];
        let options = SampleOptions {
            greedy: true,
            ..Default::default()
        };
        for _ in 0..10 {
            assert_eq!(sample(&mut logits, &options, &mut rng()), 2);
        }
    }

    #[test]
    fn test_sample_in_range() {
        let options = SampleOptions {
            temperature: 2.0,
            ..Default::default()
        };
        let mut rng = rng();
        for _ in 0..100 {
            let id = sample(&mut [1.0, 2.0, 3.0, 2.0, 1.0], &options, &mut rng);
            assert!(id < 5);
        }
    }

    #[test]
    fn test_pre_process_blocks_tokens() {
        let block = |p: &mut [f32]| {
            p[2] = 0.0;
            p[3] = 0.0;
        };
        let options = SampleOptions {
            pre_process: Some(&block),
            ..Default::default()
        };
        let mut rng = rng();
        for _ in 0..300 {
            let id = sample(&mut [0.0, 0.0, 10.0, 10.0], &options, &mut rng);
            assert!(id < 2);
        }
    }

    #[test]
    fn test_post_process_runs_after_temperature() {
        let only_last = |p: &mut [f32]| {
            let n = p.len();
            p[..n - 1].fill(0.0);
        };
        let options = SampleOptions {
            temperature: 0.5,
            post_process: Some(&only_last),
            ..Default::default()
        };
        assert_eq!(sample(&mut [5.0, 1.0, 0.0], &options, &mut rng()), 2);
    }

    #[test]
    fn test_random_choice_skips_zero_weights() {
        let mut rng = rng();
        for _ in 0..200 {
            assert_eq!(random_choice(&[0.0, 0.0, 1.0, 0.0], &mut rng), 2);
        }
        assert_eq!(random_choice(&[0.0, 0.0, 0.0], &mut rng), 2);
    }

    #[test]
    fn test_window_evicts_oldest() {
        let mut window = RepetitionWindow::new(3);
        assert_eq!(window.iter().collect::<Vec<_>>(), vec![0, 0, 0]);
        window.push(5);
        window.push(6);
        window.push(7);
        window.push(8);
        assert_eq!(window.iter().collect::<Vec<_>>(), vec![6, 7, 8]);

    }

    #[test]
    fn test_seed_fills_oldest_slots() {
        let mut window = RepetitionWindow::new(4);
        window.seed(&[5, 6]);
        assert_eq!(window.iter().collect::<Vec<_>>(), vec![5, 6, 0, 0]);

        // At most len - 1 ids, the most recent ones
        let mut window = RepetitionWindow::new(3);
        window.seed(&[1, 2, 3, 4, 9]);
        assert_eq!(window.iter().collect::<Vec<_>>(), vec![4, 9, 0]);

        window.push(7);
        assert_eq!(window.iter().collect::<Vec<_>>(), vec![9, 0, 7]);
    }

    #[test]
    fn test_decay_mask_newest_weighs_one() {
        let penalty = RepetitionPenalty {
            penalty: 1.1,
            max_penalty: 1.5,
            decay_factor: 0.5,
            exclude_ids: vec![4],
        };
        let mut window = RepetitionWindow::new(3);
        window.push(1);
        window.push(4);
        window.push(3);
        let mask = penalty.decay_mask(&window, 6);
        assert_eq!(mask[3], 1.0);
        assert_eq!(mask[4], 0.0);
        assert_eq!(mask[1], 0.25);
        assert_eq!(mask[0], 0.0);
        assert_eq!(mask[5], 0.0);
    }

    #[test]
    fn test_decay_mask_latest_occurrence_wins() {
        let penalty = RepetitionPenalty {
            penalty: 1.1,
            max_penalty: 1.5,
            decay_factor: 0.5,
            exclude_ids: vec![],
        };
        let mut window = RepetitionWindow::new(3);
        window.push(1);
        window.push(2);
        window.push(1);
        let mask = penalty.decay_mask(&window, 3);
        assert_eq!(mask[1], 1.0);
        assert_eq!(mask[2], 0.5);
    }

    #[test]
    fn test_penalty_factor_bounds() {
        for penalty in [0.5f32, 1.1, 2.0, 10.0] {
            for max_penalty in [1.0f32, 1.5, 3.0] {
                for step in 0..=20 {
                    let weight = step as f32 / 20.0;
                    for logit in [-3.0f32, 0.0, 2.5] {
                        let f = penalty_factor(logit, weight, penalty, max_penalty);
                        assert!(f >= 1.0 / max_penalty - 1e-6 && f <= max_penalty + 1e-6);
                    }
                }
            }
        }
    }

    #[test]
    fn test_penalty_applies_in_place() {
        let penalty = RepetitionPenalty {
            penalty: 2.0,
            max_penalty: 1.5,
            decay_factor: 1.0,
            exclude_ids: vec![],
        };
        let mut window = RepetitionWindow::new(2);
        window.push(1);
        window.push(2);
        let mut logits = [4.0, 4.0, -4.0, 4.0];
        penalty.apply(&mut logits, &window);
        assert_eq!(logits[0], 4.0);
        // 1/2 clamped to 1/1.5
        assert!((logits[1] - 4.0 / 1.5).abs() < 1e-6);
        // 2 clamped to 1.5
        assert!((logits[2] + 6.0).abs() < 1e-6);
        assert_eq!(logits[3], 4.0);
    }
}
