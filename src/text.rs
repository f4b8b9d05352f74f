//! Long-prompt handling for the CLIP text encoder
//!
//! Prompts longer than the encoder window are split into windows of
//! `CHUNK_LENGTH` tokens, each wrapped with BOS/EOS and padded with EOS.
//! The per-chunk hidden states are laid end to end along the token axis.

use crate::error::{RelightError, Result};
use ndarray::{concatenate, Array3, Axis};

/// Tokens per encoder window, special tokens included
pub const MAX_LENGTH: usize = 77;

/// Prompt tokens per window
pub const CHUNK_LENGTH: usize = MAX_LENGTH - 2;

/// Split token ids into `[BOS] chunk [EOS] pad...` windows of `MAX_LENGTH`
///
/// An empty token list still produces one window.
#[must_use]
pub fn chunk_token_ids(tokens: &[u32], bos: u32, eos: u32) -> Vec<Vec<u32>> {
    let wrap = |chunk: &[u32]| {
        let mut ids = Vec::with_capacity(MAX_LENGTH);
        ids.push(bos);
        ids.extend_from_slice(chunk);
        ids.push(eos);
        ids.resize(MAX_LENGTH, eos);
        ids
    };

    if tokens.is_empty() {
        return vec![wrap(&[])];
    }
    tokens.chunks(CHUNK_LENGTH).map(wrap).collect()
}

/// Repeat `(chunks, tokens, dim)` hidden states cyclically to `count` chunks
fn repeat_chunks(states: &Array3<f32>, count: usize) -> Array3<f32> {
    let chunks = states.len_of(Axis(0));
    let indices: Vec<usize> = (0..count).map(|i| i % chunks).collect();
    states.select(Axis(0), &indices)
}

/// Flatten `(chunks, tokens, dim)` into `(1, chunks * tokens, dim)`
fn flatten_chunks(states: &Array3<f32>) -> Result<Array3<f32>> {
    let views: Vec<_> = states
        .outer_iter()
        .map(|chunk| chunk.insert_axis(Axis(0)))
        .collect();
    Ok(concatenate(Axis(1), &views)?)
}

/// Balance positive/negative chunk counts and flatten both for guidance
///
/// # Errors
/// - Either side has no chunks
/// - Hidden sizes differ between the two sides
pub fn balance_prompt_pair(
    positive: &Array3<f32>,
    negative: &Array3<f32>,
) -> Result<(Array3<f32>, Array3<f32>)> {
    let (positive_chunks, positive_tokens, positive_dim) = positive.dim();
    let (negative_chunks, negative_tokens, negative_dim) = negative.dim();
    if positive_chunks == 0 || negative_chunks == 0 {
        return Err(RelightError::processing("Prompt encoding produced no chunks"));
    }
    if (positive_tokens, positive_dim) != (negative_tokens, negative_dim) {
        return Err(RelightError::processing(format!(
            "Prompt embedding shapes differ: {:?} vs {:?}",
            positive.dim(),
            negative.dim()
        )));
    }

    let count = positive_chunks.max(negative_chunks);
    let positive = flatten_chunks(&repeat_chunks(positive, count))?;
    let negative = flatten_chunks(&repeat_chunks(negative, count))?;
    Ok((positive, negative))
}

#[cfg(test)]
mod tests {
    use super::*;

    const BOS: u32 = 49406;
    const EOS: u32 = 49407;

    #[test]
    fn test_short_prompt_single_window() {
        let chunks = chunk_token_ids(&[1, 2, 3], BOS, EOS);
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].len(), MAX_LENGTH);
        assert_eq!(&chunks[0][..5], &[BOS, 1, 2, 3, EOS]);
        assert!(chunks[0][5..].iter().all(|&t| t == EOS));
    }

    #[test]
    fn test_empty_prompt_window() {
        let chunks = chunk_token_ids(&[], BOS, EOS);
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0][0], BOS);
        assert!(chunks[0][1..].iter().all(|&t| t == EOS));
    }

    #[test]
    fn test_long_prompt_splits_every_75_tokens() {
        let tokens: Vec<u32> = (0..160).collect();
        let chunks = chunk_token_ids(&tokens, BOS, EOS);
        assert_eq!(chunks.len(), 3);
        assert_eq!(chunks[0][1], 0);
        assert_eq!(chunks[0][75], 74);
        assert_eq!(chunks[0][76], EOS);
        assert_eq!(chunks[1][1], 75);
        assert_eq!(chunks[2][1], 150);
        assert_eq!(chunks[2][11], EOS);
        assert!(chunks.iter().all(|c| c.len() == MAX_LENGTH));
    }

    #[test]
    fn test_balance_repeats_shorter_side() {
        let positive = Array3::from_shape_fn((2, 3, 2), |(c, _, _)| c as f32 + 1.0);
        let negative = Array3::from_elem((1, 3, 2), -1.0_f32);
        let (pos, neg) = balance_prompt_pair(&positive, &negative).unwrap();
        assert_eq!(pos.dim(), (1, 6, 2));
        assert_eq!(neg.dim(), (1, 6, 2));
        assert_eq!(pos[[0, 0, 0]], 1.0);
        assert_eq!(pos[[0, 3, 0]], 2.0);
        assert!(neg.iter().all(|&v| v == -1.0));
    }

    #[test]
    fn test_balance_rejects_mismatched_dims() {
        let positive = Array3::<f32>::zeros((1, 3, 2));
        let negative = Array3::<f32>::zeros((1, 3, 4));
        assert!(balance_prompt_pair(&positive, &negative).is_err());
        let empty = Array3::<f32>::zeros((0, 3, 2));
        assert!(balance_prompt_pair(&empty, &positive).is_err());
    }
}
