//! Chunking: split a payload into fixed-width ordered chunks and build claim sets from them.

use rand::seq::SliceRandom;
use rand::Rng;

use crate::protocol::{Claim, ClaimSet, CHUNK_WIDTH};

/// Split `s` left to right into chunks of `width` characters; the last chunk may be shorter.
/// A zero width falls back to [`CHUNK_WIDTH`].
pub fn split_chunks(s: &str, width: usize) -> Vec<String> {
    let width = if width == 0 { CHUNK_WIDTH } else { width };
    let chars: Vec<char> = s.chars().collect();
    chars.chunks(width).map(|c| c.iter().collect()).collect()
}

/// Error building a claim set.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ClaimSetError {
    #[error("{positions} positions requested but payload has only {chunks} chunks")]
    TooManyPositions { positions: usize, chunks: usize },
}

/// Build a claim set from a locally cached payload.
///
/// Without `positions`, claim `i` pairs chunk `i` with position `i`. With `positions`, claim `i`
/// pairs chunk `i` with `positions[i]`; the list may be shorter than the chunk count but not
/// longer.
pub fn build_claim_set(
    payload_id: &str,
    claimed: &str,
    positions: Option<&[usize]>,
) -> Result<ClaimSet, ClaimSetError> {
    let chunks = split_chunks(claimed, CHUNK_WIDTH);
    let claims = match positions {
        None => chunks
            .into_iter()
            .enumerate()
            .map(|(position, chunk)| Claim::new(chunk, position))
            .collect(),
        Some(positions) => {
            if positions.len() > chunks.len() {
                return Err(ClaimSetError::TooManyPositions {
                    positions: positions.len(),
                    chunks: chunks.len(),
                });
            }
            chunks
                .into_iter()
                .zip(positions.iter().copied())
                .map(|(chunk, position)| Claim::new(chunk, position))
                .collect()
        }
    };
    Ok(ClaimSet {
        payload_id: payload_id.to_string(),
        claims,
    })
}

/// Positions `0..n` with the first `shuffle_prefix` entries shuffled in place.
pub fn permuted_positions<R: Rng + ?Sized>(
    n: usize,
    shuffle_prefix: usize,
    rng: &mut R,
) -> Vec<usize> {
    let mut positions: Vec<usize> = (0..n).collect();
    let k = shuffle_prefix.min(n);
    positions[..k].shuffle(rng);
    positions
}
