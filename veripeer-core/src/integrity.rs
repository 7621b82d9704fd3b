//! Integrity: content hashes for payloads and chunks, and evaluation of claim sets against a
//! local copy.
//!
//! Evaluation is a self-consistency check. It shows that the responder's cached string agrees with
//! the verifier's cached string at the chosen positions; it proves nothing unless both sides took
//! their copy from the same tracker, and a responder could have fetched the chunks on demand.

use std::collections::HashMap;

use sha2::{Digest, Sha256};

use crate::chunk::split_chunks;
use crate::protocol::{ClaimOutcome, ClaimSet, VerificationVerdict, CHUNK_WIDTH};

/// Hex SHA-256 of `bytes`.
pub fn hash_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

/// Content-addressed payload id: same string, same id.
pub fn payload_id(payload: &str) -> String {
    hash_hex(payload.as_bytes())
}

pub fn hash_chunk(chunk: &str) -> String {
    hash_hex(chunk.as_bytes())
}

/// Aggregate hash over the ordered per-chunk digests.
pub fn root_hash<S: AsRef<str>>(chunks: &[S]) -> String {
    let mut hasher = Sha256::new();
    for c in chunks {
        hasher.update(hash_chunk(c.as_ref()).as_bytes());
    }
    hex::encode(hasher.finalize())
}

/// Parse a raw request and evaluate it. Bytes that do not form a claim set (including a missing
/// `payload_id`) produce a corrupted-data verdict instead of an error.
pub fn evaluate_claim_set(raw: &[u8], local: &HashMap<String, String>) -> VerificationVerdict {
    match serde_json::from_slice::<ClaimSet>(raw) {
        Ok(claim_set) => evaluate(&claim_set, local),
        Err(e) => {
            tracing::debug!(error = %e, "claim set did not parse");
            VerificationVerdict::corrupted()
        }
    }
}

/// Evaluate every claim against the local copy of the payload, preserving claim order.
pub fn evaluate(claim_set: &ClaimSet, local: &HashMap<String, String>) -> VerificationVerdict {
    let Some(claimed) = local.get(&claim_set.payload_id) else {
        return VerificationVerdict::unavailable();
    };
    let chunks = split_chunks(claimed, CHUNK_WIDTH);
    let results = claim_set
        .claims
        .iter()
        .map(|claim| match claim.index().and_then(|i| chunks.get(i)) {
            Some(held) => ClaimOutcome::Checked(*held == claim.chunk),
            None => ClaimOutcome::Error {
                error: format!(
                    "position {} out of range ({} chunks)",
                    claim.position,
                    chunks.len()
                ),
            },
        })
        .collect();
    VerificationVerdict::checked(results)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chunk::build_claim_set;

    fn cache_with(s: &str) -> (String, HashMap<String, String>) {
        let id = payload_id(s);
        let mut m = HashMap::new();
        m.insert(id.clone(), s.to_string());
        (id, m)
    }

    #[test]
    fn payload_id_is_deterministic() {
        assert_eq!(payload_id("hello world!"), payload_id("hello world!"));
        assert_ne!(payload_id("hello world!"), payload_id("hello world?"));
        assert_eq!(payload_id("").len(), 64);
    }

    #[test]
    fn root_hash_depends_on_order() {
        let a = root_hash(&["hell", "o wo"]);
        let b = root_hash(&["o wo", "hell"]);
        assert_ne!(a, b);
        assert_eq!(a, root_hash(&vec!["hell".to_string(), "o wo".to_string()]));
    }

    #[test]
    fn identity_claims_all_true() {
        let (id, cache) = cache_with("hello world!");
        let cs = build_claim_set(&id, "hello world!", None).unwrap();
        let v = evaluate(&cs, &cache);
        assert!(v.chunk_available);
        assert_eq!(v.matches(), vec![true, true, true]);
        assert!(v.is_verified());
    }

    #[test]
    fn tampered_chunk_fails_only_there() {
        let (id, cache) = cache_with("hello world!");
        let mut cs = build_claim_set(&id, "hello world!", None).unwrap();
        cs.claims[1].chunk = "xxxx".into();
        let v = evaluate(&cs, &cache);
        assert_eq!(v.matches(), vec![true, false, true]);
    }

    #[test]
    fn single_character_flip() {
        let s = "the quick brown fox jumps";
        let (id, cache) = cache_with(s);
        let mut cs = build_claim_set(&id, s, None).unwrap();
        cs.claims[3].chunk.replace_range(0..1, "#");
        let v = evaluate(&cs, &cache);
        let expected: Vec<bool> = (0..cs.claims.len()).map(|i| i != 3).collect();
        assert_eq!(v.matches(), expected);
    }

    #[test]
    fn permuted_positions_detect_fabrication() {
        let (id, cache) = cache_with("hello world!");
        // Chunk 0 text claimed at position 2 must not match.
        let cs = build_claim_set(&id, "hello world!", Some(&[2, 1])).unwrap();
        let v = evaluate(&cs, &cache);
        assert_eq!(v.results.as_ref().map(Vec::len), Some(2));
        assert_eq!(v.matches(), vec![false, true]);
    }

    #[test]
    fn unknown_payload_is_unavailable() {
        let (_, cache) = cache_with("hello world!");
        let cs = build_claim_set("nope", "hello world!", None).unwrap();
        let v = evaluate(&cs, &cache);
        assert_eq!(v, VerificationVerdict::unavailable());
        assert!(v.results.is_none());
    }

    #[test]
    fn out_of_range_position_reports_error() {
        let (id, cache) = cache_with("hello world!");
        let cs = ClaimSet {
            payload_id: id,
            claims: vec![
                crate::protocol::Claim {
                    chunk: "hell".into(),
                    position: 0,
                },
                crate::protocol::Claim {
                    chunk: "hell".into(),
                    position: 9,
                },
            ],
        };
        let v = evaluate(&cs, &cache);
        let results = v.results.unwrap();
        assert_eq!(results[0], ClaimOutcome::Checked(true));
        assert!(matches!(results[1], ClaimOutcome::Error { .. }));
    }

    #[test]
    fn negative_position_fails_only_that_claim() {
        let (id, cache) = cache_with("hello world!");
        let raw = serde_json::json!({
            "payload_id": id,
            "claims": [
                { "chunk": "hell", "position": 0 },
                { "chunk": "rld!", "position": -1 },
            ],
        });
        let v = evaluate_claim_set(raw.to_string().as_bytes(), &cache);
        assert!(v.chunk_available);
        assert!(!v.is_corrupted());
        let results = v.results.unwrap();
        assert_eq!(results.len(), 2);
        assert_eq!(results[0], ClaimOutcome::Checked(true));
        assert!(matches!(&results[1], ClaimOutcome::Error { error } if error.contains("-1")));
    }

    #[test]
    fn missing_payload_id_is_corrupted() {
        let (_, cache) = cache_with("hello world!");
        let v = evaluate_claim_set(br#"{"claims":[]}"#, &cache);
        assert!(v.is_corrupted());
        assert!(!v.chunk_available);
    }

    #[test]
    fn garbage_is_corrupted() {
        let v = evaluate_claim_set(b"\xff\x00not json", &HashMap::new());
        assert_eq!(v, VerificationVerdict::corrupted());
    }

    #[test]
    fn raw_request_roundtrip() {
        let (id, cache) = cache_with("hello world!");
        let cs = build_claim_set(&id, "hello world!", None).unwrap();
        let raw = serde_json::to_vec(&cs).unwrap();
        assert!(evaluate_claim_set(&raw, &cache).is_verified());
    }
}
