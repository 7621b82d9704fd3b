//! Veripeer protocol core.
//! No I/O: framing, claim sets, verification and activity recording; the node crate drives sockets.

pub mod activity;
pub mod chunk;
pub mod identity;
pub mod integrity;
pub mod protocol;
pub mod wire;

pub use activity::{
    ActivityError, ActivityEvent, ActivityRecorder, ActivityStore, Band, MemoryStore, Retention,
    Severity, StreamKey,
};
pub use chunk::{build_claim_set, permuted_positions, split_chunks, ClaimSetError};
pub use identity::{IdentityError, PeerId, PeerIdentity};
pub use integrity::{evaluate, evaluate_claim_set, payload_id, root_hash};
pub use protocol::{Claim, ClaimOutcome, ClaimSet, VerificationVerdict, CHUNK_WIDTH};
pub use wire::{decode_stream, encode_frame, FrameDecoder, FrameError, SENTINEL};
