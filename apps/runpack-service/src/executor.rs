use runpack_core::Money;
use sha2::{Digest, Sha256};

/// Stub pack executor (spec.md §1, Non-goals: "what a pack actually does").
/// Deterministically "runs" a pack by hashing its spec, standing in for the
/// real sandboxed execution that would sit here in production; only the
/// Finalize Protocol's handling of the result is in scope.
pub struct ExecutionOutcome {
    pub payload: Vec<u8>,
    pub content_hash: String,
    pub actual_cost: Money,
}

/// Cost is derived from the size of the pack spec, capped at
/// `reservation_max_cost` — a stand-in for whatever metering a real
/// executor would perform.
pub fn execute(pack_spec: &serde_json::Value, reservation_max_cost: Money) -> ExecutionOutcome {
    let payload = serde_json::to_vec(pack_spec).unwrap_or_default();
    let content_hash = hex::encode(Sha256::digest(&payload));

    let estimated = Money::from_micros((payload.len() as i64).saturating_mul(10));
    let actual_cost = estimated.min(reservation_max_cost);

    ExecutionOutcome {
        payload,
        content_hash,
        actual_cost,
    }
}
