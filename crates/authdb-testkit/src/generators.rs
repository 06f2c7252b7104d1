//! Proptest generators for property-based testing.

use proptest::prelude::*;

use authdb_core::{
    Clock, KeyHash, NodeId, Record, RecordState, ReplicationLogEntry, Version, VersionedRecord,
};

/// Generate a valid NodeId: 1 to 32 bytes, no separator.
pub fn node_id() -> impl Strategy<Value = NodeId> {
    prop::collection::vec(any::<u8>().prop_filter("separator", |b| *b != b'/'), 1..=32)
        .prop_map(|bytes| NodeId::new(bytes).expect("generated node id is valid"))
}

/// Generate a NodeId from a small fixed pool, so entries collide on authors.
pub fn pooled_node_id() -> impl Strategy<Value = NodeId> {
    prop_oneof![
        Just("n1"),
        Just("n2"),
        Just("n3"),
        Just("node-a"),
        Just("nodea"),
    ]
    .prop_map(|id| id.parse().expect("pooled node id is valid"))
}

/// Generate any clock value.
pub fn clock() -> impl Strategy<Value = Clock> {
    any::<u64>().prop_map(Clock::new)
}

/// Generate a random KeyHash.
pub fn key_hash() -> impl Strategy<Value = KeyHash> {
    any::<[u8; 32]>().prop_map(KeyHash::from_bytes)
}

/// Generate a KeyHash from a pool of four, so entries collide on keys.
pub fn pooled_key_hash() -> impl Strategy<Value = KeyHash> {
    (0u8..4).prop_map(|n| KeyHash::from_bytes([n; 32]))
}

/// Generate a RecordState.
pub fn record_state() -> impl Strategy<Value = RecordState> {
    prop_oneof![Just(RecordState::Created), Just(RecordState::Invalidated)]
}

/// Generate an arbitrary log entry.
pub fn log_entry() -> impl Strategy<Value = ReplicationLogEntry> {
    (node_id(), clock(), key_hash(), record_state())
        .prop_map(|(node_id, clock, key_hash, state)| {
            ReplicationLogEntry::new(node_id, clock, key_hash, state)
        })
}

/// Generate a log entry drawn from small pools of nodes, clocks and keys.
pub fn pooled_log_entry() -> impl Strategy<Value = ReplicationLogEntry> {
    (pooled_node_id(), 1u64..=16, pooled_key_hash(), record_state()).prop_map(
        |(node_id, clock, key_hash, state)| {
            ReplicationLogEntry::new(node_id, Clock::new(clock), key_hash, state)
        },
    )
}

/// Generate payload bytes of specified max length.
pub fn payload(max_len: usize) -> impl Strategy<Value = Vec<u8>> {
    prop::collection::vec(any::<u8>(), 0..=max_len)
}

/// Parameters for generating a record.
#[derive(Debug, Clone)]
pub struct RecordParams {
    pub key_hash: KeyHash,
    pub created_at: i64,
    pub public: bool,
    pub satellite_address: String,
    pub macaroon_head: Vec<u8>,
    pub encrypted_secret_key: Vec<u8>,
    pub encrypted_access_grant: Vec<u8>,
    pub expires_at: Option<i64>,
}

impl Arbitrary for RecordParams {
    type Parameters = ();
    type Strategy = BoxedStrategy<Self>;

    fn arbitrary_with(_: Self::Parameters) -> Self::Strategy {
        (
            key_hash(),
            0i64..=1_700_000_000i64,
            any::<bool>(),
            "[a-z0-9.-]{0,24}:[0-9]{1,5}",
            payload(32),
            payload(64),
            payload(256),
            proptest::option::of(0i64..=2_000_000_000i64),
        )
            .prop_map(
                |(key_hash, created_at, public, satellite_address, head, secret, grant, expires_at)| {
                    RecordParams {
                        key_hash,
                        created_at,
                        public,
                        satellite_address,
                        macaroon_head: head,
                        encrypted_secret_key: secret,
                        encrypted_access_grant: grant,
                        expires_at,
                    }
                },
            )
            .boxed()
    }
}

/// Build a record in the `Created` state from parameters.
pub fn record_from_params(params: &RecordParams) -> Record {
    let mut record = Record::new(
        params.key_hash,
        params.encrypted_secret_key.clone(),
        params.encrypted_access_grant.clone(),
        params.created_at,
    )
    .with_public(params.public)
    .with_origin(params.satellite_address.clone(), params.macaroon_head.clone());
    if let Some(expires_at) = params.expires_at {
        record = record.with_expiration(expires_at);
    }
    record
}

/// Generate a versioned record authored by `node_id`.
pub fn versioned_record(node_id: NodeId) -> impl Strategy<Value = VersionedRecord> {
    (any::<RecordParams>(), 1u64..=1000).prop_map(move |(params, clock)| {
        VersionedRecord::new(
            record_from_params(&params),
            Version::new(node_id.clone(), Clock::new(clock)),
        )
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use authdb_core::resolve;

    proptest! {
        #[test]
        fn test_generated_entries_decode(entry in log_entry()) {
            let decoded = ReplicationLogEntry::decode(&entry.encode()).unwrap();
            prop_assert_eq!(decoded, entry);
        }

        #[test]
        fn test_record_params_deterministic(params: RecordParams) {
            prop_assert_eq!(record_from_params(&params), record_from_params(&params));
            prop_assert_eq!(record_from_params(&params).state, RecordState::Created);
        }

        #[test]
        fn test_any_invalidation_wins(
            mut entries in prop::collection::vec(pooled_log_entry(), 1..16),
        ) {
            let has_invalidation = entries.iter().any(|e| e.state == RecordState::Invalidated);
            entries.reverse();
            let resolved = resolve(&entries).unwrap();
            prop_assert_eq!(resolved.state == RecordState::Invalidated, has_invalidation);
        }
    }
}
