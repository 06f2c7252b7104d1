//! Golden vectors for the replication log codec.
//!
//! Every node, whatever it is written in, must produce these exact bytes:
//! peers compare and range-scan log keys byte-wise, so any drift in the
//! layout breaks replication.

use serde::Serialize;

use authdb_core::{Clock, KeyHash, NodeId, RecordState, ReplicationLogEntry};

/// A golden codec vector.
#[derive(Debug, Clone, Serialize)]
pub struct GoldenVector {
    /// Human-readable name for the vector.
    pub name: &'static str,
    pub node_id: &'static str,
    pub clock: u64,
    /// The key hash is 32 copies of this byte.
    pub key_hash_fill: u8,
    /// Numeric state as stored in the key.
    pub state: u32,
    /// Expected encoded key (hex).
    pub expected_hex: &'static str,
}

/// Get all golden vectors.
pub fn all_vectors() -> Vec<GoldenVector> {
    vec![
        GoldenVector {
            name: "invalidated entry of node-A at clock 42",
            node_id: "node-A",
            clock: 42,
            key_hash_fill: 0x00,
            state: 1,
            expected_hex: concat!(
                "7265706c69636174696f6e5f6c6f672f", // replication_log/
                "6e6f64652d41",                     // node-A
                "2f",
                "000000000000002a", // clock 42
                "2f",
                "0000000000000000000000000000000000000000000000000000000000000000",
                "2f",
                "00000001", // Invalidated
            ),
        },
        GoldenVector {
            name: "created entry of n1 at clock 1",
            node_id: "n1",
            clock: 1,
            key_hash_fill: 0xab,
            state: 0,
            expected_hex: concat!(
                "7265706c69636174696f6e5f6c6f672f",
                "6e31",
                "2f",
                "0000000000000001",
                "2f",
                "abababababababababababababababababababababababababababababababab",
                "2f",
                "00000000",
            ),
        },
        GoldenVector {
            name: "single-byte node at the last clock",
            node_id: "x",
            clock: u64::MAX,
            key_hash_fill: 0xff,
            state: 1,
            expected_hex: concat!(
                "7265706c69636174696f6e5f6c6f672f",
                "78",
                "2f",
                "ffffffffffffffff",
                "2f",
                "ffffffffffffffffffffffffffffffffffffffffffffffffffffffffffffffff",
                "2f",
                "00000001",
            ),
        },
    ]
}

/// Build the log entry a vector describes.
pub fn entry_from_vector(vector: &GoldenVector) -> ReplicationLogEntry {
    let node_id: NodeId = vector.node_id.parse().expect("vector node id is valid");
    let state = RecordState::from_u32(vector.state).expect("vector state is known");
    ReplicationLogEntry::new(
        node_id,
        Clock::new(vector.clock),
        KeyHash::from_bytes([vector.key_hash_fill; 32]),
        state,
    )
}

/// Encode every vector and compare with the expected bytes.
///
/// Returns `(name, matches, actual_hex)` per vector.
pub fn verify_all_vectors() -> Vec<(String, bool, String)> {
    all_vectors()
        .iter()
        .map(|v| {
            let hex = hex::encode(entry_from_vector(v).encode());
            (v.name.to_string(), hex == v.expected_hex, hex)
        })
        .collect()
}

/// All vectors as pretty JSON, for other implementations to check against.
pub fn vectors_json() -> serde_json::Result<String> {
    serde_json::to_string_pretty(&all_vectors())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_all_vectors_match() {
        for (name, matches, hex) in verify_all_vectors() {
            assert!(matches, "vector '{}' encoded as {}", name, hex);
        }
    }

    #[test]
    fn test_vectors_decode_back() {
        for vector in all_vectors() {
            let bytes = hex::decode(vector.expected_hex).unwrap();
            let decoded = ReplicationLogEntry::decode(&bytes).unwrap();
            assert_eq!(decoded, entry_from_vector(&vector), "vector '{}'", vector.name);
        }
    }

    #[test]
    fn test_vectors_json_lists_every_vector() {
        let json: serde_json::Value = serde_json::from_str(&vectors_json().unwrap()).unwrap();
        let names: Vec<&str> = json
            .as_array()
            .unwrap()
            .iter()
            .map(|v| v["name"].as_str().unwrap())
            .collect();
        assert_eq!(names.len(), all_vectors().len());
        assert_eq!(names[0], "invalidated entry of node-A at clock 42");
    }
}
