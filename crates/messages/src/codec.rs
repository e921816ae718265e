//! Framed deterministic serialization for consensus messages.
//!
//! Message bytes produced here are canonical: two nodes encoding the same
//! message must produce identical bytes, because object hashes and signatures
//! are computed over the same structural encoding. bincode with its default
//! fixed-width integer representation satisfies this.
//!
//! # Wire format
//!
//! ```text
//! [4-byte BE payload length][1-byte version][bincode payload]
//! ```

use crate::Message;

/// Hard cap on a single consensus message, enforced before allocation.
pub const MAX_MESSAGE_SIZE: usize = 4 * 1024 * 1024;

/// Codec version carried in every frame.
pub const CODEC_VERSION: u8 = 1;

const LENGTH_PREFIX_SIZE: usize = 4;
const FRAME_HEADER_SIZE: usize = LENGTH_PREFIX_SIZE + 1;

/// Codec errors, classified so callers can react appropriately: drop
/// malformed frames, buffer incomplete ones, treat oversized ones as abuse.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CodecError {
    /// The payload did not decode as a known message.
    #[error("malformed message: {0}")]
    Malformed(String),

    /// The frame carries a version this codec does not speak.
    #[error("unsupported codec version {0}, this codec speaks {CODEC_VERSION}")]
    UnsupportedVersion(u8),

    /// Not enough bytes for the declared frame.
    #[error("incomplete frame: expected {expected} bytes, got {actual}")]
    Incomplete {
        /// Bytes the frame declares.
        expected: usize,
        /// Bytes available.
        actual: usize,
    },

    /// The payload exceeds [`MAX_MESSAGE_SIZE`].
    #[error("oversized message: {0} bytes exceeds the {MAX_MESSAGE_SIZE} byte cap")]
    Oversized(usize),

    /// Serialization of an outbound message failed.
    #[error("serialization failed: {0}")]
    Serialization(String),
}

/// Encode a message into a complete frame.
pub fn encode_framed(message: &Message) -> Result<Vec<u8>, CodecError> {
    let payload =
        bincode::serialize(message).map_err(|e| CodecError::Serialization(e.to_string()))?;
    if payload.len() > MAX_MESSAGE_SIZE {
        return Err(CodecError::Oversized(payload.len()));
    }
    let mut framed = Vec::with_capacity(FRAME_HEADER_SIZE + payload.len());
    framed.extend_from_slice(&(payload.len() as u32).to_be_bytes());
    framed.push(CODEC_VERSION);
    framed.extend_from_slice(&payload);
    Ok(framed)
}

/// Decode a complete frame back into a message.
pub fn decode_framed(framed: &[u8]) -> Result<Message, CodecError> {
    if framed.len() < FRAME_HEADER_SIZE {
        return Err(CodecError::Incomplete {
            expected: FRAME_HEADER_SIZE,
            actual: framed.len(),
        });
    }
    let mut length = [0u8; LENGTH_PREFIX_SIZE];
    length.copy_from_slice(&framed[..LENGTH_PREFIX_SIZE]);
    let declared = u32::from_be_bytes(length) as usize;

    // Reject before trusting the declared length for any allocation.
    if declared > MAX_MESSAGE_SIZE {
        return Err(CodecError::Oversized(declared));
    }

    let version = framed[LENGTH_PREFIX_SIZE];
    if version != CODEC_VERSION {
        return Err(CodecError::UnsupportedVersion(version));
    }

    let payload = &framed[FRAME_HEADER_SIZE..];
    if payload.len() != declared {
        return Err(CodecError::Incomplete {
            expected: FRAME_HEADER_SIZE + declared,
            actual: framed.len(),
        });
    }

    bincode::deserialize(payload).map_err(|e| CodecError::Malformed(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use lockstep_types::{
        Block, BlockHeader, Hash, LockSet, PrecommitLockSet, PrecommitVote, Ready, SecretKey,
        Transaction, Vote,
    };

    fn sample_messages() -> Vec<Message> {
        let key = SecretKey::generate();
        let hash = Hash::keccak(b"block");

        let mut lockset = LockSet::new(4);
        lockset
            .add(Vote::block(1, 0, hash, &key).unwrap(), false)
            .unwrap();
        let mut precommits = PrecommitLockSet::new(4);
        precommits
            .add(PrecommitVote::block(1, 0, hash, &key).unwrap(), false)
            .unwrap();

        let mut signing = PrecommitLockSet::new(0);
        let parent = Hash::keccak(b"parent");
        signing
            .add(PrecommitVote::block(0, 0, parent, &key).unwrap(), false)
            .unwrap();
        let block = Block::new(
            BlockHeader {
                number: 1,
                parent_hash: parent,
                proposer: key.address(),
                timestamp: 42,
                extra: vec![],
            },
            vec![Transaction(vec![1, 2, 3])],
        );
        let proposal =
            lockstep_types::BlockProposal::new(1, 0, block, signing, None, &key).unwrap();

        vec![
            Message::Ready(Ready::new(0, lockset.clone(), &key).unwrap()),
            Message::BlockProposal(proposal),
            Message::Vote(Vote::block(1, 0, hash, &key).unwrap()),
            Message::PrecommitVote(PrecommitVote::nil(1, 0, &key).unwrap()),
            Message::PrecommitLockSets(vec![precommits]),
            Message::GetPrecommitLockSets(vec![1, 2, 3]),
        ]
    }

    #[test]
    fn test_roundtrip_is_identity_and_stable() {
        for message in sample_messages() {
            let framed = encode_framed(&message).unwrap();
            let decoded = decode_framed(&framed).unwrap();
            assert_eq!(decoded, message);
            // Re-encoding the decoded message is byte-identical.
            assert_eq!(encode_framed(&decoded).unwrap(), framed);
        }
    }

    #[test]
    fn test_wire_codes_are_stable() {
        let codes: Vec<u8> = sample_messages().iter().map(Message::code).collect();
        assert_eq!(codes, vec![0, 1, 3, 4, 5, 6]);
    }

    #[test]
    fn test_incomplete_frame() {
        let framed = encode_framed(&Message::GetPrecommitLockSets(vec![5])).unwrap();
        assert!(matches!(
            decode_framed(&framed[..framed.len() - 1]),
            Err(CodecError::Incomplete { .. })
        ));
        assert!(matches!(
            decode_framed(&framed[..3]),
            Err(CodecError::Incomplete { .. })
        ));
    }

    #[test]
    fn test_unknown_version_rejected() {
        let mut framed = encode_framed(&Message::GetPrecommitLockSets(vec![5])).unwrap();
        framed[4] = 9;
        assert_eq!(decode_framed(&framed), Err(CodecError::UnsupportedVersion(9)));
    }

    #[test]
    fn test_oversized_length_rejected_before_allocation() {
        let mut framed = encode_framed(&Message::GetPrecommitLockSets(vec![5])).unwrap();
        framed[..4].copy_from_slice(&(u32::MAX).to_be_bytes());
        assert!(matches!(decode_framed(&framed), Err(CodecError::Oversized(_))));
    }

    #[test]
    fn test_garbage_payload_is_malformed() {
        let mut framed = vec![];
        framed.extend_from_slice(&5u32.to_be_bytes());
        framed.push(CODEC_VERSION);
        framed.extend_from_slice(&[0xff; 5]);
        assert!(matches!(decode_framed(&framed), Err(CodecError::Malformed(_))));
    }
}
