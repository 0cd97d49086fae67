//! End-of-message detection for write-without-response transfers
//!
//! Peers stream the credential payload as consecutive characteristic writes
//! with no explicit length. The framing strategy decides when the buffered
//! bytes form a complete message and which slice of them is the payload.

/// Completion detector plugged into the reassembly path
pub trait FramingStrategy: Send + Sync {
    /// Whether `buffered` holds one complete message
    fn is_complete(&self, buffered: &[u8]) -> bool;

    /// Payload portion of a complete message
    fn payload<'a>(&self, buffered: &'a [u8]) -> &'a [u8] {
        buffered
    }

    fn name(&self) -> &'static str;
}

/// Treats a trailing `}` as the end of a flat JSON object.
///
/// Wire-compatible with existing provisioning apps. A payload that nests an
/// object as its last value completes early at the inner `}`.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonObjectTerminator;

impl FramingStrategy for JsonObjectTerminator {
    fn is_complete(&self, buffered: &[u8]) -> bool {
        buffered.last() == Some(&b'}')
    }

    fn name(&self) -> &'static str {
        "json-terminator"
    }
}

/// Two-byte big-endian length header followed by the payload
#[derive(Debug, Clone, Copy, Default)]
pub struct LengthPrefixed;

impl LengthPrefixed {
    const HEADER_LEN: usize = 2;

    fn declared_len(buffered: &[u8]) -> Option<usize> {
        let header = buffered.get(..Self::HEADER_LEN)?;
        Some(usize::from(u16::from_be_bytes([header[0], header[1]])))
    }
}

impl FramingStrategy for LengthPrefixed {
    fn is_complete(&self, buffered: &[u8]) -> bool {
        Self::declared_len(buffered)
            .is_some_and(|len| buffered.len() >= Self::HEADER_LEN + len)
    }

    fn payload<'a>(&self, buffered: &'a [u8]) -> &'a [u8] {
        match Self::declared_len(buffered) {
            Some(len) => {
                let end = (Self::HEADER_LEN + len).min(buffered.len());
                &buffered[Self::HEADER_LEN..end]
            }
            None => buffered,
        }
    }

    fn name(&self) -> &'static str {
        "length-prefixed"
    }
}
