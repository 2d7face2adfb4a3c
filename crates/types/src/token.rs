//! State tokens: digest-carrying descriptors of durable byte ranges.
//!
//! # Wire Format
//!
//! ```text
//! [kind: u8][seq: u64][offset: u64][length: u32][digest_len: u16][digest]
//! ```
//!
//! Any authentication trailer is added and removed by the transport; the
//! decoder here rejects trailing bytes.

use crate::codec::{CodecError, Reader, Writer};
use crate::{Hash, SeqNo};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::hash::Hasher;

/// Which durable file family a token refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TokenKind {
    /// A byte range of a full application snapshot.
    Snapshot,
    /// A complete execution-log segment.
    LogSegment,
}

impl TokenKind {
    fn to_wire(self) -> u8 {
        match self {
            TokenKind::Snapshot => 0,
            TokenKind::LogSegment => 1,
        }
    }

    fn from_wire(byte: u8) -> Result<Self, CodecError> {
        match byte {
            0 => Ok(TokenKind::Snapshot),
            1 => Ok(TokenKind::LogSegment),
            other => Err(CodecError::UnknownKind(other)),
        }
    }

    /// Returns a string representation for metrics/logging.
    pub fn as_str(&self) -> &'static str {
        match self {
            TokenKind::Snapshot => "snapshot",
            TokenKind::LogSegment => "log",
        }
    }

    /// File name of the durable file holding data for `seq`.
    pub fn file_name(self, seq: SeqNo) -> String {
        format!("{}_{:020}", self.as_str(), seq.0)
    }
}

/// Immutable descriptor of a contiguous byte range of a snapshot or log file.
///
/// Equality and hashing cover kind, sequence number, offset and length. The
/// digest is deliberately excluded: two replicas naming the same range refer
/// to the same fragment, and the digest decides whether a copy is valid.
#[derive(Clone, Serialize, Deserialize)]
pub struct StateToken {
    kind: TokenKind,
    seq: SeqNo,
    offset: u64,
    length: u32,
    digest: Hash,
}

impl StateToken {
    /// Fixed encoded size for a blake3 digest.
    pub const ENCODED_LEN: usize = 1 + 8 + 8 + 4 + 2 + Hash::LEN;

    pub fn new(kind: TokenKind, seq: SeqNo, offset: u64, length: u32, digest: Hash) -> Self {
        Self {
            kind,
            seq,
            offset,
            length,
            digest,
        }
    }

    /// Describe `data`, located at `offset` of the file for (`kind`, `seq`).
    pub fn for_data(kind: TokenKind, seq: SeqNo, offset: u64, data: &[u8]) -> Self {
        Self::new(kind, seq, offset, data.len() as u32, Hash::from_bytes(data))
    }

    pub fn kind(&self) -> TokenKind {
        self.kind
    }

    pub fn seq(&self) -> SeqNo {
        self.seq
    }

    pub fn offset(&self) -> u64 {
        self.offset
    }

    pub fn length(&self) -> u32 {
        self.length
    }

    /// First byte past the described range, `None` if it does not fit in
    /// a u64.
    pub fn end(&self) -> Option<u64> {
        self.offset.checked_add(u64::from(self.length))
    }

    pub fn digest(&self) -> Hash {
        self.digest
    }

    pub fn file_name(&self) -> String {
        self.kind.file_name(self.seq)
    }

    /// Whether `data` is exactly the range this token describes.
    pub fn validate(&self, data: &[u8]) -> bool {
        data.len() == self.length as usize && Hash::from_bytes(data) == self.digest
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut writer = Writer::with_capacity(Self::ENCODED_LEN);
        self.write_to(&mut writer);
        writer.into_bytes()
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, CodecError> {
        let mut reader = Reader::new(bytes);
        let token = Self::read_from(&mut reader)?;
        reader.finish()?;
        Ok(token)
    }

    pub(crate) fn write_to(&self, writer: &mut Writer) {
        writer
            .u8(self.kind.to_wire())
            .u64(self.seq.0)
            .u64(self.offset)
            .u32(self.length)
            .u16(Hash::LEN as u16)
            .bytes(self.digest.as_bytes());
    }

    pub(crate) fn read_from(reader: &mut Reader<'_>) -> Result<Self, CodecError> {
        let kind = TokenKind::from_wire(reader.u8()?)?;
        let seq = SeqNo(reader.u64()?);
        let offset = reader.u64()?;
        let length = reader.u32()?;
        let digest_len = reader.u16()? as usize;
        if digest_len != Hash::LEN {
            return Err(CodecError::DigestLength(digest_len));
        }
        let digest =
            Hash::from_slice(reader.bytes(digest_len)?).map_err(|_| CodecError::DigestLength(digest_len))?;
        let token = Self::new(kind, seq, offset, length, digest);
        if token.end().is_none() {
            return Err(CodecError::RangeOverflow { offset, length });
        }
        Ok(token)
    }
}

impl PartialEq for StateToken {
    fn eq(&self, other: &Self) -> bool {
        self.kind == other.kind
            && self.seq == other.seq
            && self.offset == other.offset
            && self.length == other.length
    }
}

impl Eq for StateToken {}

impl std::hash::Hash for StateToken {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.kind.hash(state);
        self.seq.hash(state);
        self.offset.hash(state);
        self.length.hash(state);
    }
}

impl fmt::Debug for StateToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "StateToken({} seq={} [{}+{}] {:?})",
            self.kind.as_str(),
            self.seq,
            self.offset,
            self.length,
            self.digest
        )
    }
}

impl fmt::Display for StateToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}+{}", self.file_name(), self.offset, self.length)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> (StateToken, Vec<u8>) {
        let data: Vec<u8> = (0..64u8).collect();
        let token = StateToken::for_data(TokenKind::Snapshot, SeqNo(1000), 4096, &data);
        (token, data)
    }

    #[test]
    fn test_validate_accepts_exact_data() {
        let (token, data) = sample();
        assert!(token.validate(&data));
    }

    #[test]
    fn test_validate_rejects_every_single_byte_mutation() {
        let (token, data) = sample();
        for i in 0..data.len() {
            let mut mutated = data.clone();
            mutated[i] ^= 0x01;
            assert!(!token.validate(&mutated), "mutation at byte {} accepted", i);
        }
    }

    #[test]
    fn test_validate_rejects_length_mismatch() {
        let (token, data) = sample();
        assert!(!token.validate(&data[..63]));
        let mut longer = data.clone();
        longer.push(0);
        assert!(!token.validate(&longer));
    }

    #[test]
    fn test_equality_ignores_digest() {
        let a = StateToken::new(TokenKind::LogSegment, SeqNo(7), 0, 10, Hash::from_bytes(b"a"));
        let b = StateToken::new(TokenKind::LogSegment, SeqNo(7), 0, 10, Hash::from_bytes(b"b"));
        let c = StateToken::new(TokenKind::LogSegment, SeqNo(7), 0, 11, Hash::from_bytes(b"a"));
        assert_eq!(a, b);
        assert_ne!(a, c);

        let set: std::collections::HashSet<_> = [a, b].into_iter().collect();
        assert_eq!(set.len(), 1);
    }

    #[test]
    fn test_file_name_is_derived_from_kind_and_seq() {
        let snap = StateToken::new(TokenKind::Snapshot, SeqNo(42), 0, 1, Hash::ZERO);
        let log = StateToken::new(TokenKind::LogSegment, SeqNo(42), 0, 1, Hash::ZERO);
        assert_eq!(snap.file_name(), "snapshot_00000000000000000042");
        assert_eq!(log.file_name(), "log_00000000000000000042");
    }

    #[test]
    fn test_wire_layout() {
        let (token, _) = sample();
        let bytes = token.encode();
        assert_eq!(bytes.len(), StateToken::ENCODED_LEN);
        assert_eq!(bytes[0], 0);
        assert_eq!(&bytes[1..9], &1000u64.to_be_bytes());
        assert_eq!(&bytes[9..17], &4096u64.to_be_bytes());
        assert_eq!(&bytes[17..21], &64u32.to_be_bytes());
        assert_eq!(&bytes[21..23], &32u16.to_be_bytes());

        let decoded = StateToken::decode(&bytes).unwrap();
        assert_eq!(decoded, token);
        assert_eq!(decoded.digest(), token.digest());
    }

    #[test]
    fn test_decode_rejects_malformed_input() {
        let (token, _) = sample();
        let bytes = token.encode();

        assert!(matches!(
            StateToken::decode(&bytes[..20]),
            Err(CodecError::TooShort { .. })
        ));

        let mut bad_kind = bytes.clone();
        bad_kind[0] = 9;
        assert_eq!(StateToken::decode(&bad_kind), Err(CodecError::UnknownKind(9)));

        let mut bad_digest_len = bytes.clone();
        bad_digest_len[21..23].copy_from_slice(&20u16.to_be_bytes());
        assert_eq!(
            StateToken::decode(&bad_digest_len),
            Err(CodecError::DigestLength(20))
        );

        let mut past_end = bytes.clone();
        past_end[9..17].copy_from_slice(&(u64::MAX - 10).to_be_bytes());
        assert_eq!(
            StateToken::decode(&past_end),
            Err(CodecError::RangeOverflow {
                offset: u64::MAX - 10,
                length: 64
            })
        );

        let mut trailing = bytes;
        trailing.extend_from_slice(&[0xAA, 0xBB]);
        assert_eq!(
            StateToken::decode(&trailing),
            Err(CodecError::TrailingBytes(2))
        );
    }
}
