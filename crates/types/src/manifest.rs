//! Checkpoint manifests and the full-versus-incremental diff.
//!
//! A manifest describes the current durable state of a replica: the snapshot
//! taken at `checkpoint_seq`, split into byte-range tokens, followed by the
//! log segments produced since then.
//!
//! # Wire Format
//!
//! ```text
//! [checkpoint_seq: u64][snapshot_count: u32][tokens...][log_count: u32][tokens...]
//! ```

use crate::codec::{CodecError, Reader, Writer};
use crate::{SeqNo, StateToken, TokenKind};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Default bound on log tokens a replica may have queued for replay before
/// an incremental load is abandoned in favour of a full one.
pub const DEFAULT_PENDING_LOG_CEILING: usize = 100;

/// Outcome of comparing a local manifest against an incoming one.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ManifestDiff {
    /// Local history cannot be spliced: fetch the snapshot and every log.
    Full,
    /// Local history is a prefix of the incoming one: fetch only these logs.
    Incremental(Vec<StateToken>),
    /// Nothing differs.
    UpToDate,
    /// The incoming manifest ends with the same log token as the local one.
    Duplicate,
}

impl ManifestDiff {
    pub fn needs_full_load(&self) -> bool {
        matches!(self, ManifestDiff::Full)
    }

    /// Log tokens an incremental load must fetch. Empty for every other
    /// outcome; a full load fetches everything in the incoming manifest.
    pub fn log_tokens_to_fetch(&self) -> &[StateToken] {
        match self {
            ManifestDiff::Incremental(tokens) => tokens,
            _ => &[],
        }
    }

    /// Returns a string representation for metrics/logging.
    pub fn as_str(&self) -> &'static str {
        match self {
            ManifestDiff::Full => "full",
            ManifestDiff::Incremental(_) => "incremental",
            ManifestDiff::UpToDate => "up_to_date",
            ManifestDiff::Duplicate => "duplicate",
        }
    }
}

/// Snapshot tokens plus the log tokens produced after the snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct CheckpointManifest {
    checkpoint_seq: SeqNo,
    snapshot_tokens: Vec<StateToken>,
    log_tokens: Vec<StateToken>,
}

impl CheckpointManifest {
    /// Build a manifest, checking token kinds, token ranges and log ordering.
    pub fn new(
        checkpoint_seq: SeqNo,
        snapshot_tokens: Vec<StateToken>,
        log_tokens: Vec<StateToken>,
    ) -> Result<Self, CodecError> {
        if let Some(index) = snapshot_tokens
            .iter()
            .position(|t| t.kind() != TokenKind::Snapshot)
        {
            return Err(CodecError::InvalidRecord(format!(
                "snapshot token {index} has kind {}",
                snapshot_tokens[index].kind().as_str()
            )));
        }
        if let Some(index) = log_tokens
            .iter()
            .position(|t| t.kind() != TokenKind::LogSegment)
        {
            return Err(CodecError::InvalidRecord(format!(
                "log token {index} has kind {}",
                log_tokens[index].kind().as_str()
            )));
        }
        if let Some(token) = snapshot_tokens
            .iter()
            .chain(&log_tokens)
            .find(|t| t.end().is_none())
        {
            return Err(CodecError::RangeOverflow {
                offset: token.offset(),
                length: token.length(),
            });
        }
        for (index, pair) in log_tokens.windows(2).enumerate() {
            if pair[1].seq() <= pair[0].seq() {
                return Err(CodecError::LogOrder { index: index + 1 });
            }
        }
        Ok(Self {
            checkpoint_seq,
            snapshot_tokens,
            log_tokens,
        })
    }

    /// An empty manifest at `checkpoint_seq` with no tokens.
    pub fn empty(checkpoint_seq: SeqNo) -> Self {
        Self {
            checkpoint_seq,
            snapshot_tokens: Vec::new(),
            log_tokens: Vec::new(),
        }
    }

    pub fn checkpoint_seq(&self) -> SeqNo {
        self.checkpoint_seq
    }

    pub fn snapshot_tokens(&self) -> &[StateToken] {
        &self.snapshot_tokens
    }

    pub fn log_tokens(&self) -> &[StateToken] {
        &self.log_tokens
    }

    pub fn last_log_token(&self) -> Option<&StateToken> {
        self.log_tokens.last()
    }

    /// Sequence number of the newest state this manifest describes.
    pub fn last_seq(&self) -> SeqNo {
        self.log_tokens
            .last()
            .map(|t| t.seq())
            .unwrap_or(self.checkpoint_seq)
    }

    /// Size of the assembled snapshot file.
    pub fn snapshot_file_size(&self) -> u64 {
        self.snapshot_tokens
            .iter()
            .filter_map(|t| t.end())
            .max()
            .unwrap_or(0)
    }

    /// Append a newly durable log segment.
    ///
    /// This is the only in-place growth a manifest permits. The token must
    /// be a log token newer than every token already present.
    pub fn append_log_token(&mut self, token: StateToken) -> Result<(), CodecError> {
        if token.kind() != TokenKind::LogSegment {
            return Err(CodecError::InvalidRecord(format!(
                "cannot append {} token as log",
                token.kind().as_str()
            )));
        }
        if let Some(last) = self.log_tokens.last() {
            if token.seq() <= last.seq() {
                return Err(CodecError::LogOrder {
                    index: self.log_tokens.len(),
                });
            }
        }
        self.log_tokens.push(token);
        Ok(())
    }

    /// Compare against `incoming` with no pending backlog.
    pub fn diff_against(&self, incoming: &CheckpointManifest) -> ManifestDiff {
        self.diff_with_backlog(incoming, &[], DEFAULT_PENDING_LOG_CEILING)
    }

    /// Compare against `incoming`, given the log tokens still queued for
    /// replay by an unfinished recovery.
    ///
    /// A backlog at or above `ceiling` forces a full load. Otherwise the
    /// newest known log token (the backlog's last, else this manifest's
    /// last) is looked up in the incoming log list: a hit splices the
    /// remainder, a miss means the histories diverged.
    pub fn diff_with_backlog(
        &self,
        incoming: &CheckpointManifest,
        backlog: &[StateToken],
        ceiling: usize,
    ) -> ManifestDiff {
        if backlog.len() >= ceiling {
            return ManifestDiff::Full;
        }

        let last_local = backlog.last().or_else(|| self.log_tokens.last());
        match last_local {
            Some(last) => match incoming.log_tokens.iter().position(|t| t == last) {
                Some(i) if i + 1 == incoming.log_tokens.len() => ManifestDiff::Duplicate,
                Some(i) => ManifestDiff::Incremental(incoming.log_tokens[i + 1..].to_vec()),
                None => ManifestDiff::Full,
            },
            None if self.checkpoint_seq != incoming.checkpoint_seq => ManifestDiff::Full,
            None if incoming.log_tokens.is_empty() => ManifestDiff::UpToDate,
            None => ManifestDiff::Incremental(incoming.log_tokens.clone()),
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        let token_count = self.snapshot_tokens.len() + self.log_tokens.len();
        let mut writer = Writer::with_capacity(16 + token_count * StateToken::ENCODED_LEN);
        writer
            .u64(self.checkpoint_seq.0)
            .u32(self.snapshot_tokens.len() as u32);
        for token in &self.snapshot_tokens {
            token.write_to(&mut writer);
        }
        writer.u32(self.log_tokens.len() as u32);
        for token in &self.log_tokens {
            token.write_to(&mut writer);
        }
        writer.into_bytes()
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, CodecError> {
        let mut reader = Reader::new(bytes);
        let checkpoint_seq = SeqNo(reader.u64()?);
        let snapshot_tokens = read_tokens(&mut reader)?;
        let log_tokens = read_tokens(&mut reader)?;
        reader.finish()?;
        Self::new(checkpoint_seq, snapshot_tokens, log_tokens)
    }
}

fn read_tokens(reader: &mut Reader<'_>) -> Result<Vec<StateToken>, CodecError> {
    let count = reader.u32()? as usize;
    // Cap the preallocation by what the input can actually hold.
    let mut tokens = Vec::with_capacity(count.min(reader.remaining() / StateToken::ENCODED_LEN));
    for _ in 0..count {
        tokens.push(StateToken::read_from(reader)?);
    }
    Ok(tokens)
}

impl fmt::Display for CheckpointManifest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Manifest(checkpoint={}, snapshot_tokens={}, log_tokens={}",
            self.checkpoint_seq,
            self.snapshot_tokens.len(),
            self.log_tokens.len()
        )?;
        if let (Some(first), Some(last)) = (self.log_tokens.first(), self.log_tokens.last()) {
            write!(f, ", logs={}..={}", first.seq(), last.seq())?;
        }
        write!(f, ")")
    }
}
