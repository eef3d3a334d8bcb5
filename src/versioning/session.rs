//! Per-write state machine

use crate::crypto::Checksum;
use crate::metadata::Fragment;
use crate::storage::{ContentKey, ErasureConfig};
use crate::{Result, ShardVaultError};

/// Where one content write stands
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteState {
    /// Metadata allocated, nothing uploaded yet
    Initial,
    /// Shards are written and recorded; waiting for finalize
    Fragmenting,
    Finalized,
    Aborted,
}

impl WriteState {
    fn can_move_to(self, next: WriteState) -> bool {
        use WriteState::*;
        matches!(
            (self, next),
            (Initial, Fragmenting) | (Initial, Aborted) | (Fragmenting, Finalized) | (Fragmenting, Aborted)
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteKind {
    /// First content of a freshly created file
    Create,
    /// New version on top of `expected_version`
    Update { expected_version: u64 },
}

/// An in-flight content write, from allocation to finalize
#[derive(Debug)]
pub struct WriteSession {
    pub(crate) file_id: String,
    pub(crate) data_id: String,
    pub(crate) version_no: u64,
    pub(crate) layout: ErasureConfig,
    pub(crate) content_key: ContentKey,
    pub(crate) kind: WriteKind,
    pub(crate) state: WriteState,
    pub(crate) fragments: Vec<Fragment>,
    pub(crate) checksum: Option<Checksum>,
    pub(crate) size: u64,
    pub(crate) actual_size: u64,
}

impl WriteSession {
    pub(crate) fn new(
        file_id: String,
        data_id: String,
        version_no: u64,
        layout: ErasureConfig,
        content_key: ContentKey,
        kind: WriteKind,
    ) -> Self {
        Self {
            file_id,
            data_id,
            version_no,
            layout,
            content_key,
            kind,
            state: WriteState::Initial,
            fragments: Vec::new(),
            checksum: None,
            size: 0,
            actual_size: 0,
        }
    }

    pub fn file_id(&self) -> &str {
        &self.file_id
    }

    pub fn data_id(&self) -> &str {
        &self.data_id
    }

    pub fn version_no(&self) -> u64 {
        self.version_no
    }

    pub fn state(&self) -> WriteState {
        self.state
    }

    pub fn kind(&self) -> WriteKind {
        self.kind
    }

    pub fn fragments(&self) -> &[Fragment] {
        &self.fragments
    }

    pub(crate) fn advance(&mut self, next: WriteState) -> Result<()> {
        if !self.state.can_move_to(next) {
            return Err(ShardVaultError::InvalidInput(format!(
                "write of file {} cannot go from {:?} to {:?}",
                self.file_id, self.state, next
            )));
        }
        tracing::debug!("Write {} of {}: {:?} -> {:?}", self.data_id, self.file_id, self.state, next);
        self.state = next;
        Ok(())
    }

    /// Every shard of the layout has a fragment row
    pub(crate) fn is_complete(&self) -> bool {
        self.fragments.len() == self.layout.total_shards()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::{generate_iv, EncryptionKey};

    fn session() -> WriteSession {
        WriteSession::new(
            "f".into(),
            "d".into(),
            1,
            ErasureConfig::default(),
            ContentKey::new(EncryptionKey::generate(), generate_iv()),
            WriteKind::Create,
        )
    }

    #[test]
    fn test_happy_path() {
        let mut s = session();
        s.advance(WriteState::Fragmenting).unwrap();
        s.advance(WriteState::Finalized).unwrap();
        assert!(s.advance(WriteState::Aborted).is_err());
    }

    #[test]
    fn test_cannot_finalize_before_upload() {
        let mut s = session();
        assert!(s.advance(WriteState::Finalized).is_err());
        s.advance(WriteState::Aborted).unwrap();
        assert!(s.advance(WriteState::Fragmenting).is_err());
    }
}
