use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::{expected_parts, part_range, InitUploadRequest, UploadSessionState};
use crate::error::{EngineError, Result};

/// Upload session lifecycle.
///
/// `initiated -> receiving -> completed`, never backwards; any state may move
/// to `aborted` on explicit deletion.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    Initiated,
    Receiving,
    Completed,
    Aborted,
}

impl SessionStatus {
    fn rank(self) -> u8 {
        match self {
            SessionStatus::Initiated => 0,
            SessionStatus::Receiving => 1,
            SessionStatus::Completed => 2,
            SessionStatus::Aborted => 3,
        }
    }

    /// Whether the session can still take parts.
    pub fn accepts_parts(self) -> bool {
        matches!(self, SessionStatus::Initiated | SessionStatus::Receiving)
    }

    pub fn can_transition_to(self, next: SessionStatus) -> bool {
        match (self, next) {
            (SessionStatus::Aborted, _) => next == SessionStatus::Aborted,
            (_, SessionStatus::Aborted) => true,
            _ => next.rank() >= self.rank(),
        }
    }
}

impl fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SessionStatus::Initiated => "initiated",
            SessionStatus::Receiving => "receiving",
            SessionStatus::Completed => "completed",
            SessionStatus::Aborted => "aborted",
        };
        f.write_str(name)
    }
}

/// Server-side record of one upload. Size and chunk size never change.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UploadSession {
    pub upload_id: String,
    pub original_name: String,
    pub content_type: Option<String>,
    pub size_bytes: u64,
    pub chunk_size_bytes: u64,
    pub expected_parts: u32,
    /// Received part index to its length.
    received: BTreeMap<u32, u64>,
    status: SessionStatus,
    pub stored_file_id: Option<String>,
    pub sha256_hex: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Set while parts are being assembled. Never persisted, so a restart
    /// mid-assembly leaves the session receiving.
    #[serde(skip)]
    completing: bool,
}

impl UploadSession {
    /// Create a session from an init request already validated by the caller.
    pub fn new(upload_id: String, request: &InitUploadRequest) -> Result<Self> {
        let parts = expected_parts(request.size_bytes, request.chunk_size_bytes);
        let expected_parts = u32::try_from(parts).map_err(|_| {
            EngineError::validation(format!(
                "{} bytes in {}-byte chunks needs {parts} parts, more than supported",
                request.size_bytes, request.chunk_size_bytes
            ))
        })?;
        let now = Utc::now();
        Ok(Self {
            upload_id,
            original_name: request.original_name.clone(),
            content_type: request.content_type.clone(),
            size_bytes: request.size_bytes,
            chunk_size_bytes: request.chunk_size_bytes,
            expected_parts,
            received: BTreeMap::new(),
            status: SessionStatus::Initiated,
            stored_file_id: None,
            sha256_hex: None,
            created_at: now,
            updated_at: now,
            completing: false,
        })
    }

    pub fn status(&self) -> SessionStatus {
        self.status
    }

    pub fn transition(&mut self, next: SessionStatus) -> Result<()> {
        if !self.status.can_transition_to(next) {
            return Err(EngineError::validation(format!(
                "upload {} cannot move from {} to {next}",
                self.upload_id, self.status
            )));
        }
        self.status = next;
        self.updated_at = Utc::now();
        Ok(())
    }

    pub fn is_completing(&self) -> bool {
        self.completing
    }

    /// Claim the session for assembly. Parts are refused until
    /// [`finish_completion`](Self::finish_completion).
    pub fn begin_completion(&mut self) -> Result<()> {
        if self.completing {
            return Err(EngineError::storage_busy(format!(
                "upload {} is already being assembled",
                self.upload_id
            )));
        }
        self.completing = true;
        Ok(())
    }

    pub fn finish_completion(&mut self) {
        self.completing = false;
    }

    /// Byte range of `part`, rejecting indices outside `1..=expected_parts`.
    pub fn part_range(&self, part: u32) -> Result<(u64, u64)> {
        if part == 0 || part > self.expected_parts {
            return Err(EngineError::validation(format!(
                "part index {part} is outside 1..={} for upload {}",
                self.expected_parts, self.upload_id
            )));
        }
        Ok(part_range(part, self.chunk_size_bytes, self.size_bytes))
    }

    /// Check that `part` may be stored with `len` bytes.
    pub fn validate_part(&self, part: u32, len: u64) -> Result<()> {
        if !self.status.accepts_parts() {
            return Err(EngineError::validation(format!(
                "upload {} is {} and takes no more parts",
                self.upload_id, self.status
            )));
        }
        if self.completing {
            return Err(EngineError::validation(format!(
                "upload {} is being assembled and takes no more parts",
                self.upload_id
            )));
        }
        let (start, end) = self.part_range(part)?;
        if len != end - start {
            return Err(EngineError::validation(format!(
                "part {part} of upload {} must be {} bytes (range {start}..{end}), got {len}",
                self.upload_id,
                end - start
            )));
        }
        Ok(())
    }

    /// Record a stored part. Re-recording a part is a no-op.
    pub fn record_part(&mut self, part: u32, len: u64) -> Result<()> {
        self.validate_part(part, len)?;
        self.received.insert(part, len);
        if self.status == SessionStatus::Initiated {
            self.transition(SessionStatus::Receiving)?;
        } else {
            self.updated_at = Utc::now();
        }
        Ok(())
    }

    pub fn received_parts(&self) -> Vec<u32> {
        self.received.keys().copied().collect()
    }

    pub fn received_bytes(&self) -> u64 {
        self.received.values().sum()
    }

    pub fn missing_parts(&self) -> Vec<u32> {
        (1..=self.expected_parts)
            .filter(|p| !self.received.contains_key(p))
            .collect()
    }

    pub fn state(&self) -> UploadSessionState {
        UploadSessionState {
            upload_id: self.upload_id.clone(),
            size_bytes: self.size_bytes,
            chunk_size_bytes: self.chunk_size_bytes,
            expected_parts: self.expected_parts,
            received_bytes: self.received_bytes(),
            received_parts: self.received_parts(),
            status: self.status,
            stored_file_id: self.stored_file_id.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn session() -> UploadSession {
        UploadSession::new(
            "u1".into(),
            &InitUploadRequest {
                original_name: "tx.csv".into(),
                content_type: None,
                size_bytes: 25,
                chunk_size_bytes: 10,
            },
        )
        .unwrap()
    }

    #[test]
    fn test_status_is_monotonic() {
        use SessionStatus::*;
        assert!(Initiated.can_transition_to(Receiving));
        assert!(Receiving.can_transition_to(Completed));
        assert!(!Receiving.can_transition_to(Initiated));
        assert!(!Completed.can_transition_to(Receiving));
        assert!(Completed.can_transition_to(Aborted));
        assert!(!Aborted.can_transition_to(Receiving));
    }

    #[test]
    fn test_part_validation() {
        let s = session();
        assert_eq!(s.expected_parts, 3);
        assert!(s.validate_part(1, 10).is_ok());
        assert!(s.validate_part(3, 5).is_ok());
        assert!(s.validate_part(3, 10).is_err());
        assert!(s.validate_part(1, 9).is_err());
        assert!(s.validate_part(0, 10).is_err());
        assert!(s.validate_part(4, 10).is_err());
    }

    #[test]
    fn test_record_part_tracks_progress() {
        let mut s = session();
        s.record_part(2, 10).unwrap();
        assert_eq!(s.status(), SessionStatus::Receiving);
        s.record_part(2, 10).unwrap();
        s.record_part(3, 5).unwrap();
        assert_eq!(s.received_parts(), vec![2, 3]);
        assert_eq!(s.received_bytes(), 15);
        assert_eq!(s.missing_parts(), vec![1]);
    }

    #[test]
    fn test_aborted_session_rejects_parts() {
        let mut s = session();
        s.transition(SessionStatus::Aborted).unwrap();
        assert!(s.record_part(1, 10).is_err());
    }

    #[test]
    fn test_completion_claim_blocks_parts() {
        let mut s = session();
        s.record_part(1, 10).unwrap();
        s.begin_completion().unwrap();
        assert!(s.is_completing());
        assert!(s.validate_part(2, 10).is_err());
        assert!(matches!(
            s.begin_completion(),
            Err(EngineError::StorageBusy { .. })
        ));

        let json = serde_json::to_string(&s).unwrap();
        let reloaded: UploadSession = serde_json::from_str(&json).unwrap();
        assert!(!reloaded.is_completing());

        s.finish_completion();
        s.record_part(2, 10).unwrap();
    }
}
