//! Upload state machine, independent of any UI.
//!
//! Mirrors the server-side session lifecycle from the client's point of
//! view. A front end renders [`UploadTracker`]; nothing here renders.

use serde::Serialize;
use std::sync::{Mutex, PoisonError};
use thiserror::Error;
use uuid::Uuid;

use super::{
    error::ClientError,
    workers::{ProgressCallback, UploadProgress},
};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum UploadPhase {
    #[default]
    Idle,
    /// Validating and checksumming; no network activity yet.
    Preparing,
    Uploading,
    Completing,
    Completed,
    Failed,
    Cancelled,
}

impl UploadPhase {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            UploadPhase::Completed | UploadPhase::Failed | UploadPhase::Cancelled
        )
    }

    pub fn can_transition_to(self, next: UploadPhase) -> bool {
        use UploadPhase::*;
        match (self, next) {
            (Idle, Preparing) | (Preparing, Uploading) | (Uploading, Completing) => true,
            (Completing, Completed) => true,
            (Failed | Cancelled, Idle) => true,
            (from, Failed | Cancelled) => !from.is_terminal() && from != Idle,
            _ => false,
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
#[error("cannot move upload from {from:?} to {to:?}")]
pub struct InvalidTransition {
    pub from: UploadPhase,
    pub to: UploadPhase,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadTracker {
    phase: UploadPhase,
    session_id: Option<Uuid>,
    object_key: Option<String>,
    total_parts: u32,
    completed_parts: u32,
    total_bytes: u64,
    uploaded_bytes: u64,
    catalog_entry_id: Option<Uuid>,
    error: Option<String>,
}

impl UploadTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn phase(&self) -> UploadPhase {
        self.phase
    }

    pub fn session_id(&self) -> Option<Uuid> {
        self.session_id
    }

    pub fn object_key(&self) -> Option<&str> {
        self.object_key.as_deref()
    }

    pub fn completed_parts(&self) -> u32 {
        self.completed_parts
    }

    pub fn total_parts(&self) -> u32 {
        self.total_parts
    }

    pub fn catalog_entry_id(&self) -> Option<Uuid> {
        self.catalog_entry_id
    }

    pub fn error(&self) -> Option<&str> {
        self.error.as_deref()
    }

    fn move_to(&mut self, next: UploadPhase) -> Result<(), InvalidTransition> {
        if !self.phase.can_transition_to(next) {
            return Err(InvalidTransition {
                from: self.phase,
                to: next,
            });
        }
        self.phase = next;
        Ok(())
    }

    pub fn begin(&mut self) -> Result<(), InvalidTransition> {
        self.move_to(UploadPhase::Preparing)
    }

    pub fn session_started(
        &mut self,
        session_id: Uuid,
        object_key: impl Into<String>,
        total_parts: u32,
        total_bytes: u64,
    ) -> Result<(), InvalidTransition> {
        self.move_to(UploadPhase::Uploading)?;
        self.session_id = Some(session_id);
        self.object_key = Some(object_key.into());
        self.total_parts = total_parts;
        self.total_bytes = total_bytes;
        Ok(())
    }

    /// Progress never moves backwards, whatever order reports arrive in.
    pub fn record_progress(&mut self, completed_parts: u32, uploaded_bytes: u64) {
        if self.phase != UploadPhase::Uploading {
            return;
        }
        self.completed_parts = self.completed_parts.max(completed_parts.min(self.total_parts));
        self.uploaded_bytes = self.uploaded_bytes.max(uploaded_bytes.min(self.total_bytes));
    }

    pub fn completing(&mut self) -> Result<(), InvalidTransition> {
        self.move_to(UploadPhase::Completing)
    }

    pub fn completed(&mut self, catalog_entry_id: Uuid) -> Result<(), InvalidTransition> {
        self.move_to(UploadPhase::Completed)?;
        self.catalog_entry_id = Some(catalog_entry_id);
        self.completed_parts = self.total_parts;
        self.uploaded_bytes = self.total_bytes;
        Ok(())
    }

    /// Record a terminal failure. Cancellation is tracked as its own phase.
    pub fn failed(&mut self, err: &ClientError) {
        let next = match err {
            ClientError::Cancelled => UploadPhase::Cancelled,
            _ => UploadPhase::Failed,
        };
        if self.move_to(next).is_ok() {
            self.error = Some(err.to_string());
        }
    }

    pub fn progress_percent(&self) -> u8 {
        match self.phase {
            UploadPhase::Completed => 100,
            _ if self.total_bytes == 0 => 0,
            _ => (self.uploaded_bytes.saturating_mul(100) / self.total_bytes).min(100) as u8,
        }
    }

    /// Whether to offer a retry.
    pub fn can_retry(&self) -> bool {
        matches!(self.phase, UploadPhase::Failed | UploadPhase::Cancelled)
    }

    /// Back to `Idle` for a fresh attempt. A retry starts a new session.
    pub fn reset(&mut self) -> Result<(), InvalidTransition> {
        self.move_to(UploadPhase::Idle)?;
        *self = Self::default();
        Ok(())
    }
}

type Listener = Box<dyn Fn(&UploadTracker) + Send + Sync>;

/// An [`UploadTracker`] shared between the uploader and whoever displays it.
/// The optional listener sees every change.
#[derive(Default)]
pub struct SharedTracker {
    inner: Mutex<UploadTracker>,
    listener: Option<Listener>,
}

impl SharedTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_listener(listener: impl Fn(&UploadTracker) + Send + Sync + 'static) -> Self {
        Self {
            inner: Mutex::default(),
            listener: Some(Box::new(listener)),
        }
    }

    pub fn snapshot(&self) -> UploadTracker {
        self.inner
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn update<R>(&self, f: impl FnOnce(&mut UploadTracker) -> R) -> R {
        let mut tracker = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        let result = f(&mut tracker);
        if let Some(listener) = &self.listener {
            listener(&tracker);
        }
        result
    }
}

impl ProgressCallback for SharedTracker {
    fn on_progress(&self, progress: &UploadProgress) -> bool {
        self.update(|t| t.record_progress(progress.completed_parts, progress.uploaded_bytes));
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn uploading(parts: u32, bytes: u64) -> UploadTracker {
        let mut t = UploadTracker::new();
        t.begin().unwrap();
        t.session_started(Uuid::new_v4(), "videos/a/b.webm", parts, bytes).unwrap();
        t
    }

    #[test]
    fn happy_path_reaches_completed() {
        let mut t = uploading(2, 200);
        assert_eq!(t.progress_percent(), 0);
        t.record_progress(1, 100);
        assert_eq!(t.progress_percent(), 50);
        t.completing().unwrap();
        let entry = Uuid::new_v4();
        t.completed(entry).unwrap();
        assert_eq!(t.phase(), UploadPhase::Completed);
        assert_eq!(t.catalog_entry_id(), Some(entry));
        assert_eq!(t.progress_percent(), 100);
        assert!(!t.can_retry());
    }

    #[test]
    fn progress_is_monotonic() {
        let mut t = uploading(4, 400);
        t.record_progress(3, 300);
        t.record_progress(2, 200);
        assert_eq!(t.completed_parts(), 3);
        assert_eq!(t.progress_percent(), 75);
        t.record_progress(9, 9_000);
        assert_eq!(t.completed_parts(), 4);
        assert_eq!(t.progress_percent(), 100);
    }

    #[test]
    fn illegal_transitions_are_refused() {
        let mut t = UploadTracker::new();
        assert_eq!(
            t.completing(),
            Err(InvalidTransition {
                from: UploadPhase::Idle,
                to: UploadPhase::Completing
            })
        );
        assert!(t.reset().is_err());
        t.begin().unwrap();
        assert!(t.completed(Uuid::new_v4()).is_err());
    }

    #[test]
    fn failure_offers_retry_and_reset_starts_over() {
        let mut t = uploading(5, 500);
        t.record_progress(2, 200);
        t.failed(&ClientError::PartUploadFailed {
            part_number: 3,
            cause: Box::new(ClientError::Transport("reset".into())),
        });
        assert_eq!(t.phase(), UploadPhase::Failed);
        assert!(t.error().unwrap().contains("part 3"));
        assert!(t.can_retry());

        // A terminal failure is not overwritten by a later cancel.
        t.failed(&ClientError::Cancelled);
        assert_eq!(t.phase(), UploadPhase::Failed);

        t.reset().unwrap();
        assert_eq!(t, UploadTracker::new());
    }

    #[test]
    fn cancellation_is_its_own_phase() {
        let mut t = uploading(2, 2);
        t.failed(&ClientError::Cancelled);
        assert_eq!(t.phase(), UploadPhase::Cancelled);
        assert!(t.can_retry());
    }

    #[test]
    fn shared_tracker_notifies_listener() {
        use std::sync::{
            Arc,
            atomic::{AtomicUsize, Ordering},
        };
        let calls = Arc::new(AtomicUsize::new(0));
        let seen = calls.clone();
        let shared = SharedTracker::with_listener(move |_| {
            seen.fetch_add(1, Ordering::SeqCst);
        });
        shared.update(|t| t.begin()).unwrap();
        shared
            .update(|t| t.session_started(Uuid::new_v4(), "k", 2, 10))
            .unwrap();
        assert!(shared.on_progress(&UploadProgress {
            completed_parts: 1,
            total_parts: 2,
            uploaded_bytes: 5,
            total_bytes: 10,
        }));
        assert_eq!(shared.snapshot().progress_percent(), 50);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }
}
