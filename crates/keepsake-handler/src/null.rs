use std::time::Duration;

use async_trait::async_trait;
use keepsake_data::{Fingerprint, SessionId};

use crate::{SessionError, SessionHandler};

/// A handler that stores nothing.
///
/// Every operation succeeds, reads are always empty and no lock is taken.
/// Useful for stateless endpoints and for tests of code above the handler.
#[derive(Debug, Default)]
pub struct NullHandler {
    fingerprint: Fingerprint,
}

impl NullHandler {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SessionHandler for NullHandler {
    fn name(&self) -> &'static str {
        "null"
    }

    async fn open(&mut self, _save_path: &str, _name: &str) -> Result<(), SessionError> {
        Ok(())
    }

    async fn read(&mut self, _id: &SessionId) -> Result<Vec<u8>, SessionError> {
        self.fingerprint = Fingerprint::of(b"");
        Ok(Vec::new())
    }

    async fn write(&mut self, _id: &SessionId, payload: &[u8]) -> Result<(), SessionError> {
        self.fingerprint = Fingerprint::of(payload);
        Ok(())
    }

    async fn close(&mut self) -> Result<(), SessionError> {
        Ok(())
    }

    async fn destroy(&mut self, _id: &SessionId) -> Result<(), SessionError> {
        Ok(())
    }

    async fn discard(&mut self, _id: &SessionId) -> Result<(), SessionError> {
        Ok(())
    }

    async fn collect(&mut self, _max_lifetime: Duration) -> Result<usize, SessionError> {
        Ok(0)
    }

    fn fingerprint(&self) -> &Fingerprint {
        &self.fingerprint
    }
}
