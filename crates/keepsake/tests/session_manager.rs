//! End-to-end request cycles through `SessionManager` on the files
//! backend, with a hand-driven clock.

use std::net::IpAddr;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::{Duration, SystemTime};

use async_trait::async_trait;
use keepsake::data::Fingerprint;
use keepsake::prelude::*;
use tempfile::TempDir;

// -- Helpers ----------------------------------------------------------------

/// A clock that only moves when told to.
#[derive(Default)]
struct ManualClock(AtomicU64);

impl ManualClock {
    fn at(now: u64) -> Arc<Self> {
        Arc::new(Self(AtomicU64::new(now)))
    }

    fn advance(&self, secs: u64) {
        self.0.fetch_add(secs, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now(&self) -> u64 {
        self.0.load(Ordering::SeqCst)
    }
}

fn builder(dir: &TempDir, clock: &Arc<ManualClock>) -> SessionManagerBuilder {
    SessionManager::builder()
        .driver("files")
        .save_path(dir.path().to_string_lossy())
        .cookie_name("app_session")
        .clock(Arc::clone(clock) as Arc<dyn Clock>)
}

fn manager(dir: &TempDir, clock: &Arc<ManualClock>) -> SessionManager {
    builder(dir, clock).build().unwrap()
}

fn session_files(dir: &Path) -> usize {
    std::fs::read_dir(dir)
        .unwrap()
        .filter_map(Result::ok)
        .filter(|e| e.file_name().to_string_lossy().starts_with("app_session"))
        .count()
}

/// Runs one request that only reads, returning the committed session's data.
async fn peek(manager: &SessionManager, id: &SessionId) -> SessionData {
    let session = manager.start(Some(id.as_str()), None).await.unwrap();
    let data = session.data().clone();
    session.commit().await.unwrap();
    data
}

/// Remembers every cookie it was asked to expire.
#[derive(Default)]
struct RecordingCookies {
    expired: Mutex<Vec<String>>,
}

impl RecordingCookies {
    fn expired(&self) -> Vec<String> {
        self.expired.lock().unwrap().clone()
    }
}

impl CookieManager for RecordingCookies {
    fn attributes(&self) -> CookieAttributes {
        CookieAttributes::default()
    }

    fn expire(&self, name: &str, _attributes: &CookieAttributes) {
        self.expired.lock().unwrap().push(name.to_string());
    }
}

/// Reads always fail with a transient error; writes are counted.
struct FlakyHandler {
    writes: Arc<AtomicUsize>,
    fingerprint: Fingerprint,
}

#[async_trait]
impl SessionHandler for FlakyHandler {
    fn name(&self) -> &'static str {
        "flaky"
    }

    async fn open(&mut self, _save_path: &str, _name: &str) -> Result<(), SessionError> {
        Ok(())
    }

    async fn read(&mut self, _id: &SessionId) -> Result<Vec<u8>, SessionError> {
        Err(SessionError::IoUnavailable("backend down".into()))
    }

    async fn write(&mut self, _id: &SessionId, _payload: &[u8]) -> Result<(), SessionError> {
        self.writes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn close(&mut self) -> Result<(), SessionError> {
        Ok(())
    }

    async fn destroy(&mut self, _id: &SessionId) -> Result<(), SessionError> {
        self.writes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn discard(&mut self, _id: &SessionId) -> Result<(), SessionError> {
        self.writes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn collect(&mut self, _max_lifetime: Duration) -> Result<usize, SessionError> {
        Ok(0)
    }

    fn fingerprint(&self) -> &Fingerprint {
        &self.fingerprint
    }
}

// =========================================================================
// Startup
// =========================================================================

#[tokio::test]
async fn test_start_without_cookie_generates_id() {
    let dir = TempDir::new().unwrap();
    let manager = manager(&dir, &ManualClock::at(1_000));

    let session = manager.start(None, None).await.unwrap();

    assert!(session.id_changed());
    assert_eq!(session.id().as_str().len(), 32);
    assert_eq!(session.handler_name(), "files");
    assert!(!session.is_degraded());
    session.commit().await.unwrap();
}

#[tokio::test]
async fn test_start_with_malformed_cookie_replaces_id() {
    let dir = TempDir::new().unwrap();
    let manager = manager(&dir, &ManualClock::at(1_000));

    let session = manager.start(Some("../../etc/passwd"), None).await.unwrap();

    assert!(session.id_changed());
    assert_ne!(session.id().as_str(), "../../etc/passwd");
    session.commit().await.unwrap();
}

#[tokio::test]
async fn test_data_survives_between_requests() {
    let dir = TempDir::new().unwrap();
    let manager = manager(&dir, &ManualClock::at(1_000));

    let mut first = manager.start(None, None).await.unwrap();
    first.data_mut().set("user_id", 42).unwrap();
    let id = first.id().clone();
    first.commit().await.unwrap();

    let second = manager.start(Some(id.as_str()), None).await.unwrap();
    assert!(!second.id_changed());
    assert_eq!(second.id(), &id);
    assert_eq!(second.data().get::<u64>("user_id"), Some(42));
    second.commit().await.unwrap();
}

#[tokio::test]
async fn test_concurrent_request_waits_for_commit() {
    let dir = TempDir::new().unwrap();
    let manager = manager(&dir, &ManualClock::at(1_000));

    let mut first = manager.start(None, None).await.unwrap();
    first.data_mut().set("step", 1).unwrap();
    let id = first.id().clone();
    first.commit().await.unwrap();

    let mut holder = manager.start(Some(id.as_str()), None).await.unwrap();
    let waiting = manager.clone();
    let waiting_id = id.clone();
    let reader = tokio::spawn(async move {
        let session = waiting.start(Some(waiting_id.as_str()), None).await.unwrap();
        let step = session.data().get::<u64>("step");
        session.commit().await.unwrap();
        step
    });

    tokio::time::sleep(Duration::from_millis(50)).await;
    holder.data_mut().set("step", 2).unwrap();
    holder.commit().await.unwrap();

    assert_eq!(reader.await.unwrap(), Some(2));
}

// =========================================================================
// Flash and temp data
// =========================================================================

#[tokio::test]
async fn test_flash_lives_for_exactly_one_more_request() {
    let dir = TempDir::new().unwrap();
    let manager = manager(&dir, &ManualClock::at(1_000));

    let mut session = manager.start(None, None).await.unwrap();
    session.data_mut().set_flash("notice", "saved").unwrap();
    assert_eq!(
        session.data().get_flash::<String>("notice").as_deref(),
        Some("saved")
    );
    let id = session.id().clone();
    session.commit().await.unwrap();

    let next = peek(&manager, &id).await;
    assert_eq!(next.get_flash::<String>("notice").as_deref(), Some("saved"));

    let after = peek(&manager, &id).await;
    assert!(!after.contains("notice"));
}

#[tokio::test]
async fn test_keep_flash_extends_by_one_request() {
    let dir = TempDir::new().unwrap();
    let manager = manager(&dir, &ManualClock::at(1_000));

    let mut session = manager.start(None, None).await.unwrap();
    session.data_mut().set_flash("notice", "saved").unwrap();
    let id = session.id().clone();
    session.commit().await.unwrap();

    let mut kept = manager.start(Some(id.as_str()), None).await.unwrap();
    assert!(kept.data_mut().keep_flash(&["notice"]));
    kept.commit().await.unwrap();

    assert!(peek(&manager, &id).await.contains("notice"));
    assert!(!peek(&manager, &id).await.contains("notice"));
}

#[tokio::test]
async fn test_temp_expires_by_clock() {
    let dir = TempDir::new().unwrap();
    let clock = ManualClock::at(1_000);
    let manager = manager(&dir, &clock);

    let mut session = manager.start(None, None).await.unwrap();
    let now = session.now();
    session.data_mut().set_temp("otp", "123456", 5, now).unwrap();
    let id = session.id().clone();
    session.commit().await.unwrap();

    clock.advance(4);
    assert_eq!(
        peek(&manager, &id).await.get_temp::<String>("otp").as_deref(),
        Some("123456")
    );

    clock.advance(1);
    assert!(!peek(&manager, &id).await.contains("otp"));
}

// =========================================================================
// Regeneration
// =========================================================================

async fn regenerated_after_idle(destroy: bool) -> (TempDir, SessionId, Session) {
    let dir = TempDir::new().unwrap();
    let clock = ManualClock::at(1_000);
    let manager = builder(&dir, &clock)
        .config(SessionConfig {
            regenerate_destroy: destroy,
            ..Default::default()
        })
        .driver("files")
        .save_path(dir.path().to_string_lossy())
        .cookie_name("app_session")
        .build()
        .unwrap();

    let mut session = manager.start(None, None).await.unwrap();
    session.data_mut().set("cart", vec![1, 2, 3]).unwrap();
    assert_eq!(session.data().last_regenerate(), Some(1_000));
    let old = session.id().clone();
    session.commit().await.unwrap();

    clock.advance(manager.config().time_to_update_secs + 1);
    let session = manager.start(Some(old.as_str()), None).await.unwrap();
    (dir, old, session)
}

#[tokio::test]
async fn test_stale_id_is_regenerated_with_data_kept() {
    let (dir, old, session) = regenerated_after_idle(false).await;

    assert!(session.id_changed());
    assert_ne!(session.id(), &old);
    assert_eq!(session.data().get::<Vec<u32>>("cart"), Some(vec![1, 2, 3]));
    assert_eq!(session.data().last_regenerate(), Some(1_301));
    session.commit().await.unwrap();

    assert_eq!(session_files(dir.path()), 2);
}

#[tokio::test]
async fn test_regeneration_with_destroy_removes_old_payload() {
    let (dir, old, session) = regenerated_after_idle(true).await;

    assert_ne!(session.id(), &old);
    session.commit().await.unwrap();

    assert_eq!(session_files(dir.path()), 1);
}

#[tokio::test]
async fn test_recent_id_is_not_regenerated() {
    let dir = TempDir::new().unwrap();
    let clock = ManualClock::at(1_000);
    let manager = manager(&dir, &clock);

    let session = manager.start(None, None).await.unwrap();
    let id = session.id().clone();
    session.commit().await.unwrap();

    clock.advance(manager.config().time_to_update_secs);
    let session = manager.start(Some(id.as_str()), None).await.unwrap();
    assert!(!session.id_changed());
    session.commit().await.unwrap();
}

#[tokio::test]
async fn test_regeneration_with_destroy_keeps_client_cookie() {
    let dir = TempDir::new().unwrap();
    let cookies = Arc::new(RecordingCookies::default());
    let manager = builder(&dir, &ManualClock::at(1_000))
        .cookies(Arc::clone(&cookies) as Arc<dyn CookieManager>)
        .build()
        .unwrap();

    let mut session = manager.start(None, None).await.unwrap();
    session.data_mut().set("user_id", 5).unwrap();
    let old = session.id().clone();
    session.commit().await.unwrap();

    let mut session = manager.start(Some(old.as_str()), None).await.unwrap();
    session.regenerate(true).await.unwrap();
    let new = session.id().clone();
    session.commit().await.unwrap();

    assert!(cookies.expired().is_empty(), "rotation expired {:?}", cookies.expired());
    assert_eq!(session_files(dir.path()), 1);
    assert_eq!(peek(&manager, &new).await.get::<u64>("user_id"), Some(5));

    let session = manager.start(Some(new.as_str()), None).await.unwrap();
    session.destroy().await.unwrap();
    assert_eq!(cookies.expired(), vec!["app_session".to_string()]);
}

// =========================================================================
// Destroy and collect
// =========================================================================

#[tokio::test]
async fn test_destroy_removes_stored_session() {
    let dir = TempDir::new().unwrap();
    let manager = manager(&dir, &ManualClock::at(1_000));

    let mut session = manager.start(None, None).await.unwrap();
    session.data_mut().set("user_id", 7).unwrap();
    let id = session.id().clone();
    session.commit().await.unwrap();

    let session = manager.start(Some(id.as_str()), None).await.unwrap();
    session.destroy().await.unwrap();
    assert_eq!(session_files(dir.path()), 0);

    assert!(peek(&manager, &id).await.get::<u64>("user_id").is_none());
}

#[tokio::test]
async fn test_collect_removes_only_idle_sessions() {
    let dir = TempDir::new().unwrap();
    let manager = manager(&dir, &ManualClock::at(1_000));

    let stale = manager.start(None, None).await.unwrap();
    let stale_id = stale.id().clone();
    stale.commit().await.unwrap();
    let fresh = manager.start(None, None).await.unwrap();
    fresh.commit().await.unwrap();

    let path = dir.path().join(format!("app_session{stale_id}"));
    let file = std::fs::File::options().write(true).open(&path).unwrap();
    file.set_modified(SystemTime::now() - Duration::from_secs(3_600))
        .unwrap();

    let removed = manager.collect(Duration::from_secs(600)).await.unwrap();

    assert_eq!(removed, 1);
    assert!(!path.exists());
    assert_eq!(session_files(dir.path()), 1);
}

#[tokio::test]
async fn test_collect_with_ip_matching_runs_without_client() {
    let dir = TempDir::new().unwrap();
    let clock = ManualClock::at(1_000);
    let mut config = SessionConfig::default();
    config.handler.match_ip = true;
    let manager = builder(&dir, &clock)
        .config(config)
        .save_path(dir.path().to_string_lossy())
        .cookie_name("app_session")
        .build()
        .unwrap();

    let ip: IpAddr = "203.0.113.9".parse().unwrap();
    let session = manager.start(None, Some(ip)).await.unwrap();
    session.commit().await.unwrap();

    assert_eq!(manager.collect(Duration::from_secs(600)).await.unwrap(), 0);
}

// =========================================================================
// Drivers and failure handling
// =========================================================================

#[test]
fn test_unknown_driver_fails_at_build() {
    let result = SessionManager::builder().driver("mongo").build();

    let err = result.unwrap_err();
    assert!(err.is_fatal(), "expected configuration error, got {err}");
    assert!(err.to_string().contains("mongo"));
}

#[test]
fn test_blank_cookie_name_fails_at_build() {
    let result = SessionManager::builder().cookie_name("...").build();

    assert!(matches!(
        result,
        Err(KeepsakeError::Session(SessionError::Configuration(_)))
    ));
}

#[tokio::test]
async fn test_null_driver_keeps_nothing() {
    let manager = SessionManager::builder().driver("null").build().unwrap();

    let mut session = manager.start(None, None).await.unwrap();
    session.data_mut().set("user_id", 1).unwrap();
    let id = session.id().clone();
    session.commit().await.unwrap();

    let next = manager.start(Some(id.as_str()), None).await.unwrap();
    assert!(next.data().get::<u64>("user_id").is_none());
    next.commit().await.unwrap();
}

#[tokio::test]
async fn test_save_path_that_is_a_file_is_fatal_on_start() {
    let dir = TempDir::new().unwrap();
    let file = dir.path().join("not-a-dir");
    std::fs::write(&file, b"").unwrap();
    let manager = SessionManager::builder()
        .save_path(file.to_string_lossy())
        .build()
        .unwrap();

    let result = manager.start(None, None).await;

    assert!(matches!(
        result,
        Err(KeepsakeError::Session(SessionError::Configuration(_)))
    ));
}

#[tokio::test]
async fn test_unreadable_backend_degrades_and_never_writes() {
    let writes = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&writes);
    let manager = SessionManager::builder()
        .driver("flaky")
        .handler("flaky", move |_| {
            Ok(Box::new(FlakyHandler {
                writes: Arc::clone(&counter),
                fingerprint: Fingerprint::empty(),
            }))
        })
        .build()
        .unwrap();

    let mut session = manager.start(None, None).await.unwrap();
    assert!(session.is_degraded());
    assert!(session.data().is_empty());

    session.data_mut().set("user_id", 3).unwrap();
    session.regenerate(true).await.unwrap();
    session.commit().await.unwrap();

    assert_eq!(writes.load(Ordering::SeqCst), 0);
}
