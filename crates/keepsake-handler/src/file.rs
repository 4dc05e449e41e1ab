//! Session files on the local filesystem.
//!
//! Each session lives in `{save_path}/{cookie_name}{ip_hash?}{id}`. The
//! file is opened and locked (`flock`, exclusive) on `read` and stays
//! locked until `close`, so a second request for the same id waits for the
//! first one to finish.

use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use async_trait::async_trait;
use keepsake_data::{Fingerprint, SessionId};
use regex::Regex;

use crate::lock::FileLock;
use crate::{CookieAttributes, HandlerContext, SessionError, SessionHandler};

struct OpenFile {
    lock: FileLock,
    session_id: SessionId,
    /// The file held no data when the lock was taken, or the last write
    /// failed: the next write rewrites it whatever the fingerprint says.
    is_new: bool,
}

/// Stores each session in its own file.
pub struct FileHandler {
    ctx: HandlerContext,
    save_dir: PathBuf,
    cookie_name: String,
    /// Cookie name plus IP hash: everything in a file name before the id.
    file_prefix: String,
    cookie: CookieAttributes,
    open: Option<OpenFile>,
    fingerprint: Fingerprint,
}

impl FileHandler {
    pub fn new(ctx: HandlerContext) -> Self {
        Self {
            ctx,
            save_dir: PathBuf::new(),
            cookie_name: String::new(),
            file_prefix: String::new(),
            cookie: CookieAttributes::default(),
            open: None,
            fingerprint: Fingerprint::empty(),
        }
    }

    /// Path of the file holding session `id`.
    pub fn session_path(&self, id: &SessionId) -> PathBuf {
        self.save_dir.join(format!("{}{id}", self.file_prefix))
    }

    /// Id of the session whose file is currently open and locked.
    pub fn locked_session(&self) -> Option<&SessionId> {
        self.open.as_ref().map(|f| &f.session_id)
    }

    fn gc_pattern(&self) -> Result<Regex, SessionError> {
        let ip = if self.ctx.config.match_ip {
            "([0-9a-f]{32})?"
        } else {
            ""
        };
        let pattern = format!(
            "^{}{ip}{}$",
            regex::escape(&self.cookie_name),
            SessionId::pattern(self.ctx.config.id_length)
        );
        Regex::new(&pattern)
            .map_err(|e| SessionError::Configuration(format!("bad collect pattern: {e}")))
    }

    /// Opens and locks the file for `id`.
    ///
    /// A waiter can be granted the lock on a file that was unlinked while
    /// it waited (by `destroy` or `collect`); it then starts over on the
    /// file now at the path.
    async fn open_locked(&self, id: &SessionId) -> Result<OpenFile, SessionError> {
        let path = self.session_path(id);

        loop {
            let mut options = tokio::fs::OpenOptions::new();
            options.read(true).write(true).create(true);
            #[cfg(unix)]
            options.mode(0o600);

            let file = match options.open(&path).await {
                Ok(file) => file.into_std().await,
                Err(e) => {
                    tracing::error!(path = %path.display(), error = %e, "unable to open session file");
                    return Err(e.into());
                }
            };

            let lock = FileLock::acquire(file, path.clone()).await?;
            let at_path = path.clone();
            let (linked, len) = blocking(lock.file(), move |file| {
                Ok((still_linked(file, &at_path)?, file.metadata()?.len()))
            })
            .await?;

            if !linked {
                tracing::debug!(path = %path.display(), "session file removed while waiting for its lock, reopening");
                lock.release().await?;
                continue;
            }

            return Ok(OpenFile {
                lock,
                session_id: id.clone(),
                is_new: len == 0,
            });
        }
    }
}

/// Whether `file` is still the file found at `path`.
#[cfg(unix)]
fn still_linked(file: &std::fs::File, path: &Path) -> io::Result<bool> {
    use std::os::unix::fs::MetadataExt;

    let held = file.metadata()?;
    match std::fs::metadata(path) {
        Ok(current) => Ok(held.nlink() > 0
            && held.dev() == current.dev()
            && held.ino() == current.ino()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
        Err(e) => Err(e),
    }
}

#[cfg(not(unix))]
fn still_linked(_file: &std::fs::File, _path: &Path) -> io::Result<bool> {
    Ok(true)
}

async fn blocking<T, F>(file: &Arc<std::fs::File>, op: F) -> Result<T, SessionError>
where
    T: Send + 'static,
    F: FnOnce(&std::fs::File) -> io::Result<T> + Send + 'static,
{
    let file = Arc::clone(file);
    tokio::task::spawn_blocking(move || op(&file))
        .await
        .map_err(|e| SessionError::IoUnavailable(format!("file task failed: {e}")))?
        .map_err(SessionError::from)
}

/// Truncates and rewrites the whole file. On failure, reports how many
/// bytes made it to disk.
fn rewrite(mut file: &std::fs::File, payload: &[u8]) -> Result<(), (usize, io::Error)> {
    file.set_len(0).map_err(|e| (0, e))?;
    file.seek(SeekFrom::Start(0)).map_err(|e| (0, e))?;

    let mut written = 0;
    while written < payload.len() {
        match file.write(&payload[written..]) {
            Ok(0) => {
                return Err((written, io::Error::from(io::ErrorKind::WriteZero)));
            }
            Ok(n) => written += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => return Err((written, e)),
        }
    }
    Ok(())
}

#[async_trait]
impl SessionHandler for FileHandler {
    fn name(&self) -> &'static str {
        "files"
    }

    async fn open(&mut self, save_path: &str, name: &str) -> Result<(), SessionError> {
        let save_path = save_path.trim();
        if save_path.is_empty() {
            return Err(SessionError::Configuration("save path is empty".into()));
        }
        let dir = PathBuf::from(save_path);

        match tokio::fs::metadata(&dir).await {
            Ok(meta) if meta.is_dir() => {}
            Ok(_) => {
                return Err(SessionError::Configuration(format!(
                    "save path {} is not a directory",
                    dir.display()
                )));
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                let mut builder = tokio::fs::DirBuilder::new();
                builder.recursive(true);
                #[cfg(unix)]
                builder.mode(0o700);
                builder.create(&dir).await.map_err(|e| {
                    SessionError::Configuration(format!(
                        "save path {} cannot be created: {e}",
                        dir.display()
                    ))
                })?;
                tracing::debug!(path = %dir.display(), "created session directory");
            }
            Err(e) => {
                return Err(SessionError::Configuration(format!(
                    "save path {} is not accessible: {e}",
                    dir.display()
                )));
            }
        }

        let ip_hash = self
            .ctx
            .matched_ip()?
            .map(HandlerContext::ip_hash)
            .unwrap_or_default();

        self.cookie = self.ctx.cookies.attributes();
        self.cookie_name = name.to_string();
        self.file_prefix = format!("{name}{ip_hash}");
        self.save_dir = dir;
        Ok(())
    }

    async fn read(&mut self, id: &SessionId) -> Result<Vec<u8>, SessionError> {
        let reuse = self.locked_session() == Some(id);
        if !reuse {
            self.close().await?;
            self.open = Some(self.open_locked(id).await?);
        }
        let Some(open) = self.open.as_ref() else {
            return Err(SessionError::LockNotHeld);
        };

        if open.is_new {
            self.fingerprint = Fingerprint::of(b"");
            return Ok(Vec::new());
        }

        let payload = blocking(open.lock.file(), |mut file| {
            file.seek(SeekFrom::Start(0))?;
            let mut buf = Vec::new();
            file.read_to_end(&mut buf)?;
            Ok(buf)
        })
        .await
        .inspect_err(|e| {
            tracing::error!(session_id = %id, error = %e, "unable to read session file");
        })?;

        self.fingerprint = Fingerprint::of(&payload);
        Ok(payload)
    }

    async fn write(&mut self, id: &SessionId, payload: &[u8]) -> Result<(), SessionError> {
        if self.locked_session() != Some(id) {
            self.close().await?;
            self.read(id).await?;
        }
        let Some(open) = self.open.as_mut() else {
            return Err(SessionError::LockNotHeld);
        };

        if !open.is_new && self.fingerprint.matches(payload) {
            blocking(open.lock.file(), |file| file.set_modified(SystemTime::now()))
                .await
                .inspect_err(|e| {
                    tracing::warn!(session_id = %id, error = %e, "unable to refresh session file mtime");
                })?;
            return Ok(());
        }

        let bytes = payload.to_vec();
        let expected = bytes.len();
        let file = Arc::clone(open.lock.file());
        let outcome = tokio::task::spawn_blocking(move || rewrite(&file, &bytes))
            .await
            .map_err(|e| SessionError::IoUnavailable(format!("file task failed: {e}")))?;

        match outcome {
            Ok(()) => {
                open.is_new = false;
                self.fingerprint = Fingerprint::of(payload);
                Ok(())
            }
            Err((written, e)) => {
                open.is_new = true;
                self.fingerprint = Fingerprint::of(&payload[..written]);
                tracing::error!(
                    session_id = %id,
                    written,
                    expected,
                    error = %e,
                    "session file was only partially written"
                );
                Err(SessionError::WriteFailed {
                    session_id: id.clone(),
                    written,
                    expected,
                })
            }
        }
    }

    async fn close(&mut self) -> Result<(), SessionError> {
        match self.open.take() {
            Some(open) => open.lock.release().await,
            None => Ok(()),
        }
    }

    async fn discard(&mut self, id: &SessionId) -> Result<(), SessionError> {
        // Unlinked while still locked: a waiter must never get the old contents.
        let path = self.session_path(id);
        let removed: Result<(), SessionError> = match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => {
                tracing::error!(path = %path.display(), error = %e, "unable to delete session file");
                Err(e.into())
            }
        };
        self.fingerprint = Fingerprint::empty();
        let closed = self.close().await;

        removed?;
        closed
    }

    async fn destroy(&mut self, id: &SessionId) -> Result<(), SessionError> {
        self.discard(id).await?;
        self.ctx.cookies.expire(&self.cookie_name, &self.cookie);
        Ok(())
    }

    async fn collect(&mut self, max_lifetime: Duration) -> Result<usize, SessionError> {
        if self.cookie_name.is_empty() {
            return Err(SessionError::Configuration(
                "collect called before open".into(),
            ));
        }
        let pattern = self.gc_pattern()?;
        let cutoff = SystemTime::now()
            .checked_sub(max_lifetime)
            .unwrap_or(SystemTime::UNIX_EPOCH);

        let mut entries = tokio::fs::read_dir(&self.save_dir).await.map_err(|e| {
            tracing::error!(path = %self.save_dir.display(), error = %e, "unable to list session directory");
            SessionError::from(e)
        })?;

        let mut removed = 0;
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            if !pattern.is_match(name) {
                continue;
            }

            let Ok(meta) = entry.metadata().await else {
                continue;
            };
            if !meta.is_file() {
                continue;
            }
            let Ok(modified) = meta.modified() else {
                continue;
            };
            if modified > cutoff {
                continue;
            }

            match tokio::fs::remove_file(entry.path()).await {
                Ok(()) => removed += 1,
                Err(e) => {
                    tracing::warn!(file = name, error = %e, "unable to remove expired session file");
                }
            }
        }

        tracing::info!(removed, path = %self.save_dir.display(), "collected expired session files");
        Ok(removed)
    }

    fn fingerprint(&self) -> &Fingerprint {
        &self.fingerprint
    }
}
