//! Session Registry: tracks live transcode sessions, schedules idle-timeout eviction, and
//! tears down the encoder process + scratch directory on close.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use regex::Regex;
use std::sync::OnceLock;
use tokio::process::Child;
use tokio::sync::{Mutex as AsyncMutex, Notify};

use crate::error::{PlayError, Result};
use crate::hls_planner::SegmentPlan;

fn segment_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(\d+)\.m4s").unwrap())
}

fn now_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// State for one live encoder session.
pub struct SessionHandle {
    pub id: String,
    pub scratch_dir: PathBuf,
    pub plan: SegmentPlan,
    pub start_segment: u32,
    pub segment_time: f64,
    child: AsyncMutex<Option<Child>>,
    last_access_ms: AtomicU64,
    closing: AtomicBool,
    notify: Notify,
}

impl SessionHandle {
    fn new(id: String, scratch_dir: PathBuf, plan: SegmentPlan, start_segment: u32, segment_time: f64, child: Child) -> Arc<Self> {
        Arc::new(Self {
            id,
            scratch_dir,
            plan,
            start_segment,
            segment_time,
            child: AsyncMutex::new(Some(child)),
            last_access_ms: AtomicU64::new(now_ms()),
            closing: AtomicBool::new(false),
            notify: Notify::new(),
        })
    }

    fn touch(&self) {
        self.last_access_ms.store(now_ms(), Ordering::SeqCst);
        self.notify.notify_one();
    }

    fn mark_closing(&self) {
        self.closing.store(true, Ordering::SeqCst);
        self.notify.notify_one();
    }

    /// Media playlist path, ground truth for segment readiness.
    pub fn media_playlist_path(&self) -> PathBuf {
        self.scratch_dir.join("media.m3u8")
    }

    /// Parse the live `media.m3u8` for `(\d+)\.m4s` references, returning `(first, last)`
    /// produced segment numbers. Tolerates partial tail lines (the encoder appends to this
    /// file as it produces segments).
    pub async fn first_last_transcoded_segment(&self) -> Option<(u32, u32)> {
        let content = tokio::fs::read_to_string(self.media_playlist_path()).await.ok()?;
        let mut first = None;
        let mut last = None;
        for line in content.lines() {
            if line.starts_with('#') {
                continue;
            }
            if let Some(caps) = segment_re().captures(line) {
                if let Ok(n) = caps[1].parse::<u32>() {
                    first = Some(first.map_or(n, |f: u32| f.min(n)));
                    last = Some(last.map_or(n, |l: u32| l.max(n)));
                }
            }
        }
        match (first, last) {
            (Some(f), Some(l)) => Some((f, l)),
            _ => None,
        }
    }

    /// Segment `{scratch}/media{N}.m4s` path.
    pub fn segment_path(&self, n: u32) -> PathBuf {
        self.scratch_dir.join(format!("media{n}.m4s"))
    }

    pub fn init_segment_path(&self) -> PathBuf {
        self.scratch_dir.join("init.mp4")
    }
}

/// Process-wide mapping from session id to session handle.
pub struct SessionRegistry {
    sessions: DashMap<String, Arc<SessionHandle>>,
    creation_locks: DashMap<String, Arc<AsyncMutex<()>>>,
    idle_timeout: Duration,
}

impl SessionRegistry {
    pub fn new(idle_timeout: Duration) -> Arc<Self> {
        Arc::new(Self {
            sessions: DashMap::new(),
            creation_locks: DashMap::new(),
            idle_timeout,
        })
    }

    pub fn get(&self, id: &str) -> Option<Arc<SessionHandle>> {
        self.sessions.get(id).map(|e| e.clone())
    }

    /// Lock serializing concurrent cold-start/restart requests for the same session id, so
    /// two racing first-requests for a new session don't each spawn and immediately clobber
    /// an encoder. Callers must re-check `get()` after acquiring the lock.
    pub fn creation_lock(&self, id: &str) -> Arc<AsyncMutex<()>> {
        self.creation_locks.entry(id.to_string()).or_insert_with(|| Arc::new(AsyncMutex::new(()))).clone()
    }

    /// Insert or replace a session. If one already exists under this id, its encoder is
    /// killed but the scratch directory is preserved (segment files already written remain
    /// valid for the new encoder generation), and its idle timer is cancelled.
    pub fn register(
        self: &Arc<Self>,
        id: String,
        scratch_dir: PathBuf,
        plan: SegmentPlan,
        start_segment: u32,
        segment_time: f64,
        child: Child,
    ) -> Arc<SessionHandle> {
        if let Some((_, old)) = self.sessions.remove(&id) {
            old.mark_closing();
            tokio::spawn(async move {
                let mut guard = old.child.lock().await;
                if let Some(mut c) = guard.take() {
                    let _ = c.kill().await;
                }
            });
        }

        let handle = SessionHandle::new(id.clone(), scratch_dir, plan, start_segment, segment_time, child);
        self.sessions.insert(id, handle.clone());
        self.spawn_idle_timer(handle.clone());
        handle
    }

    /// Reset the idle timer. Fails with `UnknownSession` if the session is absent.
    pub fn touch(&self, id: &str) -> Result<()> {
        match self.sessions.get(id) {
            Some(handle) => {
                handle.touch();
                Ok(())
            }
            None => Err(PlayError::UnknownSession(id.to_string())),
        }
    }

    /// Cancel the timer, kill the process if alive, and recursively remove the scratch
    /// directory. Idempotent: closing an unknown id is a no-op.
    pub async fn close(&self, id: &str) {
        let Some((_, handle)) = self.sessions.remove(id) else {
            tracing::info!(session = id, "close on unknown session, ignoring");
            return;
        };
        handle.mark_closing();
        {
            let mut guard = handle.child.lock().await;
            if let Some(mut c) = guard.take() {
                let _ = c.kill().await;
                let _ = c.wait().await;
            }
        }
        if let Err(e) = tokio::fs::remove_dir_all(&handle.scratch_dir).await {
            if e.kind() != std::io::ErrorKind::NotFound {
                tracing::warn!(session = id, error = %e, "failed to remove scratch dir");
            }
        }
        self.creation_locks.remove(id);
    }

    /// Iterate and close all sessions.
    pub async fn shutdown(&self) {
        let ids: Vec<String> = self.sessions.iter().map(|e| e.key().clone()).collect();
        for id in ids {
            self.close(&id).await;
        }
    }

    fn spawn_idle_timer(self: &Arc<Self>, handle: Arc<SessionHandle>) {
        let registry = self.clone();
        let timeout = self.idle_timeout;
        tokio::spawn(async move {
            loop {
                let elapsed_ms = now_ms().saturating_sub(handle.last_access_ms.load(Ordering::SeqCst));
                let elapsed = Duration::from_millis(elapsed_ms);
                if elapsed >= timeout {
                    break;
                }
                let remaining = timeout - elapsed;
                tokio::select! {
                    _ = tokio::time::sleep(remaining) => {}
                    _ = handle.notify.notified() => {
                        if handle.closing.load(Ordering::SeqCst) {
                            return;
                        }
                    }
                }
            }
            if handle.closing.load(Ordering::SeqCst) {
                return;
            }
            registry.close(&handle.id).await;
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_touch_unknown_session_fails() {
        let registry = SessionRegistry::new(Duration::from_secs(10));
        let err = registry.touch("nope").unwrap_err();
        assert!(matches!(err, PlayError::UnknownSession(_)));
    }

    #[tokio::test]
    async fn test_close_unknown_is_noop() {
        let registry = SessionRegistry::new(Duration::from_secs(10));
        registry.close("nope").await; // must not panic
    }

    #[test]
    fn test_segment_regex_parses_tail_lines() {
        let playlist = "#EXTM3U\n#EXTINF:6.0,\n/hls/media0.m4s?x=1\n#EXTINF:4.0,\n/hls/media1.m4s";
        let mut first = None;
        let mut last = None;
        for line in playlist.lines() {
            if line.starts_with('#') {
                continue;
            }
            if let Some(caps) = segment_re().captures(line) {
                let n: u32 = caps[1].parse().unwrap();
                first = Some(first.map_or(n, |f: u32| f.min(n)));
                last = Some(last.map_or(n, |l: u32| l.max(n)));
            }
        }
        assert_eq!((first, last), (Some(0), Some(1)));
    }
}
