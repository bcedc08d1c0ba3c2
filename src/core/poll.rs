//! Shared per-console poll state
//!
//! One [`PollState`] exists per (target, console) and test run. It owns
//! the capture file, the remote read offset and the stream generation,
//! plus the search cursors of every detection context reading it.
//! Polls are serialized per console; detection only needs the cursor
//! map lock for a moment and scans the capture without holding it.

use super::capture::{self, CaptureSlice, CaptureStore};
use super::context::WaitContext;
use super::error::ExpectError;
use super::target::Target;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

/// Where a detection context is looking
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SearchCursor {
    /// Next capture offset to search from
    pub offset: u64,
    /// Offset the search started at before the last match
    pub offset_prev: u64,
}

/// Remote side bookkeeping, only touched while polling
#[derive(Debug, Default)]
struct RemoteCursor {
    store: Option<CaptureStore>,
    read_offset: u64,
    generation: Option<u64>,
}

/// Poll state of one console of one target
#[derive(Debug)]
pub struct PollState {
    key: String,
    console: String,
    target: Arc<Target>,
    capture_path: PathBuf,
    remote: tokio::sync::Mutex<RemoteCursor>,
    cursors: Mutex<HashMap<String, SearchCursor>>,
    captured: AtomicU64,
    opened: AtomicBool,
}

impl PollState {
    /// Poll state for `console` of `target`, capturing into `capture_dir`
    pub fn new(target: Arc<Target>, console: &str, capture_dir: &Path) -> Self {
        let capture_path =
            capture_dir.join(capture::capture_file_name(target.role(), target.id(), console));
        Self {
            key: target.poll_key(console),
            console: console.to_string(),
            target,
            capture_path,
            remote: tokio::sync::Mutex::new(RemoteCursor::default()),
            cursors: Mutex::new(HashMap::new()),
            captured: AtomicU64::new(0),
            opened: AtomicBool::new(false),
        }
    }

    /// `console-ROLE.ID.CONSOLE`
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Console name
    pub fn console(&self) -> &str {
        &self.console
    }

    /// Target this console belongs to
    pub fn target(&self) -> &Arc<Target> {
        &self.target
    }

    /// Path of the capture file (may not exist until the first poll)
    pub fn capture_path(&self) -> &Path {
        &self.capture_path
    }

    /// Whether the capture file was created
    pub fn is_open(&self) -> bool {
        self.opened.load(Ordering::Acquire)
    }

    /// Bytes in the capture file
    pub fn captured_len(&self) -> u64 {
        self.captured.load(Ordering::Acquire)
    }

    /// Next remote offset to read
    pub async fn read_offset(&self) -> u64 {
        self.remote.lock().await.read_offset
    }

    /// Last stream generation seen
    pub async fn generation(&self) -> Option<u64> {
        self.remote.lock().await.generation
    }

    /// Create the capture file if needed
    ///
    /// A new capture starts reading `lookback` bytes before the current
    /// end of the remote console, so it does not pull in its whole
    /// history.
    pub async fn ensure_open(&self, ctx: &WaitContext, lookback: u64) -> Result<(), ExpectError> {
        let mut remote = self.remote.lock().await;
        self.open_locked(ctx, &mut remote, lookback).await
    }

    async fn open_locked(
        &self,
        ctx: &WaitContext,
        remote: &mut RemoteCursor,
        lookback: u64,
    ) -> Result<(), ExpectError> {
        if remote.store.is_some() {
            return Ok(());
        }
        let size = self
            .target
            .remote()
            .size(&self.console)
            .await
            .map_err(|e| ExpectError::remote(&self.key, 0, &e))?
            .unwrap_or(0);
        let store = CaptureStore::create(&self.capture_path)
            .await
            .map_err(|e| ExpectError::capture_io(&self.key, &e))?;
        remote.read_offset = size.saturating_sub(lookback);
        remote.store = Some(store);
        self.opened.store(true, Ordering::Release);
        tracing::debug!(
            "{}: new console capture {} reading from @{}",
            ctx.prefix(),
            self.capture_path.display(),
            remote.read_offset
        );
        Ok(())
    }

    /// Fetch new remote bytes and append them to the capture
    ///
    /// Only one poll per console runs at a time. When the remote reports
    /// a newer generation the read restarts at offset zero; the capture
    /// file keeps growing so search cursors remain valid. Returns how
    /// many bytes were appended.
    pub async fn poll(&self, ctx: &WaitContext, lookback: u64) -> Result<u64, ExpectError> {
        let mut guard = self.remote.lock().await;
        let remote = &mut *guard;
        self.open_locked(ctx, remote, lookback).await?;

        let read_offset = remote.read_offset;
        let console_remote = self.target.remote();
        tracing::trace!(
            "{}: reading from console {}:{} @{}",
            ctx.prefix(),
            self.target.full_id(),
            self.console,
            read_offset
        );
        let mut chunk = console_remote
            .read(&self.console, read_offset)
            .await
            .map_err(|e| ExpectError::remote(&self.key, read_offset, &e))?;

        match remote.generation {
            None => remote.generation = Some(chunk.generation),
            Some(prev) if chunk.generation > prev => {
                tracing::info!(
                    "{}: console {}:{} restarted (generation {} -> {}), re-reading from start",
                    ctx.prefix(),
                    self.target.full_id(),
                    self.console,
                    prev,
                    chunk.generation
                );
                chunk = console_remote
                    .read(&self.console, 0)
                    .await
                    .map_err(|e| ExpectError::remote(&self.key, 0, &e))?;
                if chunk.generation < prev {
                    return Err(self.generation_regressed(prev, chunk.generation));
                }
                remote.generation = Some(chunk.generation);
                remote.read_offset = 0;
            }
            Some(prev) if chunk.generation < prev => {
                return Err(self.generation_regressed(prev, chunk.generation));
            }
            Some(_) => {
                if chunk.new_offset < read_offset {
                    return Err(ExpectError::blocked(format!(
                        "{}: remote offset went backwards within a generation (@{} -> @{})",
                        self.key, read_offset, chunk.new_offset
                    )));
                }
            }
        }

        let store = remote
            .store
            .as_mut()
            .ok_or_else(|| ExpectError::blocked(format!("{}: capture not open", self.key)))?;
        let appended = chunk.data.len() as u64;
        store
            .append(chunk.data)
            .await
            .map_err(|e| ExpectError::capture_io(&self.key, &e))?;
        self.captured.store(store.len(), Ordering::Release);
        remote.read_offset = chunk.new_offset;

        if appended > 0 {
            tracing::debug!(
                "{}: read from console {}:{} @{} {}B (new offset @{})",
                ctx.prefix(),
                self.target.full_id(),
                self.console,
                read_offset,
                appended,
                chunk.new_offset
            );
        }
        Ok(appended)
    }

    fn generation_regressed(&self, prev: u64, got: u64) -> ExpectError {
        ExpectError::blocked(format!(
            "{}: console generation went backwards ({} -> {})",
            self.key, prev, got
        ))
    }

    /// Search cursor of a detection context
    pub fn cursor(&self, detect_context: &str) -> SearchCursor {
        self.cursors
            .lock()
            .get(detect_context)
            .copied()
            .unwrap_or_default()
    }

    /// Record a match in `[observed.offset, match_end)`
    ///
    /// Commits only if nobody moved the cursor since `observed` was
    /// read; returns whether it did.
    pub(crate) fn commit_match(
        &self,
        detect_context: &str,
        observed: SearchCursor,
        match_end: u64,
    ) -> bool {
        let mut cursors = self.cursors.lock();
        let cursor = cursors.entry(detect_context.to_string()).or_default();
        if cursor.offset != observed.offset || match_end < cursor.offset {
            return false;
        }
        cursor.offset_prev = observed.offset;
        cursor.offset = match_end;
        true
    }

    /// Move a detection context forward to `offset`; never backwards
    pub fn advance_cursor(&self, detect_context: &str, offset: u64) -> SearchCursor {
        let mut cursors = self.cursors.lock();
        let cursor = cursors.entry(detect_context.to_string()).or_default();
        if offset > cursor.offset {
            cursor.offset_prev = cursor.offset;
            cursor.offset = offset;
        }
        *cursor
    }

    /// Make a detection context look only at what is captured after now
    pub fn sync_to_end(&self, detect_context: &str) -> SearchCursor {
        self.advance_cursor(detect_context, self.captured_len())
    }

    /// Capture range `[from, to)`
    pub fn slice(&self, from: u64, to: u64) -> CaptureSlice {
        CaptureSlice::new(&self.capture_path, from, to)
    }

    /// Read `[from, to)` from the capture
    pub fn read_range(&self, from: u64, to: u64) -> Result<Vec<u8>, ExpectError> {
        capture::read_range(&self.capture_path, from, to)
            .map_err(|e| ExpectError::capture_io(&self.key, &e))
    }

    /// Read `size` bytes from `offset`; everything to the end if `None`
    pub fn captured_chunk(&self, offset: u64, size: Option<u64>) -> Result<Vec<u8>, ExpectError> {
        let end = self.captured_len();
        let to = size.map_or(end, |size| offset.saturating_add(size).min(end));
        self.read_range(offset, to)
    }
}

/// All poll states of a test run, by poll key
#[derive(Debug)]
pub struct PollRegistry {
    capture_dir: PathBuf,
    states: Mutex<HashMap<String, Arc<PollState>>>,
}

impl PollRegistry {
    /// Registry writing captures to `capture_dir`
    pub fn new(capture_dir: &Path) -> Self {
        Self {
            capture_dir: capture_dir.to_path_buf(),
            states: Mutex::new(HashMap::new()),
        }
    }

    /// Directory captures are written to
    pub fn capture_dir(&self) -> &Path {
        &self.capture_dir
    }

    /// Shared poll state for a console, created on first use
    pub fn get(&self, target: &Arc<Target>, console: &str) -> Arc<PollState> {
        let key = target.poll_key(console);
        self.states
            .lock()
            .entry(key)
            .or_insert_with(|| Arc::new(PollState::new(target.clone(), console, &self.capture_dir)))
            .clone()
    }

    /// Existing poll states
    pub fn states(&self) -> Vec<Arc<PollState>> {
        self.states.lock().values().cloned().collect()
    }

    /// Drop every poll state; capture files stay on disk
    pub fn clear(&self) {
        self.states.lock().clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::remote::{ConsoleRemote, ReadChunk, RemoteError};
    use crate::core::simulator::SimulatedConsole;
    use async_trait::async_trait;
    use bytes::Bytes;
    use mockall::mock;
    use mockall::predicate::eq;

    mock! {
        Remote {}

        #[async_trait]
        impl ConsoleRemote for Remote {
            async fn read(&self, console: &str, offset: u64) -> Result<ReadChunk, RemoteError>;
            async fn write(&self, console: &str, data: &[u8]) -> Result<(), RemoteError>;
            async fn size(&self, console: &str) -> Result<Option<u64>, RemoteError>;
        }
    }

    fn chunk(generation: u64, new_offset: u64, data: &'static [u8]) -> ReadChunk {
        ReadChunk {
            generation,
            new_offset,
            data: Bytes::from_static(data),
        }
    }

    fn mocked(dir: &Path, remote: MockRemote) -> PollState {
        let target = Arc::new(Target::new("target", "hw1", "serial0", Arc::new(remote)));
        PollState::new(target, "serial0", dir)
    }

    fn setup(dir: &Path) -> (Arc<SimulatedConsole>, Arc<PollState>) {
        let sim = Arc::new(SimulatedConsole::new(&["serial0"]));
        let target = Arc::new(Target::new("target", "qemu0", "serial0", sim.clone()));
        let registry = PollRegistry::new(dir);
        (sim, registry.get(&target, "serial0"))
    }

    #[tokio::test]
    async fn test_poll_appends() {
        let dir = tempfile::tempdir().unwrap();
        let (sim, state) = setup(dir.path());
        let ctx = WaitContext::default();

        sim.emit("serial0", b"hello ");
        assert_eq!(state.poll(&ctx, 4096).await.unwrap(), 6);
        sim.emit("serial0", b"world");
        assert_eq!(state.poll(&ctx, 4096).await.unwrap(), 5);
        assert_eq!(state.poll(&ctx, 4096).await.unwrap(), 0);

        assert_eq!(state.captured_len(), 11);
        assert_eq!(state.read_range(0, 11).unwrap(), b"hello world");
        assert_eq!(state.read_offset().await, 11);
        assert!(state
            .capture_path()
            .ends_with("console-target.qemu0.serial0.txt"));
    }

    #[tokio::test]
    async fn test_lookback_window() {
        let dir = tempfile::tempdir().unwrap();
        let (sim, state) = setup(dir.path());
        let ctx = WaitContext::default();

        sim.emit("serial0", &vec![b'x'; 10_000]);
        state.poll(&ctx, 4096).await.unwrap();
        assert_eq!(sim.read_offsets("serial0"), vec![10_000 - 4096]);
        assert_eq!(state.captured_len(), 4096);
    }

    #[tokio::test]
    async fn test_generation_reset_rereads_from_zero() {
        let dir = tempfile::tempdir().unwrap();
        let (sim, state) = setup(dir.path());
        let ctx = WaitContext::default();

        sim.emit("serial0", b"hello");
        state.poll(&ctx, 4096).await.unwrap();
        assert_eq!(state.generation().await, Some(1));

        sim.power_cycle("serial0");
        sim.emit("serial0", b"hi");
        state.poll(&ctx, 4096).await.unwrap();

        assert_eq!(sim.read_offsets("serial0"), vec![0, 5, 0]);
        assert_eq!(state.generation().await, Some(2));
        assert_eq!(state.read_offset().await, 2);
        assert_eq!(state.read_range(0, state.captured_len()).unwrap(), b"hellohi");
    }

    #[tokio::test]
    async fn test_remote_failure_is_blocked_and_keeps_offset() {
        let dir = tempfile::tempdir().unwrap();
        let (sim, state) = setup(dir.path());
        let ctx = WaitContext::default();

        sim.emit("serial0", b"abc");
        state.poll(&ctx, 4096).await.unwrap();
        sim.fail_reads("serial0", 1);
        let err = state.poll(&ctx, 4096).await.unwrap_err();
        assert!(err.is_blocked());
        assert_eq!(state.read_offset().await, 3);

        sim.emit("serial0", b"def");
        state.poll(&ctx, 4096).await.unwrap();
        assert_eq!(state.read_range(0, 6).unwrap(), b"abcdef");
        assert_eq!(sim.size("serial0").await.unwrap(), Some(6));
    }

    #[test]
    fn test_cursor_forward_only() {
        let dir = tempfile::tempdir().unwrap();
        let (_sim, state) = setup(dir.path());

        let cursor = state.advance_cursor("echo", 10);
        assert_eq!(cursor, SearchCursor { offset: 10, offset_prev: 0 });
        let cursor = state.advance_cursor("echo", 5);
        assert_eq!(cursor.offset, 10);
        assert_eq!(state.cursor("other"), SearchCursor::default());

        let observed = state.cursor("echo");
        assert!(state.commit_match("echo", observed, 20));
        assert!(!state.commit_match("echo", observed, 30));
        assert_eq!(state.cursor("echo"), SearchCursor { offset: 20, offset_prev: 10 });
    }

    #[tokio::test]
    async fn test_generation_going_backwards_is_blocked() {
        let dir = tempfile::tempdir().unwrap();
        let mut remote = MockRemote::new();
        remote.expect_size().returning(|_| Ok(Some(0)));
        remote
            .expect_read()
            .with(eq("serial0"), eq(0u64))
            .times(1)
            .returning(|_, _| Ok(chunk(2, 3, b"abc")));
        remote
            .expect_read()
            .with(eq("serial0"), eq(3u64))
            .returning(|_, _| Ok(chunk(1, 3, b"")));
        let state = mocked(dir.path(), remote);
        let ctx = WaitContext::default();

        state.poll(&ctx, 4096).await.unwrap();
        let err = state.poll(&ctx, 4096).await.unwrap_err();
        assert!(err.is_blocked());
        assert!(err.to_string().contains("generation went backwards"), "{err}");
        assert_eq!(state.generation().await, Some(2));
        assert_eq!(state.read_offset().await, 3);
        assert_eq!(state.captured_len(), 3);
    }

    #[tokio::test]
    async fn test_offset_going_backwards_is_blocked() {
        let dir = tempfile::tempdir().unwrap();
        let mut remote = MockRemote::new();
        remote.expect_size().returning(|_| Ok(Some(0)));
        remote
            .expect_read()
            .with(eq("serial0"), eq(0u64))
            .times(1)
            .returning(|_, _| Ok(chunk(1, 5, b"hello")));
        remote
            .expect_read()
            .with(eq("serial0"), eq(5u64))
            .returning(|_, _| Ok(chunk(1, 2, b"")));
        let state = mocked(dir.path(), remote);
        let ctx = WaitContext::default();

        state.poll(&ctx, 4096).await.unwrap();
        let err = state.poll(&ctx, 4096).await.unwrap_err();
        assert!(err.is_blocked());
        assert!(err.to_string().contains("offset went backwards"), "{err}");
        assert_eq!(state.read_offset().await, 5);
        assert_eq!(state.read_range(0, state.captured_len()).unwrap(), b"hello");
    }

    #[tokio::test]
    async fn test_captured_chunk() {
        let dir = tempfile::tempdir().unwrap();
        let (sim, state) = setup(dir.path());
        let ctx = WaitContext::default();

        sim.emit("serial0", b"Linux version 6.1\nlogin: ");
        state.poll(&ctx, 4096).await.unwrap();
        assert_eq!(state.captured_chunk(6, Some(7)).unwrap(), b"version");
        assert_eq!(state.captured_chunk(18, None).unwrap(), b"login: ");
        // sizes past the end are clamped
        assert_eq!(state.captured_chunk(18, Some(100)).unwrap(), b"login: ");
        assert!(state.captured_chunk(100, None).unwrap().is_empty());
    }

    #[tokio::test(flavor = "current_thread")]
    async fn test_concurrent_polls_share_one_capture() {
        let dir = tempfile::tempdir().unwrap();
        let (sim, state) = setup(dir.path());
        let ctx = WaitContext::default();

        sim.emit("serial0", &vec![b'x'; 1024]);
        let (a, b) = tokio::join!(state.poll(&ctx, 4096), state.poll(&ctx, 4096));
        assert_eq!(a.unwrap() + b.unwrap(), 1024);
        assert_eq!(state.captured_len(), 1024);
        assert_eq!(std::fs::metadata(state.capture_path()).unwrap().len(), 1024);
    }
}
