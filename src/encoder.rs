//! Encode sessions: collect chunks, then build media and index files.
//!
//! ```text
//! Ready --add--> Collecting --add--> Collecting
//! Ready | Collecting --build--> Building --ok--> Completed
//!                                        --err-> Failed
//! Collecting | Completed | Failed --reset--> Ready
//! ```
//!
//! `build` runs the pipeline on its own thread and blocks the caller until
//! it finishes. Other handles to the same session can query state while the
//! build runs; mutating calls are rejected until it ends.

use std::any::Any;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread;
use std::time::Instant;

use uuid::Uuid;

use crate::config::Config;
use crate::error::{ArchiveError, Result, SessionState, StateError};
use crate::frame::fit_frame;
use crate::index::ArchiveIndex;
use crate::registry::Capabilities;
use crate::types::{BuildStats, ChunkRecord, SessionInfo};
use crate::util::write_atomic;

const ORPHANED_BUILD: &str = "build worker terminated without reporting";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Call {
    AddChunks,
    AddText,
    Build,
    Reset,
}

impl Call {
    fn name(self) -> &'static str {
        match self {
            Self::AddChunks => "add_chunks",
            Self::AddText => "add_text",
            Self::Build => "build",
            Self::Reset => "reset",
        }
    }
}

/// Whether `call` is allowed in `state`.
fn admit(state: SessionState, call: Call) -> std::result::Result<(), StateError> {
    use Call::{AddChunks, AddText, Build, Reset};
    use SessionState::{Building, Collecting, Completed, Failed, Ready};

    match (state, call) {
        (Ready | Collecting, AddChunks | AddText | Build) => Ok(()),
        (Collecting | Completed | Failed, Reset) => Ok(()),
        (Building, _) => Err(StateError::BuildingInProgress),
        (Completed, AddChunks | AddText | Build) => Err(StateError::AlreadyCompleted),
        (Ready, Reset) | (Failed, AddChunks | AddText | Build) => Err(StateError::UnexpectedCall {
            state,
            call: call.name(),
        }),
    }
}

#[derive(Debug)]
struct SessionInner {
    state: SessionState,
    pending: Vec<String>,
    output_path: Option<PathBuf>,
    index_path: Option<PathBuf>,
    stats: Option<BuildStats>,
    failure: Option<String>,
}

impl SessionInner {
    fn new() -> Self {
        Self {
            state: SessionState::Ready,
            pending: Vec::new(),
            output_path: None,
            index_path: None,
            stats: None,
            failure: None,
        }
    }

    fn check(&self, call: Call) -> Result<()> {
        admit(self.state, call).map_err(ArchiveError::from)
    }
}

fn lock(inner: &Mutex<SessionInner>) -> MutexGuard<'_, SessionInner> {
    inner.lock().unwrap_or_else(|e| e.into_inner())
}

/// Handle to one encode session. Clones share the same session.
#[derive(Clone)]
pub struct EncoderSession {
    id: Uuid,
    config: Arc<Config>,
    caps: Capabilities,
    inner: Arc<Mutex<SessionInner>>,
}

impl std::fmt::Debug for EncoderSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EncoderSession")
            .field("id", &self.id)
            .field("state", &self.state())
            .field("pending", &self.pending_len())
            .finish()
    }
}

impl EncoderSession {
    /// New session in `Ready` with the default collaborators for `config`.
    pub fn new(config: Config) -> Result<Self> {
        config.validate()?;
        let caps = Capabilities::from_config(&config)?;
        Self::with_capabilities(config, caps)
    }

    pub fn with_capabilities(config: Config, caps: Capabilities) -> Result<Self> {
        config.validate()?;
        config.codec_params()?;
        if caps.embedder.dimension() != config.index.embedding_dimensions {
            return Err(ArchiveError::validation(format!(
                "embedding provider produces {} dimensions, index expects {}",
                caps.embedder.dimension(),
                config.index.embedding_dimensions
            )));
        }
        let id = Uuid::new_v4();
        tracing::debug!(session_id = %id, codec = %config.codec, "encode session started");
        Ok(Self {
            id,
            config: Arc::new(config),
            caps,
            inner: Arc::new(Mutex::new(SessionInner::new())),
        })
    }

    #[must_use]
    pub fn id(&self) -> Uuid {
        self.id
    }

    #[must_use]
    pub fn config(&self) -> &Config {
        &self.config
    }

    #[must_use]
    pub fn state(&self) -> SessionState {
        lock(&self.inner).state
    }

    #[must_use]
    pub fn pending_len(&self) -> usize {
        lock(&self.inner).pending.len()
    }

    /// Stats of the last build, present only while `Completed`.
    #[must_use]
    pub fn stats(&self) -> Option<BuildStats> {
        lock(&self.inner).stats.clone()
    }

    /// Cause of the last build failure, present only while `Failed`.
    #[must_use]
    pub fn failure(&self) -> Option<String> {
        lock(&self.inner).failure.clone()
    }

    #[must_use]
    pub fn snapshot(&self) -> SessionInfo {
        let inner = lock(&self.inner);
        SessionInfo {
            id: self.id.to_string(),
            state: inner.state,
            pending_chunks: inner.pending.len(),
            output_path: inner.output_path.clone(),
            index_path: inner.index_path.clone(),
            stats: inner.stats.clone(),
            failure: inner.failure.clone(),
        }
    }

    /// Append chunks as given. Returns the number of pending chunks.
    pub fn add_chunks<I, S>(&self, chunks: I) -> Result<usize>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut inner = lock(&self.inner);
        inner.check(Call::AddChunks)?;
        inner.pending.extend(chunks.into_iter().map(Into::into));
        inner.state = SessionState::Collecting;
        Ok(inner.pending.len())
    }

    /// Chunk `text` and append every non-empty piece.
    ///
    /// Returns the number of pieces added. Text that chunks to nothing is
    /// rejected with [`ArchiveError::EmptyInput`] and leaves the session as
    /// it was.
    pub fn add_text(&self, text: &str) -> Result<usize> {
        lock(&self.inner).check(Call::AddText)?;
        let pieces: Vec<String> = self
            .caps
            .chunker
            .chunk(text, &self.config.chunking)
            .into_iter()
            .filter(|piece| !piece.trim().is_empty())
            .collect();
        if pieces.is_empty() {
            return Err(ArchiveError::EmptyInput);
        }
        // The chunker ran unlocked; a build or reset may have started since.
        let mut inner = lock(&self.inner);
        inner.check(Call::AddText)?;
        let added = pieces.len();
        inner.pending.extend(pieces);
        inner.state = SessionState::Collecting;
        tracing::debug!(session_id = %self.id, added, "chunked text");
        Ok(added)
    }

    /// Drop pending chunks and any build result, returning to `Ready`.
    pub fn reset(&self) -> Result<()> {
        let mut inner = lock(&self.inner);
        inner.check(Call::Reset)?;
        *inner = SessionInner::new();
        tracing::debug!(session_id = %self.id, "session reset");
        Ok(())
    }

    /// Encode every pending chunk to `output` and write the index to `index`.
    ///
    /// Blocks until the build finishes. The session ends in `Completed` or
    /// `Failed` even if the build thread panics.
    pub fn build(&self, output: impl AsRef<Path>, index: impl AsRef<Path>) -> Result<BuildStats> {
        let output = output.as_ref().to_path_buf();
        let index = index.as_ref().to_path_buf();

        let chunks = {
            let mut inner = lock(&self.inner);
            inner.check(Call::Build)?;
            if inner.pending.is_empty() {
                return Err(StateError::NoChunks.into());
            }
            inner.state = SessionState::Building;
            inner.output_path = Some(output.clone());
            inner.index_path = Some(index.clone());
            inner.pending.clone()
        };

        tracing::info!(
            session_id = %self.id,
            chunks = chunks.len(),
            output = %output.display(),
            "build started"
        );

        let guard = CompletionGuard {
            inner: Arc::clone(&self.inner),
            reported: false,
        };
        let job = BuildJob {
            session_id: self.id,
            config: Arc::clone(&self.config),
            caps: self.caps.clone(),
            chunks,
            output,
            index,
        };
        let handle = thread::Builder::new()
            .name(format!("framevault-build-{}", self.id.simple()))
            .spawn(move || {
                let mut guard = guard;
                let result = job.run();
                guard.report(&result);
                result
            })
            .map_err(|err| ArchiveError::BuildFailed {
                reason: format!("failed to spawn build worker: {err}"),
            })?;

        match handle.join() {
            Ok(result) => result,
            Err(panic) => {
                let reason = format!("{ORPHANED_BUILD}: {}", panic_payload(&panic));
                tracing::error!(session_id = %self.id, %reason, "build worker panicked");
                Err(ArchiveError::BuildFailed { reason })
            }
        }
    }
}

/// Moves the session out of `Building` exactly once. If the build thread
/// unwinds before reporting, drop marks the session failed.
struct CompletionGuard {
    inner: Arc<Mutex<SessionInner>>,
    reported: bool,
}

impl CompletionGuard {
    fn report(&mut self, result: &Result<BuildStats>) {
        let mut inner = lock(&self.inner);
        match result {
            Ok(stats) => {
                inner.state = SessionState::Completed;
                inner.stats = Some(stats.clone());
                inner.failure = None;
            }
            Err(err) => {
                inner.state = SessionState::Failed;
                inner.stats = None;
                inner.failure = Some(err.to_string());
            }
        }
        self.reported = true;
    }
}

impl Drop for CompletionGuard {
    fn drop(&mut self) {
        if self.reported {
            return;
        }
        let mut inner = lock(&self.inner);
        if inner.state == SessionState::Building {
            inner.state = SessionState::Failed;
            inner.failure = Some(ORPHANED_BUILD.to_string());
        }
    }
}

fn panic_payload(payload: &Box<dyn Any + Send + 'static>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown".to_string()
    }
}

/// Frozen inputs of one build.
struct BuildJob {
    session_id: Uuid,
    config: Arc<Config>,
    caps: Capabilities,
    chunks: Vec<String>,
    output: PathBuf,
    index: PathBuf,
}

impl BuildJob {
    fn run(&self) -> Result<BuildStats> {
        let started = Instant::now();
        let result = self.run_steps();
        match &result {
            Ok(stats) => tracing::info!(
                session_id = %self.session_id,
                frames = stats.total_frames,
                media_bytes = stats.media_bytes,
                elapsed_ms = started.elapsed().as_millis() as u64,
                "build completed"
            ),
            Err(err) => tracing::warn!(
                session_id = %self.session_id,
                error = %err,
                "build failed"
            ),
        }
        result
    }

    fn run_steps(&self) -> Result<BuildStats> {
        let params = self.config.codec_params()?;
        let media_bytes = self.write_media(&params)?;

        let mut index = ArchiveIndex::create(&self.config, Arc::clone(&self.caps.embedder))?;
        let frame_numbers: Vec<u64> = (0..self.chunks.len() as u64).collect();
        index.add_items(&self.chunks, &frame_numbers)?;
        index.save(&self.index)?;

        let total_frames = self.chunks.len();
        Ok(BuildStats {
            total_chunks: self.chunks.len(),
            total_frames,
            duration_seconds: total_frames as f64 / f64::from(params.fps),
            fps: params.fps,
            output_path: self.output.clone(),
            index_path: self.index.clone(),
            session_id: self.session_id.to_string(),
            media_bytes,
            index: index.get_stats(),
        })
    }

    /// Symbol-encode every chunk into one frame and stream the packets to
    /// the output file. Returns the bytes written.
    fn write_media(&self, params: &crate::config::CodecParams) -> Result<u64> {
        let mut encoder = self.caps.frames.encoder(params)?;
        let mut written = 0u64;
        write_atomic(&self.output, |file| {
            let mut emit = |packets: Vec<Vec<u8>>| -> Result<()> {
                for packet in packets {
                    file.write_all(&packet)?;
                    written += packet.len() as u64;
                }
                Ok(())
            };
            for (frame_num, chunk) in self.chunks.iter().enumerate() {
                let record = ChunkRecord {
                    id: frame_num as u64,
                    text: chunk.clone(),
                    frame: frame_num as u64,
                };
                let payload = serde_json::to_vec(&record)?;
                let symbol = self.caps.symbol.encode(&payload, &self.config.symbol)?;
                let frame = fit_frame(symbol, params);
                emit(encoder.encode(&frame)?)?;
            }
            emit(encoder.flush()?)
        })?;
        Ok(written)
    }
}
