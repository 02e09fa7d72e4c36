//! Per-quality sliding-window transcoder state machine
//!
//! Each `Stream` owns at most one external transcoder process and the
//! window of segments it has produced on disk. Requests for segments inside
//! or just ahead of the window wait for the transcoder; requests far outside
//! it kill the transcoder and restart at the requested position. Once the
//! transcoder has produced enough look-ahead it is paused with SIGSTOP and
//! resumed with SIGCONT when the playback position catches up.

mod chunk;
mod coder;

pub use chunk::Chunk;

use axum::body::Body;
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::oneshot;
use tokio_util::io::ReaderStream;
use tokio_util::sync::CancellationToken;

use crate::config::Config;
use crate::manager::{QualitySpec, SourceInfo};
use crate::playlist;
use crate::probe::CODEC_H264;

/// Quality label of the original-resolution stream.
pub const QUALITY_MAX: &str = "max";

const TS_CONTENT_TYPE: &str = "video/MP2T";
const MP4_CONTENT_TYPE: &str = "video/mp4";

/// How long a request may block on a segment before giving up.
const WAITER_TIMEOUT: Duration = Duration::from_secs(10);

/// Supervisor tick; pruning and idle accounting are quantized to this.
const TICK: Duration = Duration::from_secs(5);

/// Handle to the current transcoder incarnation.
///
/// The `Child` itself is owned by the exit reaper; teardown happens by
/// signalling the pid and letting the reaper collect the exit status.
#[derive(Debug, Clone, Copy)]
struct Coder {
    pid: Pid,
    generation: u64,
}

#[derive(Default)]
struct StreamState {
    /// Highest segment index the transcoder has been asked to produce.
    /// Monotonically non-decreasing within one coder incarnation.
    goal: i64,
    chunks: HashMap<i64, Chunk>,
    /// Segment ids already acknowledged by the stdout reader; the manifest
    /// is rewritten on every segment, so ids repeat.
    seen_chunks: HashSet<i64>,
    coder: Option<Coder>,
    inactive: i64,
    next_generation: u64,
    next_waiter: u64,
}

/// A request parked on a chunk, with a snapshot of the coder it was
/// registered against.
struct Waiter {
    id: i64,
    waiter_id: u64,
    rx: oneshot::Receiver<()>,
    generation: Option<u64>,
}

enum WaitOutcome {
    Done,
    Conflict,
    Timeout,
}

pub struct Stream {
    config: Arc<Config>,
    source: Arc<SourceInfo>,
    spec: QualitySpec,
    /// `<session>-<quality>`, for log context.
    tag: String,
    state: Mutex<StreamState>,
    stop: CancellationToken,
    weak: Weak<Stream>,
}

impl Stream {
    pub fn new(config: Arc<Config>, source: Arc<SourceInfo>, spec: QualitySpec) -> Arc<Stream> {
        let tag = format!("{}-{}", source.id, spec.quality);
        Arc::new_cyclic(|weak| Stream {
            config,
            source,
            spec,
            tag,
            state: Mutex::new(StreamState::default()),
            stop: CancellationToken::new(),
            weak: weak.clone(),
        })
    }

    pub fn quality(&self) -> &str {
        &self.spec.quality
    }

    pub fn spec(&self) -> &QualitySpec {
        &self.spec
    }

    /// Whether a transcoder child currently exists (running or paused).
    pub fn coder_active(&self) -> bool {
        self.state.lock().coder.is_some()
    }

    /// Ask the supervisor to tear the stream down. Idempotent and
    /// non-blocking.
    pub fn stop(&self) {
        self.stop.cancel();
    }

    /// Background supervisor: prunes stale chunks and shuts the transcoder
    /// down after `stream_idle_time` without requests.
    pub async fn run(self: Arc<Self>) {
        let start = tokio::time::Instant::now() + TICK;
        let mut ticker = tokio::time::interval_at(start, TICK);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let mut st = self.state.lock();
                    self.prune_expired(&mut st);

                    st.inactive += 1;
                    if st.inactive >= self.config.stream_idle_time / 5 && st.coder.is_some() {
                        self.clear(&mut st);
                    }
                }
                _ = self.stop.cancelled() => {
                    let mut st = self.state.lock();
                    self.clear(&mut st);
                    return;
                }
            }
        }
    }

    /// Serve the media playlist for this quality. Never starts transcoding.
    pub fn serve_list(&self, query: &str) -> Response {
        let body = playlist::media_playlist(
            &self.spec.quality,
            self.config.chunk_size,
            self.source.probe.duration,
            query,
        );
        playlist::playlist_response(body)
    }

    /// Serve one segment, transcoding just-in-time if needed.
    pub async fn serve_chunk(&self, id: i64) -> Response {
        enum Plan {
            Ready,
            Wait(Waiter),
        }

        let plan = {
            let mut st = self.state.lock();
            st.inactive = 0;
            self.check_goal(&mut st, id);

            if let Some(chunk) = st.chunks.get(&id) {
                if chunk.done {
                    // finished, just return it
                    Plan::Ready
                } else {
                    Plan::Wait(self.register_waiter(&mut st, id))
                }
            } else {
                // a chunk within look-behind means the transcoder will get
                // here soon enough
                let min = (id - self.config.look_behind).max(0);
                let found_behind = (min..id).any(|i| st.chunks.contains_key(&i));

                if found_behind {
                    Plan::Wait(self.register_waiter(&mut st, id))
                } else {
                    Plan::Wait(self.restart_at_chunk(&mut st, id))
                }
            }
        };

        match plan {
            Plan::Ready => self.return_chunk(id).await,
            Plan::Wait(waiter) => self.wait_for_chunk(waiter).await,
        }
    }

    /// Serve the whole source as one progressive file: the raw source when
    /// it is already H.264 and this is the `max` stream, otherwise a
    /// one-shot fragmented-MP4 transcode streamed from ffmpeg's stdout.
    /// Not part of the sliding window; nothing is cached.
    pub async fn serve_full_video(&self) -> Response {
        if self.source.probe.codec_name == CODEC_H264 && self.spec.quality == QUALITY_MAX {
            return self.serve_source_file().await;
        }
        self.transcode_full_video().await
    }

    async fn serve_source_file(&self) -> Response {
        let file = match tokio::fs::File::open(&self.source.path).await {
            Ok(file) => file,
            Err(err) => {
                tracing::error!(stream = %self.tag, %err, "failed to open source file");
                return StatusCode::INTERNAL_SERVER_ERROR.into_response();
            }
        };

        let mut builder = Response::builder().header(header::CONTENT_TYPE, MP4_CONTENT_TYPE);
        if let Ok(meta) = file.metadata().await {
            builder = builder.header(header::CONTENT_LENGTH, meta.len());
        }
        builder
            .body(Body::from_stream(ReaderStream::new(file)))
            .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response())
    }

    /// Register a fresh waiter on `id`, creating the chunk if absent. Must
    /// run under the state lock so registration and completion cannot race.
    fn register_waiter(&self, st: &mut StreamState, id: i64) -> Waiter {
        st.next_waiter += 1;
        let waiter_id = st.next_waiter;
        let generation = st.coder.map(|c| c.generation);

        let chunk = st.chunks.entry(id).or_insert_with(|| Chunk::new(id));
        let rx = chunk.add_waiter(waiter_id);

        Waiter {
            id,
            waiter_id,
            rx,
            generation,
        }
    }

    /// Park until the chunk completes, the window is torn down under us, or
    /// the timeout fires. The state lock is released across the wait.
    async fn wait_for_chunk(&self, waiter: Waiter) -> Response {
        let Waiter {
            id,
            waiter_id,
            rx,
            generation,
        } = waiter;

        tokio::select! {
            // woken by the stdout reader, the exit reaper, or a teardown
            // dropping the chunk (and with it our sender)
            _ = rx => {}
            _ = tokio::time::sleep(WAITER_TIMEOUT) => {}
        }

        let outcome = {
            let mut st = self.state.lock();
            if let Some(chunk) = st.chunks.get_mut(&id) {
                chunk.remove_waiter(waiter_id);
            }

            if st.chunks.get(&id).map_or(false, |c| c.done) {
                WaitOutcome::Done
            } else if st.coder.map(|c| c.generation) != generation {
                WaitOutcome::Conflict
            } else {
                WaitOutcome::Timeout
            }
        };

        match outcome {
            WaitOutcome::Done => self.return_chunk(id).await,
            // the window moved under us; the client should reissue
            WaitOutcome::Conflict => StatusCode::CONFLICT.into_response(),
            WaitOutcome::Timeout => StatusCode::REQUEST_TIMEOUT.into_response(),
        }
    }

    /// Stream the finished segment file. Runs without the state lock; the
    /// chunk is not mutated during the copy and pruning never touches ids
    /// inside the window.
    async fn return_chunk(&self, id: i64) -> Response {
        let path = self.ts_path(id);
        match tokio::fs::File::open(&path).await {
            Ok(file) => (
                [(header::CONTENT_TYPE, TS_CONTENT_TYPE)],
                Body::from_stream(ReaderStream::new(file)),
            )
                .into_response(),
            Err(err) => {
                tracing::error!(stream = %self.tag, path = %path.display(), %err,
                    "finished segment missing on disk");
                StatusCode::INTERNAL_SERVER_ERROR.into_response()
            }
        }
    }

    /// Seek path: kill the current transcoder, drop the window and start
    /// over at `id`.
    fn restart_at_chunk(&self, st: &mut StreamState, id: i64) -> Waiter {
        self.clear(st);

        st.chunks.insert(id, Chunk::new(id));
        st.goal = id + self.config.goal_buffer_max;
        self.transcode(st, id);

        self.register_waiter(st, id)
    }

    /// Slide the window forward when a request approaches the goal, and
    /// resume a paused transcoder.
    fn check_goal(&self, st: &mut StreamState, id: i64) {
        if id + self.config.goal_buffer_min > st.goal {
            st.goal = id + self.config.goal_buffer_max;

            if let Some(coder) = st.coder {
                tracing::info!(stream = %self.tag, goal = st.goal, "resuming transcoding");
                let _ = signal::kill(coder.pid, Signal::SIGCONT);
            }
        }
    }

    /// Drop every chunk behind the retention window together with its file.
    fn prune_expired(&self, st: &mut StreamState) {
        let cutoff = st.goal - self.config.goal_buffer_max;
        let stale: Vec<i64> = st.chunks.keys().filter(|id| **id < cutoff).copied().collect();
        for id in stale {
            self.prune_chunk(st, id);
        }
    }

    fn prune_chunk(&self, st: &mut StreamState, id: i64) {
        st.chunks.remove(&id);
        let _ = std::fs::remove_file(self.ts_path(id));
    }

    /// Tear down the transcoder and all window state. The exit reaper
    /// collects the killed child.
    fn clear(&self, st: &mut StreamState) {
        tracing::info!(stream = %self.tag, "stopping stream");

        let ids: Vec<i64> = st.chunks.values().map(|chunk| chunk.id).collect();
        for id in ids {
            self.prune_chunk(st, id);
        }

        st.seen_chunks.clear();
        st.goal = 0;

        if let Some(coder) = st.coder.take() {
            let _ = signal::kill(coder.pid, Signal::SIGKILL);
        }
    }

    fn ts_path(&self, id: i64) -> PathBuf {
        self.source
            .temp_dir
            .join(format!("{}-{:06}.ts", self.spec.quality, id))
    }

    /// Segment filename pattern handed to the transcoder.
    fn ts_pattern(&self) -> String {
        format!(
            "{}/{}-%06d.ts",
            self.source.temp_dir.display(),
            self.spec.quality
        )
    }
}
