//! Transcoder driver
//!
//! Builds the ffmpeg argument vector, spawns the child with piped stdio and
//! runs the three monitor tasks: the stdout reader that parses manifest
//! updates into chunk completions, the stderr drain, and the exit reaper.

use axum::body::Body;
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use bytes::Bytes;
use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;
use regex::Regex;
use std::pin::Pin;
use std::process::Stdio;
use std::sync::{Arc, OnceLock};
use std::task::{Context, Poll};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, ChildStderr, ChildStdout, Command};
use tokio_util::io::ReaderStream;

use super::{Chunk, Coder, Stream, StreamState, QUALITY_MAX};

const ENCODER_X264: &str = "libx264";
const ENCODER_VAAPI: &str = "h264_vaapi";
const ENCODER_NVENC: &str = "h264_nvenc";

/// Flush granularity for progressive full-video streaming.
const FULL_VIDEO_BUF: usize = 1024 * 1024;

impl Stream {
    /// Spawn a transcoder positioned at `start_id` and register it as the
    /// current coder. Runs under the state lock; on spawn failure the coder
    /// stays empty and waiting requests resolve by timeout.
    pub(super) fn transcode(&self, st: &mut StreamState, start_id: i64) {
        // start one segment early so the keyframes line up with the
        // preceding window
        let start_id = if start_id > 0 { start_id - 1 } else { 0 };
        let start_at = (start_id * self.config.chunk_size) as f64;

        let mut args = self.transcode_args(start_at, true);

        // segmenting
        args.extend([
            "-start_number".to_string(),
            start_id.to_string(),
            "-avoid_negative_ts".to_string(),
            "disabled".to_string(),
            "-f".to_string(),
            "hls".to_string(),
            // Keyframes can land off the segment boundary even when forced,
            // so segments are chopped by time; the player fuses a segment
            // with the previous GOP when it does not open on a keyframe.
            "-hls_flags".to_string(),
            "split_by_time".to_string(),
            "-hls_time".to_string(),
            self.config.chunk_size.to_string(),
            "-hls_segment_type".to_string(),
            "mpegts".to_string(),
            "-hls_segment_filename".to_string(),
            self.ts_pattern(),
        ]);

        if self.config.use_gop_size && self.source.probe.frame_rate > 0 {
            let gop = (self.config.chunk_size * self.source.probe.frame_rate as i64).to_string();
            args.extend(["-g".to_string(), gop.clone(), "-keyint_min".to_string(), gop]);
        } else {
            args.extend([
                "-force_key_frames".to_string(),
                format!("expr:gte(t,n_forced*{})", self.config.chunk_size),
            ]);
        }

        // manifest to stdout
        args.push("-".to_string());

        tracing::info!(stream = %self.tag, "{}", quote_command(&self.config.ffmpeg, &args));

        let mut child = match Command::new(&self.config.ffmpeg)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
        {
            Ok(child) => child,
            Err(err) => {
                tracing::error!(stream = %self.tag, %err, "failed to spawn ffmpeg");
                return;
            }
        };

        let Some(pid) = child.id() else {
            tracing::error!(stream = %self.tag, "spawned ffmpeg has no pid");
            return;
        };

        st.next_generation += 1;
        let coder = Coder {
            pid: Pid::from_raw(pid as i32),
            generation: st.next_generation,
        };
        st.coder = Some(coder);

        let Some(me) = self.weak.upgrade() else { return };
        if let Some(stdout) = child.stdout.take() {
            tokio::spawn(me.clone().monitor_stdout(stdout, coder));
        }
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(drain_stderr(stderr, self.tag.clone()));
        }
        tokio::spawn(me.monitor_exit(child, coder));
    }

    /// One-shot fragmented-MP4 transcode streamed straight from stdout.
    pub(super) async fn transcode_full_video(&self) -> Response {
        let mut args = self.transcode_args(0.0, false);
        args.extend(
            [
                "-movflags",
                "frag_keyframe+empty_moov+faststart",
                "-f",
                "mp4",
                "pipe:1",
            ]
            .map(String::from),
        );

        tracing::info!(stream = %self.tag, "{}", quote_command(&self.config.ffmpeg, &args));

        let mut child = match Command::new(&self.config.ffmpeg)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
        {
            Ok(child) => child,
            Err(err) => {
                tracing::error!(stream = %self.tag, %err, "failed to spawn ffmpeg");
                return StatusCode::INTERNAL_SERVER_ERROR.into_response();
            }
        };

        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(drain_stderr(stderr, self.tag.clone()));
        }
        let Some(stdout) = child.stdout.take() else {
            return StatusCode::INTERNAL_SERVER_ERROR.into_response();
        };

        (
            [(header::CONTENT_TYPE, "video/mp4")],
            Body::from_stream(ChildStream::new(child, stdout)),
        )
            .into_response()
    }

    /// Shared ffmpeg argument prefix: seek, hwaccel, input, filter chain,
    /// encoder and audio flags. Segmenting or container flags are appended
    /// by the caller.
    pub(super) fn transcode_args(&self, start_at: f64, is_hls: bool) -> Vec<String> {
        let c = &self.config;
        let probe = &self.source.probe;

        let mut args: Vec<String> = vec!["-loglevel".to_string(), "warning".to_string()];

        if start_at > 0.0 {
            args.extend(["-ss".to_string(), format!("{:.6}", start_at)]);
        }

        let encoder = if c.vaapi {
            ENCODER_VAAPI
        } else if c.nvenc {
            ENCODER_NVENC
        } else {
            ENCODER_X264
        };

        if c.vaapi {
            args.extend(
                "-hwaccel vaapi -hwaccel_device /dev/dri/renderD128 \
                 -init_hw_device vaapi=/dev/dri/renderD128 -hwaccel_output_format vaapi"
                    .split_whitespace()
                    .map(String::from),
            );
        } else if c.nvenc {
            args.extend(["-hwaccel".to_string(), "cuda".to_string()]);
        }

        // autorotation copies the sidecar rotation into the output and does
        // not work for HLS output or some hardware paths, so it is disabled
        // whenever the manual transpose takes over
        if c.use_transpose {
            args.push("-noautorotate".to_string());
        }

        args.extend([
            "-i".to_string(),
            self.source.path.clone(),
            "-copyts".to_string(),
            "-fflags".to_string(),
            "+genpts".to_string(),
        ]);

        // filter chain: pixel-format normalization, scaler, optional
        // manual transpose
        let mut format = "format=nv12".to_string();
        let mut scaler = "scale".to_string();
        let mut scaler_args = vec!["force_original_aspect_ratio=decrease".to_string()];

        if encoder == ENCODER_VAAPI {
            format = "format=nv12|vaapi,hwupload".to_string();
            scaler = "scale_vaapi".to_string();
            scaler_args.push("format=nv12".to_string());
        } else if encoder == ENCODER_NVENC {
            format = "format=nv12|cuda,hwupload".to_string();
            scaler = format!("scale_{}", c.nvenc_scale);
            if c.nvenc_scale == "cuda" {
                // force scale_cuda to examine every input frame
                scaler_args.push("passthrough=0".to_string());
            }
        }

        if self.spec.quality != QUALITY_MAX {
            let max_dim = self.spec.width.max(self.spec.height);
            scaler_args.push(format!("w={}", max_dim));
            scaler_args.push(format!("h={}", max_dim));
        }

        let mut filter = format!("{},{}={}", format, scaler, scaler_args.join(":"));

        if is_hls && c.use_transpose {
            let mut transposer = match encoder {
                ENCODER_VAAPI => "transpose_vaapi".to_string(),
                ENCODER_NVENC => format!("transpose_{}", c.nvenc_scale),
                _ => "transpose".to_string(),
            };

            let force_sw = transposer != "transpose"
                && (c.force_sw_transpose || transposer == "transpose_cuda");
            if force_sw {
                transposer = "transpose".to_string();
            }

            let transpose = match probe.rotation {
                -90 => format!("{}=1", transposer),
                90 => format!("{}=2", transposer),
                180 | -180 => format!("{}=1,{}=1", transposer, transposer),
                _ => String::new(),
            };

            if !transpose.is_empty() {
                if force_sw {
                    // download, rotate on the CPU, upload back for encoding
                    filter = format!("{},hwdownload,format=nv12,{},{}", filter, transpose, format);
                } else {
                    filter = format!("{},{}", filter, transpose);
                }
            }
        }

        args.extend(["-vf".to_string(), filter]);

        args.extend([
            "-map".to_string(),
            "0:v:0".to_string(),
            "-c:v".to_string(),
            encoder.to_string(),
        ]);

        match encoder {
            ENCODER_VAAPI => {
                args.extend(["-global_quality".to_string(), c.qf.to_string()]);
                if c.vaapi_low_power {
                    args.extend(["-low_power".to_string(), "1".to_string()]);
                }
            }
            ENCODER_NVENC => {
                args.extend(
                    ["-preset", "p6", "-tune", "ll", "-rc", "vbr", "-rc-lookahead", "30"]
                        .map(String::from),
                );
                args.extend(["-cq".to_string(), c.qf.to_string()]);
                if c.nvenc_temporal_aq {
                    args.extend(["-temporal-aq".to_string(), "1".to_string()]);
                }
            }
            _ => {
                args.extend([
                    "-preset".to_string(),
                    "faster".to_string(),
                    "-crf".to_string(),
                    c.qf.to_string(),
                ]);
            }
        }

        args.extend([
            "-map".to_string(),
            "0:a:0?".to_string(),
            "-c:a".to_string(),
            "aac".to_string(),
        ]);

        args
    }

    /// Parse the HLS manifest the transcoder writes to stdout. Every line
    /// naming a `.ts` segment marks that chunk done, wakes its waiters and
    /// pauses the coder once the goal is reached. Exits when the coder it
    /// was started for is no longer current.
    async fn monitor_stdout(self: Arc<Self>, stdout: ChildStdout, coder: Coder) {
        let mut lines = BufReader::new(stdout).lines();

        loop {
            let line = match lines.next_line().await {
                Ok(Some(line)) => line,
                _ => break,
            };

            let Some(id) = segment_index(&line) else {
                if line.contains(".ts") {
                    tracing::warn!(stream = %self.tag, %line, "error parsing chunk id");
                }
                continue;
            };

            {
                let mut st = self.state.lock();
                if st.coder.map(|c| c.generation) != Some(coder.generation) {
                    return;
                }

                // the manifest repeats; acknowledge each id once
                if !st.seen_chunks.insert(id) {
                    continue;
                }
                tracing::debug!(stream = %self.tag, id, "recv {}", line);

                let goal = st.goal;
                let chunk = st.chunks.entry(id).or_insert_with(|| Chunk::new(id));
                if !chunk.done {
                    chunk.done = true;
                    chunk.wake_waiters();

                    if id >= goal {
                        tracing::info!(stream = %self.tag, goal, "goal satisfied, pausing");
                        let _ = signal::kill(coder.pid, Signal::SIGSTOP);
                    }
                }
            }
        }
    }

    /// Collect the child's exit status. On a genuine failure, wake every
    /// outstanding waiter; none of their chunks completed, so each resolves
    /// to a conflict or timeout.
    async fn monitor_exit(self: Arc<Self>, mut child: Child, coder: Coder) {
        let status = match child.wait().await {
            Ok(status) => status,
            Err(err) => {
                tracing::error!(stream = %self.tag, %err, "failed to reap ffmpeg");
                return;
            }
        };

        // code() is None when the child died from our own SIGKILL
        let Some(code) = status.code() else { return };
        tracing::info!(stream = %self.tag, code, "ffmpeg exited");

        if code > 0 {
            let mut st = self.state.lock();
            if st.coder.map(|c| c.generation) == Some(coder.generation) {
                for chunk in st.chunks.values_mut() {
                    chunk.wake_waiters();
                }
            }
        }
    }
}

/// Streams a child's stdout through 1 MiB reads; dropping it (EOF or client
/// disconnect) kills and reaps the child.
pub(super) struct ChildStream {
    _child: Child,
    inner: ReaderStream<ChildStdout>,
}

impl ChildStream {
    pub(super) fn new(child: Child, stdout: ChildStdout) -> Self {
        Self {
            _child: child,
            inner: ReaderStream::with_capacity(stdout, FULL_VIDEO_BUF),
        }
    }
}

impl futures::Stream for ChildStream {
    type Item = std::io::Result<Bytes>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        Pin::new(&mut self.inner).poll_next(cx)
    }
}

/// Drain transcoder stderr into the log.
pub(super) async fn drain_stderr(stderr: ChildStderr, tag: String) {
    let mut lines = BufReader::new(stderr).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        tracing::debug!(stream = %tag, "ffmpeg: {}", line);
    }
}

/// Extract the segment index from a manifest line: the digits between the
/// final `-` and the `.ts` extension.
fn segment_index(line: &str) -> Option<i64> {
    static SEGMENT_RE: OnceLock<Regex> = OnceLock::new();
    let re = SEGMENT_RE.get_or_init(|| Regex::new(r"-(\d+)\.ts").expect("segment regex"));
    re.captures(line)?.get(1)?.as_str().parse().ok()
}

/// Render a command line for the log, quoting arguments that contain shell
/// metacharacters.
fn quote_command(program: &str, args: &[String]) -> String {
    const NEEDS_QUOTES: &[char] = &[' ', '=', ':', '"', '\\', '\n', '\t'];
    std::iter::once(program.to_string())
        .chain(args.iter().map(|arg| {
            if arg.contains(NEEDS_QUOTES) {
                format!("\"{}\"", arg)
            } else {
                arg.clone()
            }
        }))
        .collect::<Vec<_>>()
        .join(" ")
}
