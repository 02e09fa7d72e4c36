//! Per-source lifecycle
//!
//! A `Manager` owns everything tied to one (source file, session) pair: the
//! probe result, the quality ladder, the per-quality streams, the temp
//! directory their segments land in, and the idle supervisor that tears the
//! whole thing down and reports back to the handler.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

use crate::config::Config;
use crate::error::Result;
use crate::playlist;
use crate::probe::{probe_file, Probe, CODEC_H264};
use crate::stream::{Stream, QUALITY_MAX};

/// Marker substring identifying uploaded temp files owned by the gateway.
pub const TEMP_FILE_MARKER: &str = "-govod-temp-";

/// Sentinel for the idle counter: the manager is already destroyed.
const DESTROYED: i64 = -1;

/// Shared, immutable facts about the source every stream serves.
pub struct SourceInfo {
    /// Session id from the request URL.
    pub id: String,
    /// Source file path.
    pub path: String,
    /// Directory all segment files for this manager live in.
    pub temp_dir: PathBuf,
    pub probe: Probe,
}

/// Parameters of one quality variant.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QualitySpec {
    pub quality: String,
    pub width: u32,
    pub height: u32,
    /// Bits per second after calibration against the source.
    pub bitrate: u64,
    /// 0 for derived qualities, 1 for the original-resolution stream.
    pub order: u8,
}

pub struct Manager {
    source: Arc<SourceInfo>,
    /// ceil(duration / chunk_size); the media playlist advertises exactly
    /// this many segments.
    num_chunks: i64,
    streams: HashMap<String, Arc<Stream>>,
    inactive: AtomicI64,
    close_tx: mpsc::UnboundedSender<String>,
    idle_ticks: i64,
}

impl Manager {
    /// Probe the source, build the quality ladder and start the stream
    /// supervisors. Fails if the source has no readable video stream.
    pub async fn new(
        config: Arc<Config>,
        path: &str,
        id: &str,
        close_tx: mpsc::UnboundedSender<String>,
    ) -> Result<Arc<Manager>> {
        let temp_dir =
            PathBuf::from(&config.temp_dir).join(format!("{}-{}", id, fnv32a(path)));

        // leftovers from a previous incarnation are stale
        let _ = tokio::fs::remove_dir_all(&temp_dir).await;
        tokio::fs::create_dir_all(&temp_dir).await?;

        let probe = probe_file(&config.ffprobe, path).await?;
        let num_chunks = (probe.duration / config.chunk_size as f64).ceil() as i64;

        let source = Arc::new(SourceInfo {
            id: id.to_string(),
            path: path.to_string(),
            temp_dir,
            probe,
        });

        let mut streams = HashMap::new();
        for spec in build_quality_ladder(&source.probe) {
            let stream = Stream::new(config.clone(), source.clone(), spec);
            streams.insert(stream.quality().to_string(), stream);
        }

        let manager = Arc::new(Manager {
            source,
            num_chunks,
            streams,
            inactive: AtomicI64::new(0),
            close_tx,
            idle_ticks: (config.manager_idle_time / 5).max(1),
        });

        for stream in manager.streams.values() {
            tokio::spawn(stream.clone().run());
        }

        tracing::info!(
            id = %manager.source.id,
            path = %manager.source.path,
            chunks = manager.num_chunks,
            qualities = manager.streams.len(),
            "new manager"
        );

        tokio::spawn(manager.clone().watch_idle());
        Ok(manager)
    }

    pub fn path(&self) -> &str {
        &self.source.path
    }

    /// Idle supervisor: once nothing has transcoded for `manager_idle_time`
    /// the manager destroys itself and emits its id on the close channel.
    async fn watch_idle(self: Arc<Self>) {
        let tick = Duration::from_secs(5);
        let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + tick, tick);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            ticker.tick().await;

            if self.inactive.load(Ordering::SeqCst) == DESTROYED {
                return;
            }

            let ticks = self.inactive.fetch_add(1, Ordering::SeqCst) + 1;
            if ticks == 0 {
                // destroy raced the increment; restore the sentinel
                self.inactive.store(DESTROYED, Ordering::SeqCst);
                return;
            }

            if self.streams.values().any(|s| s.coder_active()) {
                self.inactive.store(0, Ordering::SeqCst);
                continue;
            }

            if ticks >= self.idle_ticks {
                self.destroy();
                let _ = self.close_tx.send(self.source.id.clone());
                return;
            }
        }
    }

    /// Stop all streams and delete everything this manager owns on disk.
    /// Idempotent; does not emit on the close channel.
    pub fn destroy(&self) {
        if self.inactive.swap(DESTROYED, Ordering::SeqCst) == DESTROYED {
            return;
        }
        tracing::info!(id = %self.source.id, "destroying manager");

        for stream in self.streams.values() {
            stream.stop();
        }

        let _ = std::fs::remove_dir_all(&self.source.temp_dir);
        free_if_temp(&self.source.path);
    }

    /// Dispatch on the chunk part of the URL.
    pub async fn serve(&self, chunk: &str, query: &str) -> Response {
        // master list
        if chunk == "index.m3u8" {
            return self.serve_index(query);
        }

        // stream list
        if let Some(quality) = chunk.strip_suffix(".m3u8") {
            if let Some(stream) = self.streams.get(quality) {
                return stream.serve_list(query);
            }
        }

        // stream chunk
        if let Some(name) = chunk.strip_suffix(".ts") {
            let parts: Vec<&str> = name.split('-').collect();
            if parts.len() != 2 {
                return StatusCode::BAD_REQUEST.into_response();
            }
            let Ok(id) = parts[1].parse::<i64>() else {
                return StatusCode::BAD_REQUEST.into_response();
            };
            if let Some(stream) = self.streams.get(parts[0]) {
                return stream.serve_chunk(id).await;
            }
        }

        // full video, falling back to the original quality
        if let Some(quality) = chunk.strip_suffix(".mp4") {
            let stream = self
                .streams
                .get(quality)
                .or_else(|| self.streams.get(QUALITY_MAX));
            if let Some(stream) = stream {
                return stream.serve_full_video().await;
            }
        }

        StatusCode::NOT_FOUND.into_response()
    }

    fn serve_index(&self, query: &str) -> Response {
        let mut variants: Vec<QualitySpec> =
            self.streams.values().map(|s| s.spec().clone()).collect();
        let body =
            playlist::master_playlist(&mut variants, self.source.probe.frame_rate, query);
        playlist::playlist_response(body)
    }
}

/// Delete an uploaded temp file once its manager is done with it.
pub fn free_if_temp(path: &str) {
    if path.contains(TEMP_FILE_MARKER) {
        let _ = std::fs::remove_file(path);
    }
}

/// 32-bit FNV-1a, used to give each source path a stable directory name.
fn fnv32a(s: &str) -> u32 {
    let mut hash: u32 = 0x811c_9dc5;
    for byte in s.as_bytes() {
        hash ^= u32::from(*byte);
        hash = hash.wrapping_mul(0x0100_0193);
    }
    hash
}

/// Reference bitrate for calibration: H.264 sources count at half their
/// stored bitrate, everything else at full, with a 10 Mbps fallback when
/// the probe reported nothing usable.
fn reference_bitrate(probe: &Probe) -> u64 {
    let mut bitrate = probe.bit_rate / 2;
    if probe.codec_name != CODEC_H264 {
        bitrate *= 2;
    }
    if bitrate == 0 {
        bitrate = 10_000_000;
    }
    bitrate
}

/// Build the quality ladder for a probed source.
///
/// Candidate heights carry nominal bitrates which are scaled by the ratio
/// of the reference bitrate to the candidate nearest in pixel count, so the
/// ladder tracks the source's own quality. Candidates that would upscale,
/// exceed 80% of the source bitrate, or land on odd dimensions are dropped.
/// The original resolution is always present as `max`.
pub fn build_quality_ladder(probe: &Probe) -> Vec<QualitySpec> {
    // (height, nominal width, nominal bitrate)
    const CANDIDATES: [(u32, u32, u64); 5] = [
        (480, 854, 400),
        (720, 1280, 700),
        (1080, 1920, 1000),
        (1440, 2560, 1400),
        (2160, 3840, 3000),
    ];

    // height is the short-edge target; the long edge follows the source's
    // aspect ratio
    let (sm, lg) = if probe.height > probe.width {
        (probe.width, probe.height)
    } else {
        (probe.height, probe.width)
    };

    let ref_bitrate = reference_bitrate(probe);

    let orig_pixels = probe.width as f64 * probe.height as f64;
    let nearest = CANDIDATES
        .iter()
        .min_by(|a, b| {
            let da = (orig_pixels - (a.0 * a.1) as f64).abs();
            let db = (orig_pixels - (b.0 * b.1) as f64).abs();
            da.total_cmp(&db)
        })
        .copied()
        .unwrap_or(CANDIDATES[0]);
    let multiplier = ref_bitrate as f64 / nearest.2 as f64;

    let mut specs = Vec::new();
    for (height, _, nominal) in CANDIDATES {
        // no upscaling
        if height >= sm {
            continue;
        }
        let width = (lg as f64 * height as f64 / sm as f64).ceil() as u32;
        if width >= lg {
            continue;
        }

        let bitrate = (nominal as f64 * multiplier).ceil() as u64;
        // cap well below the source bitrate, or transcoding buys nothing
        if bitrate as f64 > probe.bit_rate as f64 * 0.8 {
            continue;
        }
        if height % 2 != 0 || width % 2 != 0 {
            continue;
        }

        specs.push(QualitySpec {
            quality: format!("{}p", height),
            width,
            height,
            bitrate,
            order: 0,
        });
    }

    specs.push(QualitySpec {
        quality: QUALITY_MAX.to_string(),
        width: probe.width,
        height: probe.height,
        bitrate: ref_bitrate,
        order: 1,
    });

    specs
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::StatusCode;

    fn probe(width: u32, height: u32, codec: &str, bit_rate: u64) -> Probe {
        Probe {
            width,
            height,
            duration: 30.0,
            frame_rate: 30,
            codec_name: codec.to_string(),
            bit_rate,
            rotation: 0,
        }
    }

    #[test]
    fn test_fnv32a_vectors() {
        assert_eq!(fnv32a(""), 0x811c_9dc5);
        assert_eq!(fnv32a("a"), 0xe40c_292c);
        assert_eq!(fnv32a("hello"), 0x4f9f_2cab);
    }

    #[test]
    fn test_reference_bitrate() {
        assert_eq!(reference_bitrate(&probe(1920, 1080, "h264", 5_000_000)), 2_500_000);
        assert_eq!(reference_bitrate(&probe(1920, 1080, "hevc", 5_000_000)), 5_000_000);
        assert_eq!(reference_bitrate(&probe(1920, 1080, "h264", 0)), 10_000_000);
    }

    #[test]
    fn test_ladder_1080p_h264() {
        let specs = build_quality_ladder(&probe(1920, 1080, "h264", 5_000_000));

        // 480p and 720p survive, 1080p and up would upscale
        let qualities: Vec<&str> = specs.iter().map(|s| s.quality.as_str()).collect();
        assert_eq!(qualities, vec!["480p", "720p", "max"]);

        // nearest candidate is 1080p (exact pixel match), so the nominal
        // bitrates are scaled by 2_500_000 / 1000
        let p480 = &specs[0];
        assert_eq!((p480.width, p480.height), (854, 480));
        assert_eq!(p480.bitrate, 1_000_000);

        let p720 = &specs[1];
        assert_eq!((p720.width, p720.height), (1280, 720));
        assert_eq!(p720.bitrate, 1_750_000);

        let max = &specs[2];
        assert_eq!(max.quality, "max");
        assert_eq!((max.width, max.height), (1920, 1080));
        assert_eq!(max.bitrate, 2_500_000);
        assert_eq!(max.order, 1);
        assert!(specs[..2].iter().all(|s| s.order == 0));
    }

    #[test]
    fn test_ladder_portrait_source() {
        let specs = build_quality_ladder(&probe(1080, 1920, "h264", 5_000_000));
        let p480 = specs.iter().find(|s| s.quality == "480p").unwrap();
        // the long edge follows the source aspect; width stays the stored
        // larger dimension
        assert_eq!((p480.width, p480.height), (854, 480));

        let max = specs.iter().find(|s| s.quality == "max").unwrap();
        assert_eq!((max.width, max.height), (1080, 1920));
    }

    #[test]
    fn test_ladder_drops_odd_dimensions() {
        // 1900/1080 scaling makes both derived widths odd (845, 1267)
        let specs = build_quality_ladder(&probe(1900, 1080, "h264", 20_000_000));
        let qualities: Vec<&str> = specs.iter().map(|s| s.quality.as_str()).collect();
        assert_eq!(qualities, vec!["max"]);
    }

    #[test]
    fn test_ladder_zero_bitrate_keeps_only_max() {
        // with an unreadable source bitrate the 80% cap eliminates every
        // derived quality, but max always remains at the 10 Mbps fallback
        let specs = build_quality_ladder(&probe(1920, 1080, "h264", 0));
        assert_eq!(specs.len(), 1);
        assert_eq!(specs[0].quality, "max");
        assert_eq!(specs[0].bitrate, 10_000_000);
    }

    #[test]
    fn test_ladder_small_source() {
        // nothing below 480p exists, so only max survives
        let specs = build_quality_ladder(&probe(640, 480, "h264", 2_000_000));
        assert_eq!(specs.len(), 1);
        assert_eq!(specs[0].quality, "max");
    }

    #[test]
    fn test_ladder_4k_source() {
        let specs = build_quality_ladder(&probe(3840, 2160, "hevc", 20_000_000));
        let qualities: Vec<&str> = specs.iter().map(|s| s.quality.as_str()).collect();
        assert_eq!(qualities, vec!["480p", "720p", "1080p", "1440p", "max"]);
        // nearest is the 2160 candidate; scaled from its nominal 3000
        let p1080 = specs.iter().find(|s| s.quality == "1080p").unwrap();
        assert_eq!(p1080.bitrate, (1000.0 * 20_000_000.0 / 3000.0_f64).ceil() as u64);
    }

    fn build_manager(dir: &std::path::Path) -> Arc<Manager> {
        let config = Arc::new(Config::default());
        let source = Arc::new(SourceInfo {
            id: "s1".to_string(),
            path: "/media/v.mp4".to_string(),
            temp_dir: dir.to_path_buf(),
            probe: probe(1920, 1080, "h264", 5_000_000),
        });

        let mut streams = HashMap::new();
        for spec in build_quality_ladder(&source.probe) {
            let stream = Stream::new(config.clone(), source.clone(), spec);
            streams.insert(stream.quality().to_string(), stream);
        }

        let (close_tx, _close_rx) = mpsc::unbounded_channel();
        Arc::new(Manager {
            source,
            num_chunks: 10,
            streams,
            inactive: AtomicI64::new(0),
            close_tx,
            idle_ticks: 12,
        })
    }

    async fn body_text(response: Response) -> String {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        String::from_utf8(bytes.to_vec()).unwrap()
    }

    #[tokio::test]
    async fn test_serve_index_lists_variants() {
        let dir = tempfile::tempdir().unwrap();
        let manager = build_manager(dir.path());

        let response = manager.serve("index.m3u8", "").await;
        assert_eq!(response.status(), StatusCode::OK);

        let body = body_text(response).await;
        assert!(body.starts_with("#EXTM3U\n"));
        // derived qualities first, the original-resolution stream last
        let uris: Vec<&str> = body.lines().filter(|l| l.ends_with(".m3u8")).collect();
        assert_eq!(uris, vec!["480p.m3u8", "720p.m3u8", "max.m3u8"]);
        assert!(body.contains("RESOLUTION=1920x1080"));
    }

    #[tokio::test]
    async fn test_serve_media_playlist() {
        let dir = tempfile::tempdir().unwrap();
        let manager = build_manager(dir.path());

        let response = manager.serve("480p.m3u8", "").await;
        assert_eq!(response.status(), StatusCode::OK);

        let body = body_text(response).await;
        // 30s source at 3s chunks
        assert_eq!(body.lines().filter(|l| l.ends_with(".ts")).count(), 10);
        assert!(body.contains("480p-000000.ts"));
    }

    #[tokio::test]
    async fn test_serve_dispatch_errors() {
        let dir = tempfile::tempdir().unwrap();
        let manager = build_manager(dir.path());

        // unknown quality
        let response = manager.serve("666p.m3u8", "").await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);

        // malformed segment names
        let response = manager.serve("480p-abc.ts", "").await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let response = manager.serve("480p-1-2.ts", "").await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);

        // not a recognized suffix
        let response = manager.serve("thumbnail.png", "").await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_destroy_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let segments = dir.path().join("seg");
        std::fs::create_dir_all(&segments).unwrap();
        let manager = build_manager(&segments);

        manager.destroy();
        assert!(!segments.exists());
        assert_eq!(manager.inactive.load(Ordering::SeqCst), DESTROYED);

        // a second call is a no-op
        manager.destroy();
    }

    #[test]
    fn test_free_if_temp() {
        let dir = tempfile::tempdir().unwrap();
        let temp = dir.path().join("abc-govod-temp-xyz");
        let keep = dir.path().join("movie.mp4");
        std::fs::write(&temp, b"x").unwrap();
        std::fs::write(&keep, b"x").unwrap();

        free_if_temp(&temp.to_string_lossy());
        free_if_temp(&keep.to_string_lossy());

        assert!(!temp.exists());
        assert!(keep.exists());
    }
}
