//! Source media probing
//!
//! One-shot metadata extraction with ffprobe under a hard deadline. The
//! result is computed once per manager and immutable afterwards.

use serde::Deserialize;
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;

use crate::error::{Result, VodError};

/// Codec name reported by ffprobe for H.264 sources.
pub const CODEC_H264: &str = "h264";

const PROBE_TIMEOUT: Duration = Duration::from_secs(5);

/// Metadata of a source video file.
#[derive(Debug, Clone)]
pub struct Probe {
    pub width: u32,
    pub height: u32,
    /// Duration in seconds.
    pub duration: f64,
    /// Rounded frames per second.
    pub frame_rate: u32,
    pub codec_name: String,
    /// Bits per second.
    pub bit_rate: u64,
    /// Rotation in degrees from display-matrix side data: 0, ±90 or ±180.
    pub rotation: i32,
}

#[derive(Debug, Deserialize)]
struct FfprobeOutput {
    #[serde(default)]
    streams: Vec<FfprobeStream>,
    #[serde(default)]
    format: FfprobeFormat,
}

#[derive(Debug, Default, Deserialize)]
struct FfprobeFormat {
    duration: Option<String>,
}

#[derive(Debug, Deserialize)]
struct FfprobeStream {
    #[serde(default)]
    width: u32,
    #[serde(default)]
    height: u32,
    duration: Option<String>,
    avg_frame_rate: Option<String>,
    codec_name: Option<String>,
    bit_rate: Option<String>,
    #[serde(default)]
    side_data_list: Vec<FfprobeSideData>,
}

#[derive(Debug, Deserialize)]
struct FfprobeSideData {
    side_data_type: Option<String>,
    #[serde(default)]
    rotation: i32,
}

/// Probe a source file. The ffprobe child is killed if the deadline passes.
pub async fn probe_file(ffprobe: &str, path: &str) -> Result<Probe> {
    let mut cmd = Command::new(ffprobe);
    cmd.args([
        "-v",
        "error",
        "-show_entries",
        "format:stream",
        "-select_streams",
        "v",
        "-of",
        "json",
    ])
    .arg(path)
    .stdin(Stdio::null())
    .kill_on_drop(true);

    let output = tokio::time::timeout(PROBE_TIMEOUT, cmd.output())
        .await
        .map_err(|_| VodError::ProbeTimeout)?
        .map_err(VodError::Io)?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(VodError::ProbeFailed(stderr.trim().to_string()));
    }

    parse_probe_output(&output.stdout)
}

fn parse_probe_output(json: &[u8]) -> Result<Probe> {
    let out: FfprobeOutput = serde_json::from_slice(json)?;
    let stream = out.streams.first().ok_or(VodError::NoVideoStream)?;

    // stream duration, else container duration
    let duration = stream
        .duration
        .as_deref()
        .or(out.format.duration.as_deref())
        .and_then(|d| d.parse::<f64>().ok())
        .unwrap_or(0.0);

    let frame_rate = stream
        .avg_frame_rate
        .as_deref()
        .and_then(parse_frame_rate)
        .map(|f| f.round() as u32)
        .unwrap_or(30);

    let bit_rate = stream
        .bit_rate
        .as_deref()
        .and_then(|b| b.parse::<u64>().ok())
        .unwrap_or(5_000_000);

    let rotation = stream
        .side_data_list
        .iter()
        .find(|sd| sd.side_data_type.as_deref() == Some("Display Matrix"))
        .map(|sd| sd.rotation)
        .unwrap_or(0);

    Ok(Probe {
        width: stream.width,
        height: stream.height,
        duration,
        frame_rate,
        codec_name: stream.codec_name.clone().unwrap_or_default(),
        bit_rate,
        rotation,
    })
}

fn parse_frame_rate(rate: &str) -> Option<f64> {
    let (num, den) = rate.split_once('/')?;
    let num: f64 = num.parse().ok()?;
    let den: f64 = den.parse().ok()?;
    if den == 0.0 {
        return None;
    }
    Some(num / den)
}
