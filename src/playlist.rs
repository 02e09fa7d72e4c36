//! HLS playlist generation
//!
//! Text generators for the master playlist (one variant line per quality)
//! and the per-quality media playlists. Serving either never starts a
//! transcoder; segment URIs simply describe the window a stream will
//! produce on demand.

use axum::http::header;
use axum::response::{IntoResponse, Response};

use crate::manager::QualitySpec;

pub const PLAYLIST_CONTENT_TYPE: &str = "application/x-mpegURL";

/// Wrap playlist text in a response with the HLS content type.
pub fn playlist_response(body: String) -> Response {
    ([(header::CONTENT_TYPE, PLAYLIST_CONTENT_TYPE)], body).into_response()
}

/// Generate the master playlist.
///
/// Variants are listed by `order` ascending, then bitrate ascending, so the
/// derived qualities come first and the original resolution last.
pub fn master_playlist(variants: &mut [QualitySpec], frame_rate: u32, query: &str) -> String {
    variants.sort_by(|a, b| a.order.cmp(&b.order).then(a.bitrate.cmp(&b.bitrate)));

    let mut out = String::from("#EXTM3U\n");
    for v in variants.iter() {
        out.push_str(&format!(
            "#EXT-X-STREAM-INF:BANDWIDTH={},RESOLUTION={}x{},FRAME-RATE={}\n",
            v.bitrate, v.width, v.height, frame_rate
        ));
        out.push_str(&format!("{}.m3u8{}\n", v.quality, query));
    }
    out
}

/// Generate a media playlist for one quality.
///
/// The final segment advertises the remaining duration, so the sum of all
/// `#EXTINF` values equals the probed duration.
pub fn media_playlist(quality: &str, chunk_size: i64, duration_secs: f64, query: &str) -> String {
    let mut out = String::new();
    out.push_str("#EXTM3U\n");
    out.push_str("#EXT-X-VERSION:4\n");
    out.push_str("#EXT-X-MEDIA-SEQUENCE:0\n");
    out.push_str("#EXT-X-PLAYLIST-TYPE:VOD\n");
    out.push_str(&format!("#EXT-X-TARGETDURATION:{}\n", chunk_size));

    let mut remaining = duration_secs;
    let mut id = 0;
    while remaining > 0.0 {
        let size = (chunk_size as f64).min(remaining);
        out.push_str(&format!("#EXTINF:{:.3}, nodesc\n", size));
        out.push_str(&format!("{}-{:06}.ts{}\n", quality, id, query));
        remaining -= chunk_size as f64;
        id += 1;
    }

    out.push_str("#EXT-X-ENDLIST\n");
    out
}
