//! Axum router configuration

use axum::body::Bytes;
use axum::extract::{DefaultBodyLimit, Path, RawQuery, State};
use axum::http::{HeaderMap, Method, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::any;
use axum::Router;
use std::sync::Arc;
use tower_http::trace::TraceLayer;

use super::handler::Handler;

/// Create the router. Every media URL goes through the one wildcard route;
/// the handler does its own dispatch on the path segments.
pub fn create_router(handler: Arc<Handler>) -> Router {
    Router::new()
        .route("/{*path}", any(serve_request))
        .fallback(|| async { StatusCode::BAD_REQUEST })
        // whole source files arrive through the create side channel
        .layer(DefaultBodyLimit::disable())
        .layer(TraceLayer::new_for_http())
        .with_state(handler)
}

async fn serve_request(
    State(handler): State<Arc<Handler>>,
    method: Method,
    RawQuery(query): RawQuery,
    Path(path): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    handler
        .handle(method, &path, query.as_deref(), &headers, &body)
        .await
        .into_response()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use axum::body::Body;
    use axum::http::Request;
    use tower::util::ServiceExt;

    fn test_config(dir: &std::path::Path) -> Config {
        let mut config = Config::default();
        config.temp_dir = dir.join("go-vod").to_string_lossy().into_owned();
        config
    }

    async fn body_json(response: Response) -> serde_json::Value {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn test_short_url_is_bad_request() {
        let dir = tempfile::tempdir().unwrap();
        let app = create_router(Handler::new(test_config(dir.path())));

        let response = app
            .oneshot(Request::get("/only/two").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_root_is_bad_request() {
        let dir = tempfile::tempdir().unwrap();
        let app = create_router(Handler::new(test_config(dir.path())));

        let response = app
            .oneshot(Request::get("/").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_unconfigured_is_service_unavailable() {
        let dir = tempfile::tempdir().unwrap();
        let app = create_router(Handler::new(test_config(dir.path())));

        let response = app
            .oneshot(
                Request::get("/session/media/video.mp4/index.m3u8")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    }

    #[tokio::test]
    async fn test_test_endpoint_reports_version_and_size() {
        let dir = tempfile::tempdir().unwrap();
        let app = create_router(Handler::new(test_config(dir.path())));

        // works even before configuration
        let response = app
            .oneshot(
                Request::get("/session/no/such/file/test")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let json = body_json(response).await;
        assert_eq!(json["version"], super::super::handler::VERSION);
        assert_eq!(json["size"], 0);
    }

    #[tokio::test]
    async fn test_test_endpoint_stats_real_file() {
        let dir = tempfile::tempdir().unwrap();
        let media = dir.path().join("clip.mp4");
        std::fs::write(&media, b"0123456789").unwrap();

        let app = create_router(Handler::new(test_config(dir.path())));
        let uri = format!("/session{}/test", media.display());
        let response = app
            .oneshot(Request::get(uri.as_str()).body(Body::empty()).unwrap())
            .await
            .unwrap();

        let json = body_json(response).await;
        assert_eq!(json["size"], 10);
    }

    #[tokio::test]
    async fn test_config_endpoint_marks_configured() {
        let dir = tempfile::tempdir().unwrap();
        let app = create_router(Handler::new(test_config(dir.path())));

        let response = app
            .clone()
            .oneshot(
                Request::post("/session/any/config")
                    .body(Body::from(r#"{"chunkSize": 4}"#))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        // a media request now gets past the configured gate; with no
        // ffprobe configured, manager construction fails with a 500
        let response = app
            .oneshot(
                Request::get("/session/media/clip.mp4/index.m3u8")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[tokio::test]
    async fn test_config_endpoint_rejects_garbage() {
        let dir = tempfile::tempdir().unwrap();
        let app = create_router(Handler::new(test_config(dir.path())));

        let response = app
            .oneshot(
                Request::post("/session/any/config")
                    .body(Body::from("not json"))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[tokio::test]
    async fn test_version_mismatch_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = test_config(dir.path());
        config.version_monitor = true;
        let handler = Handler::new(config);
        let app = create_router(handler.clone());

        let response = app
            .oneshot(
                Request::get("/session/media/clip.mp4/index.m3u8")
                    .header("X-Go-Vod-Version", "99.99.99")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(handler.exit_code(), 12);
    }

    #[tokio::test]
    async fn test_live_server_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let app = create_router(Handler::new(test_config(dir.path())));

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        let url = format!("http://{}/session/no/file/test", addr);
        let response = reqwest::get(&url).await.unwrap();
        assert_eq!(response.status().as_u16(), 200);

        let json: serde_json::Value = response.json().await.unwrap();
        assert_eq!(json["version"], super::super::handler::VERSION);
        assert_eq!(json["size"], 0);
    }

    #[tokio::test]
    async fn test_create_endpoint_writes_temp_file() {
        let dir = tempfile::tempdir().unwrap();
        let app = create_router(Handler::new(test_config(dir.path())));

        let response = app
            .oneshot(
                Request::post("/session/create/upload.mp4")
                    .body(Body::from("payload"))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let json = body_json(response).await;
        let path = json["path"].as_str().unwrap().to_string();
        assert!(path.contains("-govod-temp-"));
        assert_eq!(std::fs::read(&path).unwrap(), b"payload");
    }
}
