//! Files under `local_root`, served for the `local/` URL prefix without
//! touching the cache.

use futures_util::StreamExt;
use http_body_util::BodyExt;
use hyper::header::{HeaderValue, CONTENT_LENGTH, CONTENT_TYPE};
use hyper::{Response, StatusCode};
use std::path::{Path, PathBuf};
use tracing::{error, info};

use super::{empty_response, text_response, ProxyBody};

/// Resolves `requested` below `base`, refusing anything that escapes it.
/// Returns `None` for missing files as well.
pub fn sanitize_path(base: &Path, requested: &str) -> Option<PathBuf> {
    let relative = requested
        .trim_start_matches('/')
        .split('?')
        .next()
        .unwrap_or("");
    let canon = base.join(relative).canonicalize().ok()?;
    let base = base.canonicalize().unwrap_or_else(|_| base.to_path_buf());
    canon.starts_with(&base).then_some(canon)
}

/// Streams `local_root/<relative>` to the client.
pub async fn serve_local_file(
    local_root: Option<&Path>,
    relative: &str,
    head_only: bool,
) -> Response<ProxyBody> {
    let Some(root) = local_root else {
        error!(path = relative, "local file serving is not configured");
        return text_response(StatusCode::FORBIDDEN, "Local fileserving not configured\n");
    };

    let Some(path) = sanitize_path(root, relative).filter(|p| p.is_file()) else {
        error!(path = relative, root = %root.display(), "local file not found");
        return text_response(StatusCode::NOT_FOUND, "File not found\n");
    };

    let file = match tokio::fs::File::open(&path).await {
        Ok(f) => f,
        Err(e) => {
            error!(path = %path.display(), error = %e, "cannot open local file");
            return empty_response(StatusCode::NOT_FOUND);
        }
    };
    let size = match file.metadata().await {
        Ok(m) => m.len(),
        Err(_) => return empty_response(StatusCode::INTERNAL_SERVER_ERROR),
    };
    info!(path = %path.display(), size, "serving local file");

    let mime = mime_guess::from_path(&path).first_or_octet_stream();
    let mut response = if head_only {
        empty_response(StatusCode::OK)
    } else {
        let stream = tokio_util::io::ReaderStream::new(file);
        let body = http_body_util::StreamBody::new(
            stream.map(|result| result.map(hyper::body::Frame::data)),
        );
        Response::new(BodyExt::boxed(body))
    };

    let headers = response.headers_mut();
    if let Ok(v) = HeaderValue::from_str(mime.as_ref()) {
        headers.insert(CONTENT_TYPE, v);
    }
    headers.insert(CONTENT_LENGTH, HeaderValue::from(size));
    response
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn sanitize_rejects_traversal() {
        let dir = tempdir().unwrap();
        let root = dir.path().join("root");
        std::fs::create_dir_all(root.join("sub")).unwrap();
        std::fs::write(root.join("sub/pkg.tar"), b"x").unwrap();
        std::fs::write(dir.path().join("secret"), b"y").unwrap();

        assert!(sanitize_path(&root, "sub/pkg.tar").is_some());
        assert!(sanitize_path(&root, "/sub/pkg.tar?x=1").is_some());
        assert!(sanitize_path(&root, "../secret").is_none());
        assert!(sanitize_path(&root, "sub/../../secret").is_none());
        assert!(sanitize_path(&root, "missing").is_none());
    }

    #[tokio::test]
    async fn status_codes() {
        let dir = tempdir().unwrap();
        std::fs::write(dir.path().join("hello.txt"), b"hello").unwrap();

        let resp = serve_local_file(None, "hello.txt", false).await;
        assert_eq!(resp.status(), StatusCode::FORBIDDEN);

        let resp = serve_local_file(Some(dir.path()), "nope.txt", false).await;
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);

        let resp = serve_local_file(Some(dir.path()), "hello.txt", false).await;
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(resp.headers()[CONTENT_TYPE], "text/plain");
        assert_eq!(resp.headers()[CONTENT_LENGTH], "5");
        let body = resp.into_body().collect().await.unwrap().to_bytes();
        assert_eq!(body.as_ref(), b"hello");
    }
}
