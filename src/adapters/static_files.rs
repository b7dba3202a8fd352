use std::{convert::TryFrom, path::Path};

use axum::body::Body as AxumBody;
use eyre::WrapErr;
use http::{HeaderValue, header};
use http_body_util::BodyExt;
use hyper::{Request, Response};
use tower::ServiceExt;
use tower_http::services::{ServeDir, ServeFile, fs::ServeFileSystemResponseBody};

use crate::ports::static_files::{StaticFileError, StaticFileResult, StaticFiles};

/// Static file adapter backed by tower-http's `ServeFile` and `ServeDir`.
///
/// Content type, length, `Last-Modified`, conditional requests and `HEAD`
/// are handled by tower-http; this adapter adds the caching policy.
#[derive(Debug, Clone)]
pub struct StaticFileAdapter {
    cache_control: HeaderValue,
}

impl StaticFileAdapter {
    pub fn new(max_age_secs: u64) -> Self {
        let cache_control = HeaderValue::from_str(&format!("public, max-age={max_age_secs}"))
            .unwrap_or_else(|_| HeaderValue::from_static("no-cache"));
        Self { cache_control }
    }

    fn finish(&self, response: Response<ServeFileSystemResponseBody>) -> Response<AxumBody> {
        let (mut parts, body) = response.into_parts();
        if parts.status.is_success() || parts.status == http::StatusCode::NOT_MODIFIED {
            parts
                .headers
                .insert(header::CACHE_CONTROL, self.cache_control.clone());
        }
        let body = AxumBody::new(body.map_err(|e| {
            tracing::error!(error = %e, "Error reading static file body");
            axum::Error::new(e)
        }));
        Response::from_parts(parts, body)
    }
}

impl Default for StaticFileAdapter {
    fn default() -> Self {
        Self::new(86_400)
    }
}

impl StaticFiles for StaticFileAdapter {
    async fn serve_file(
        &self,
        file: &Path,
        req: Request<AxumBody>,
    ) -> StaticFileResult<Response<AxumBody>> {
        match tokio::fs::metadata(file).await {
            Ok(metadata) if metadata.is_file() => {}
            Ok(_) => return Err(StaticFileError::NotFound(file.display().to_string())),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(StaticFileError::NotFound(file.display().to_string()));
            }
            Err(e) => return Err(StaticFileError::IoError(e)),
        }

        let response = ServeFile::new(file)
            .oneshot(req)
            .await
            .wrap_err("ServeFile failed to serve file")
            .map_err(|e| StaticFileError::IoError(std::io::Error::other(e.to_string())))?;

        Ok(self.finish(response))
    }

    async fn serve_dir(
        &self,
        root: &Path,
        path: &str,
        req: Request<AxumBody>,
    ) -> StaticFileResult<Response<AxumBody>> {
        let uri_string = format!("/{}", path.trim_start_matches('/'));
        let uri = hyper::Uri::try_from(uri_string)
            .wrap_err("Failed to parse URI for file serving")
            .map_err(|e| StaticFileError::InvalidPath(e.to_string()))?;

        let (parts, body) = req.into_parts();
        let mut new_req = Request::from_parts(parts, body);
        *new_req.uri_mut() = uri;

        let response = ServeDir::new(root)
            .append_index_html_on_directories(false)
            .oneshot(new_req)
            .await
            .wrap_err("ServeDir failed to serve file")
            .map_err(|e| StaticFileError::IoError(std::io::Error::other(e.to_string())))?;

        if response.status() == http::StatusCode::NOT_FOUND {
            return Err(StaticFileError::NotFound(path.to_string()));
        }
        Ok(self.finish(response))
    }
}
