use std::path::Path;

use axum::body::Body as AxumBody;
use hyper::{Request, Response};
use thiserror::Error;

/// Error type for static file operations
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum StaticFileError {
    /// The resolved file does not exist or is not a regular file
    #[error("File not found: {0}")]
    NotFound(String),

    /// Error when encountering an IO issue
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    /// Error when the request could not be rewritten for the file service
    #[error("Invalid path: {0}")]
    InvalidPath(String),
}

/// Result type for static file operations
pub type StaticFileResult<T> = Result<T, StaticFileError>;

/// StaticFiles defines the port (interface) for streaming files resolved by
/// static route rules
pub trait StaticFiles: Send + Sync + 'static {
    /// Stream a single file
    ///
    /// # Arguments
    /// * `file` - The fully resolved path of the file
    /// * `req` - The original HTTP request (method and conditional headers are honoured)
    ///
    /// # Returns
    /// A future that resolves to the file response with content type, length,
    /// last-modified and caching headers set, or an error
    fn serve_file(
        &self,
        file: &Path,
        req: Request<AxumBody>,
    ) -> impl std::future::Future<Output = StaticFileResult<Response<AxumBody>>> + Send;

    /// Serve a request path from a directory
    fn serve_dir(
        &self,
        root: &Path,
        path: &str,
        req: Request<AxumBody>,
    ) -> impl std::future::Future<Output = StaticFileResult<Response<AxumBody>>> + Send;
}
