//! Request-side error taxonomy and the structured error payload.
//!
//! Every failure that reaches the transaction boundary is turned into an
//! [`ErrorPayload`] and rendered in the format the response already declared
//! (HTML unless a handler set JSON or XML before failing). Messages are
//! generic per title; details only go to the server log.
use http::StatusCode;
use serde::Serialize;
use thiserror::Error;

use crate::core::{application::ContextError, controller::ControllerFault};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorTitle {
    Error,
    ScriptError,
    QueryError,
    ViewError,
    BodyError,
    NotFoundError,
}

impl ErrorTitle {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorTitle::Error => "ERROR",
            ErrorTitle::ScriptError => "SCRIPT_ERROR",
            ErrorTitle::QueryError => "QUERY_ERROR",
            ErrorTitle::ViewError => "VIEW_ERROR",
            ErrorTitle::BodyError => "BODY_ERROR",
            ErrorTitle::NotFoundError => "NOT_FOUND_ERROR",
        }
    }
}

/// Why a request could not be routed or completed.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum RouteError {
    #[error("No route for '{path}'")]
    NotFound { path: String },

    /// Not a failure: the path names a directory and lacks its trailing slash
    #[error("Redirect to '{location}'")]
    Redirect { location: String },

    #[error(transparent)]
    Fault(#[from] ControllerFault),

    #[error(transparent)]
    Context(#[from] ContextError),
}

/// Output format of an error payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorFormat {
    Html,
    Json,
    Xml,
}

impl ErrorFormat {
    /// Pick the format from the content type a handler already set, if any.
    pub fn from_content_type(content_type: Option<&str>) -> Self {
        let Some(content_type) = content_type else {
            return ErrorFormat::Html;
        };
        let mime = content_type
            .split(';')
            .next()
            .unwrap_or_default()
            .trim()
            .to_ascii_lowercase();
        if mime == "application/json" || mime.ends_with("+json") {
            ErrorFormat::Json
        } else if mime == "application/xml" || mime == "text/xml" || mime.ends_with("+xml") {
            ErrorFormat::Xml
        } else {
            ErrorFormat::Html
        }
    }

    pub fn content_type(&self) -> &'static str {
        match self {
            ErrorFormat::Html => "text/html; charset=utf-8",
            ErrorFormat::Json => "application/json",
            ErrorFormat::Xml => "application/xml; charset=utf-8",
        }
    }
}

/// `{status, title, message}` as sent to the client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ErrorPayload {
    pub status: u16,
    pub title: ErrorTitle,
    pub message: String,
}

impl ErrorPayload {
    pub fn new(status: StatusCode, title: ErrorTitle, message: impl Into<String>) -> Self {
        Self {
            status: status.as_u16(),
            title,
            message: message.into(),
        }
    }

    pub fn not_found(path: &str) -> Self {
        Self::new(
            StatusCode::NOT_FOUND,
            ErrorTitle::NotFoundError,
            format!("No resource is available at '{path}'"),
        )
    }

    pub fn from_fault(fault: &ControllerFault) -> Self {
        let title = fault.title();
        let message = match fault {
            ControllerFault::Body(detail) => format!("The request body was rejected: {detail}"),
            ControllerFault::NotFound(_) => "The requested resource does not exist".to_string(),
            _ => match title {
                ErrorTitle::ScriptError => "The script controller failed to complete".to_string(),
                ErrorTitle::ViewError => "The view could not be rendered".to_string(),
                ErrorTitle::QueryError => "A query issued by the controller failed".to_string(),
                _ => "The request could not be completed".to_string(),
            },
        };
        Self::new(fault.status(), title, message)
    }

    pub fn from_route_error(error: &RouteError, path: &str) -> Self {
        match error {
            RouteError::NotFound { .. } | RouteError::Redirect { .. } => Self::not_found(path),
            RouteError::Fault(fault) => Self::from_fault(fault),
            RouteError::Context(_) => Self::new(
                StatusCode::INTERNAL_SERVER_ERROR,
                ErrorTitle::Error,
                "The application is not available",
            ),
        }
    }

    pub fn status_code(&self) -> StatusCode {
        StatusCode::from_u16(self.status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR)
    }

    pub fn render(&self, format: ErrorFormat) -> String {
        match format {
            ErrorFormat::Json => serde_json::to_string(self).unwrap_or_else(|_| {
                format!(
                    r#"{{"status":{},"title":"{}","message":""}}"#,
                    self.status,
                    self.title.as_str()
                )
            }),
            ErrorFormat::Xml => format!(
                "<?xml version=\"1.0\" encoding=\"UTF-8\"?>\n<error><status>{}</status><title>{}</title><message>{}</message></error>",
                self.status,
                self.title.as_str(),
                html_escape::encode_text(&self.message)
            ),
            ErrorFormat::Html => {
                let reason = self
                    .status_code()
                    .canonical_reason()
                    .unwrap_or("Error");
                format!(
                    "<!DOCTYPE html>\n<html>\n<head><title>{status} {reason}</title></head>\n<body>\n<h1>{status} {title}</h1>\n<p>{message}</p>\n</body>\n</html>\n",
                    status = self.status,
                    title = self.title.as_str(),
                    message = html_escape::encode_text(&self.message),
                )
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_negotiation() {
        assert_eq!(ErrorFormat::from_content_type(None), ErrorFormat::Html);
        assert_eq!(
            ErrorFormat::from_content_type(Some("application/json; charset=utf-8")),
            ErrorFormat::Json
        );
        assert_eq!(
            ErrorFormat::from_content_type(Some("application/atom+xml")),
            ErrorFormat::Xml
        );
        assert_eq!(
            ErrorFormat::from_content_type(Some("text/plain")),
            ErrorFormat::Html
        );
    }

    #[test]
    fn test_script_fault_message_is_generic() {
        let fault = ControllerFault::Script("line 3: undefined variable `secret_token`".into());
        let payload = ErrorPayload::from_fault(&fault);
        assert_eq!(payload.status, 500);
        assert_eq!(payload.title, ErrorTitle::ScriptError);

        let html = payload.render(ErrorFormat::Html);
        assert!(html.contains("SCRIPT_ERROR"));
        assert!(!html.contains("secret_token"));
    }

    #[test]
    fn test_renderings_escape_and_serialize() {
        let payload = ErrorPayload::not_found("/shop/<script>");
        let html = payload.render(ErrorFormat::Html);
        assert!(html.contains("&lt;script&gt;"));
        assert!(!html.contains("<script>"));

        let json: serde_json::Value =
            serde_json::from_str(&payload.render(ErrorFormat::Json)).unwrap();
        assert_eq!(json["status"], 404);
        assert_eq!(json["title"], "NOT_FOUND_ERROR");

        let xml = payload.render(ErrorFormat::Xml);
        let parsed = xmltree::Element::parse(xml.as_bytes()).unwrap();
        assert_eq!(
            parsed.get_child("title").and_then(|t| t.get_text()).as_deref(),
            Some("NOT_FOUND_ERROR")
        );
    }

    #[test]
    fn test_body_fault_is_not_acceptable() {
        let payload = ErrorPayload::from_fault(&ControllerFault::Body("text/csv".into()));
        assert_eq!(payload.status, 406);
        assert_eq!(payload.title, ErrorTitle::BodyError);
    }
}
