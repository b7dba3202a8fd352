//! Conversion of raw request bodies into [`RequestBody`] by `Content-Type`.
use axum::{
    body::Body as AxumBody,
    extract::{FromRequest, Multipart},
};
use bytes::Bytes;
use http::{HeaderMap, Request, header::CONTENT_TYPE};

use crate::core::controller::{ControllerFault, MultipartPart, RequestBody};

/// Media type of the request without parameters, lowercased.
fn media_type(headers: &HeaderMap) -> Option<String> {
    let value = headers.get(CONTENT_TYPE)?.to_str().ok()?;
    let essence = value.split(';').next()?.trim().to_ascii_lowercase();
    (!essence.is_empty()).then_some(essence)
}

fn is_xml(media: &str) -> bool {
    media == "application/xml" || media == "text/xml" || media.ends_with("+xml")
}

fn is_json(media: &str) -> bool {
    media == "application/json" || media.ends_with("+json")
}

/// Parse `body` according to the request's `Content-Type`.
///
/// An empty body is always [`RequestBody::Empty`]. A body without a content
/// type is treated as `application/octet-stream`. Any other media type, or a
/// body that does not parse as its declared type, is a `Body` fault.
pub async fn parse_body(headers: &HeaderMap, body: Bytes) -> Result<RequestBody, ControllerFault> {
    if body.is_empty() {
        return Ok(RequestBody::Empty);
    }

    let media = media_type(headers).unwrap_or_else(|| "application/octet-stream".to_string());

    match media.as_str() {
        "application/x-www-form-urlencoded" => Ok(RequestBody::Form(
            url::form_urlencoded::parse(&body).into_owned().collect(),
        )),
        "multipart/form-data" => parse_multipart(headers, body).await,
        "application/octet-stream" => Ok(RequestBody::Binary(body)),
        m if is_xml(m) => xmltree::Element::parse(body.as_ref())
            .map(RequestBody::Xml)
            .map_err(|e| ControllerFault::Body(format!("malformed XML body: {e}"))),
        m if is_json(m) => serde_json::from_slice(&body)
            .map(RequestBody::Json)
            .map_err(|e| ControllerFault::Body(format!("malformed JSON body: {e}"))),
        m if m.starts_with("text/") => String::from_utf8(body.to_vec())
            .map(RequestBody::Text)
            .map_err(|_| ControllerFault::Body("text body is not valid UTF-8".to_string())),
        other => Err(ControllerFault::Body(format!(
            "content type {other} is not supported"
        ))),
    }
}

async fn parse_multipart(headers: &HeaderMap, body: Bytes) -> Result<RequestBody, ControllerFault> {
    let mut request = Request::new(AxumBody::from(body));
    if let Some(content_type) = headers.get(CONTENT_TYPE) {
        request
            .headers_mut()
            .insert(CONTENT_TYPE, content_type.clone());
    }

    let mut multipart = Multipart::from_request(request, &())
        .await
        .map_err(|e| ControllerFault::Body(format!("malformed multipart body: {e}")))?;

    let mut parts = Vec::new();
    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| ControllerFault::Body(format!("malformed multipart body: {e}")))?
    {
        let name = field.name().map(str::to_string);
        let file_name = field.file_name().map(str::to_string);
        let content_type = field.content_type().map(str::to_string);
        let data = field
            .bytes()
            .await
            .map_err(|e| ControllerFault::Body(format!("malformed multipart body: {e}")))?;
        parts.push(MultipartPart {
            name,
            file_name,
            content_type,
            data,
        });
    }
    Ok(RequestBody::Multipart(parts))
}
