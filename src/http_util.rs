//! Helpers for the raw HTTP/1.x text exchanged with proxy clients.

use std::path::Path;

use hyper::StatusCode;
use hyper::Uri;
use tokio::io::AsyncWrite;
use tokio::io::AsyncWriteExt as _;

use crate::APP_NAME;

/// Method token of the request line.
#[must_use]
pub(crate) fn request_method(raw: &str) -> Option<&str> {
    raw.split_once(' ')
        .map(|(method, _)| method)
        .filter(|method| !method.is_empty())
}

/// Request target, the text between the first two spaces of the request line.
#[must_use]
pub(crate) fn request_target(raw: &str) -> Option<&str> {
    let line = raw.lines().next()?;
    let (_, rest) = line.split_once(' ')?;
    let (target, _) = rest.split_once(' ')?;

    Some(target.trim()).filter(|target| !target.is_empty())
}

/// Trimmed value of the first header line named `name`, matched
/// case-insensitively.
#[must_use]
pub(crate) fn header_value<'a>(raw: &'a str, name: &str) -> Option<&'a str> {
    raw.split("\r\n")
        .skip(1)
        .take_while(|line| !line.is_empty())
        .find_map(|line| {
            let (key, value) = line.split_once(':')?;
            key.trim()
                .eq_ignore_ascii_case(name)
                .then(|| value.trim())
        })
}

/// Whether `uri` is an absolute `http`/`https` URI with a host.
#[must_use]
pub(crate) fn is_valid_uri(uri: &str) -> bool {
    uri.parse::<Uri>().is_ok_and(|uri| {
        matches!(uri.scheme_str(), Some("http" | "https"))
            && uri.host().is_some_and(|host| !host.is_empty())
    })
}

/// Lowercase host of an absolute URI.
#[must_use]
pub(crate) fn uri_host(uri: &str) -> Option<String> {
    let uri = uri.parse::<Uri>().ok()?;
    uri.host().map(str::to_ascii_lowercase)
}

/// Response head in the proxy's fixed layout. Every extra header is written
/// as its own `name: value` line.
#[must_use]
pub(crate) fn response_head(
    status: StatusCode,
    content_type: &str,
    extra_headers: &[(&str, String)],
) -> String {
    let mut head = format!(
        "HTTP/1.1 {} {}\r\nContent-Type: {content_type}\r\n\
         Proxy-Connection: close\r\nServer: {APP_NAME}\r\n",
        status.as_u16(),
        status.canonical_reason().unwrap_or_default()
    );

    for (name, value) in extra_headers {
        head.push_str(name);
        head.push_str(": ");
        head.push_str(value);
        head.push_str("\r\n");
    }

    head.push_str("\r\n");
    head
}

pub(crate) async fn send_response<W>(
    writer: &mut W,
    status: StatusCode,
    content_type: &str,
    body: &[u8],
) -> std::io::Result<()>
where
    W: AsyncWrite + Unpin + ?Sized,
{
    let head = response_head(
        status,
        content_type,
        &[("Content-Length", body.len().to_string())],
    );

    writer.write_all(head.as_bytes()).await?;
    writer.write_all(body).await?;
    writer.flush().await
}

/// Plain-text error page.
pub(crate) async fn send_error_page<W>(
    writer: &mut W,
    status: StatusCode,
    message: &str,
) -> std::io::Result<()>
where
    W: AsyncWrite + Unpin + ?Sized,
{
    let body = format!(
        "{} {}\n{message}\n",
        status.as_u16(),
        status.canonical_reason().unwrap_or_default()
    );

    send_response(writer, status, "text/plain", body.as_bytes()).await
}

/// Content type guessed from the extension of a cache entry.
#[must_use]
pub(crate) fn content_type_for(path: &Path) -> &'static str {
    let extension = path
        .extension()
        .and_then(|ext| ext.to_str())
        .map(str::to_ascii_lowercase);

    match extension.as_deref() {
        Some("html" | "htm") => "text/html",
        Some("css") => "text/css",
        Some("js") => "application/javascript",
        Some("json") => "application/json",
        Some("txt") => "text/plain",
        Some("xml") => "application/xml",
        Some("png") => "image/png",
        Some("jpg" | "jpeg") => "image/jpeg",
        Some("gif") => "image/gif",
        Some("svg") => "image/svg+xml",
        Some("ico") => "image/x-icon",
        Some("pdf") => "application/pdf",
        Some("gz" | "gzip") => "application/gzip",
        _ => "application/octet-stream",
    }
}
