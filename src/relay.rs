use std::time::Duration;

use log::debug;
use log::trace;
use tokio::io::AsyncReadExt as _;
use tokio::io::AsyncWrite;
use tokio::io::AsyncWriteExt as _;
use tokio::net::TcpStream;

use crate::bandwidth::BandwidthPolicy;
use crate::error::ProxyCacheError;
use crate::http_util::header_value;

const DEFAULT_HTTP_PORT: u16 = 80;
const BANDWIDTH_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Splits a `Host` header value into host and port, defaulting to port 80.
fn split_host(host: &str) -> Option<(&str, u16)> {
    // bracketed IPv6 literal
    if let Some(rest) = host.strip_prefix('[') {
        let (addr, after) = rest.split_once(']')?;
        let port = match after.strip_prefix(':') {
            Some(port) => port.parse().ok()?,
            None if after.is_empty() => DEFAULT_HTTP_PORT,
            None => return None,
        };
        return Some((addr, port));
    }

    match host.rsplit_once(':') {
        Some((name, port)) if !name.contains(':') => Some((name, port.parse().ok()?)),
        // bare IPv6 literal or no port at all
        _ => Some((host, DEFAULT_HTTP_PORT)),
    }
    .filter(|(name, _)| !name.is_empty())
}

/// Forwards `raw_request` unchanged to the host named in its `Host` header
/// and streams the upstream reply back to `client`.
///
/// The first chunk of the reply is sent immediately; every following chunk
/// waits until `policy` grants downlink bandwidth for it. Returns the number
/// of bytes forwarded to the client. Failing to reach the upstream is an
/// error, a connection dropping midway ends the relay with the bytes
/// forwarded so far.
pub(crate) async fn relay<W>(
    raw_request: &[u8],
    client: &mut W,
    policy: &dyn BandwidthPolicy,
    buffer_size: usize,
) -> Result<u64, ProxyCacheError>
where
    W: AsyncWrite + Unpin + ?Sized,
{
    let text = String::from_utf8_lossy(raw_request);
    let host = header_value(&text, "Host").ok_or(ProxyCacheError::MissingHost)?;
    let (name, port) = split_host(host).ok_or(ProxyCacheError::MissingHost)?;

    let mut upstream = TcpStream::connect((name, port)).await?;
    upstream.write_all(raw_request).await?;

    let mut buf = vec![0; buffer_size];
    let mut forwarded = 0_u64;
    let mut first = true;

    loop {
        let n = match upstream.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => n,
            Err(err) => {
                debug!("Relay read from {name}:{port} interrupted:  {err}");
                break;
            }
        };

        if !first {
            while !policy.has_downlink_bandwidth(n) {
                tokio::time::sleep(BANDWIDTH_POLL_INTERVAL).await;
            }
        }
        first = false;

        if let Err(err) = client.write_all(&buf[..n]).await {
            debug!("Relay write to client interrupted:  {err}");
            break;
        }
        forwarded += n as u64;
    }

    if let Err(err) = client.flush().await {
        trace!("Failed to flush relayed response:  {err}");
    }

    Ok(forwarded)
}
