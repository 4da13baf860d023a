use std::collections::HashMap;
use std::net::IpAddr;
use std::path::Path;

use hyper::StatusCode;
use log::{debug, info, trace, warn};
use time::OffsetDateTime;
use time::format_description::well_known::Rfc3339;
use tokio::io::AsyncRead;
use tokio::io::AsyncReadExt as _;
use tokio::io::AsyncWrite;
use tokio::io::AsyncWriteExt as _;

use crate::State;
use crate::audit::timestamp;
use crate::config::ProxyRole;
use crate::error::ProxyCacheError;
use crate::http_util::header_value;
use crate::http_util::is_valid_uri;
use crate::http_util::request_method;
use crate::http_util::request_target;
use crate::http_util::send_error_page;
use crate::record::RequestRecord;
use crate::record::RequestStatus;
use crate::relay::relay;
use crate::role;
use crate::web_interface::serve_admin;

/// Origin under which the administrative pages are reachable through the proxy.
pub(crate) const ADMIN_ORIGIN: &str = "http://www.ruralcafe.net";

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum AdminPage {
    Home,
    Eta,
    Queue,
    Search,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum Classification {
    Admin(AdminPage),
    Content,
}

#[must_use]
pub(crate) fn classify(uri: &str) -> Classification {
    let Some(path) = uri.strip_prefix(ADMIN_ORIGIN) else {
        return Classification::Content;
    };

    let page = match path {
        "/" => AdminPage::Home,
        p if p.starts_with("/request/eta") => AdminPage::Eta,
        p if p.starts_with("/request/queue") => AdminPage::Queue,
        p if p.starts_with("/request/search") => AdminPage::Search,
        _ => return Classification::Content,
    };

    Classification::Admin(page)
}

/// One cacheable request in flight on a client connection.
#[derive(Debug)]
pub(crate) struct Exchange {
    pub(crate) request_id: u64,
    pub(crate) client: IpAddr,
    pub(crate) method: String,
    pub(crate) record: RequestRecord,
    pub(crate) raw_request: Vec<u8>,
}

impl Exchange {
    #[must_use]
    pub(crate) fn head_only(&self) -> bool {
        self.method.eq_ignore_ascii_case("HEAD")
    }
}

/// Admission line, `startTime client METHOD uri REFERER referer status size`.
#[must_use]
fn admission_line(exchange: &Exchange) -> String {
    let record = &exchange.record;
    format!(
        "{} {} {} {} REFERER {} {} {}",
        timestamp(record.start_time),
        exchange.client,
        exchange.method,
        record.uri(),
        record.referer_uri,
        record.status.code(),
        record.file_size
    )
}

/// Response line, `finishTime RSP uri status size`.
#[must_use]
pub(crate) fn response_line(record: &RequestRecord) -> String {
    format!(
        "{} RSP {} {} {}",
        timestamp(record.finish_time.unwrap_or_else(OffsetDateTime::now_utc)),
        record.uri(),
        record.status.code(),
        record.file_size
    )
}

/// Serves the single request arriving on `stream` and closes it.
pub(crate) async fn handle_connection<S>(state: &State, mut stream: S, client: IpAddr)
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    if !state.config.is_client_allowed(&client) {
        info!("Rejecting client {client} not listed in allowed_proxy_clients");
        if let Err(err) =
            send_error_page(&mut stream, StatusCode::FORBIDDEN, "Client not permitted").await
        {
            debug!("Failed to send rejection to {client}:  {err}");
        }
    } else if let Err(err) = serve_request(state, &mut stream, client).await {
        match err {
            ProxyCacheError::Io(ref ioerr)
                if matches!(
                    ioerr.kind(),
                    std::io::ErrorKind::ConnectionReset | std::io::ErrorKind::BrokenPipe
                ) =>
            {
                info!("Connection to client {client} cancelled");
            }
            _ => warn!("Error serving request from client {client}:  {err}"),
        }
    }

    if let Err(err) = stream.shutdown().await {
        trace!("Failed to shut down connection to {client}:  {err}");
    }
}

async fn serve_request<S>(
    state: &State,
    stream: &mut S,
    client: IpAddr,
) -> Result<(), ProxyCacheError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    // a request that does not arrive in one read is not parsed
    let mut raw = vec![0; state.config.request_buffer_size];
    let n = stream.read(&mut raw).await?;
    raw.truncate(n);

    let text = String::from_utf8_lossy(&raw);
    let target = request_target(&text).ok_or(ProxyCacheError::MalformedRequest)?;
    let method = request_method(&text).unwrap_or_default();

    if !is_valid_uri(target) || !matches!(method, "GET" | "HEAD") {
        debug!("Relaying {method} {target} for {client} without caching");
        let forwarded = relay(
            &raw,
            stream,
            state.bandwidth.as_ref(),
            state.config.buffer_size,
        )
        .await?;
        trace!("Relayed {forwarded} bytes for {target}");
        return Ok(());
    }

    if let Classification::Admin(page) = classify(target) {
        return serve_admin(state, page, target, stream).await;
    }

    let referer = header_value(&text, "Referer").unwrap_or_default();
    let mut exchange = Exchange {
        request_id: state.next_request_id(),
        client,
        method: method.to_string(),
        record: RequestRecord::new(&state.cache, target, "", referer),
        raw_request: raw.clone(),
    };

    state
        .audit
        .message(exchange.request_id, &admission_line(&exchange));

    let result = role::handle(state, &mut exchange, stream).await;
    if let Err(err) = &result {
        state
            .audit
            .debug(exchange.request_id, &format!("request failed: {err}"));
    }

    state
        .audit
        .message(exchange.request_id, &response_line(&exchange.record));

    result
}

/// An admission line read back from a messages log.
#[derive(Debug, PartialEq, Eq)]
pub(crate) struct LoggedRequest {
    pub(crate) request_id: u64,
    pub(crate) start_time: OffsetDateTime,
    pub(crate) client: IpAddr,
    pub(crate) method: String,
    pub(crate) uri: String,
    pub(crate) referer: String,
    pub(crate) status: Option<RequestStatus>,
    pub(crate) file_size: u64,
}

impl LoggedRequest {
    /// Parses an admission line; response lines and garbage yield `None`.
    /// Status and size are optional.
    #[must_use]
    pub(crate) fn parse(line: &str) -> Option<Self> {
        let fields: Vec<&str> = line.trim_end().split(' ').collect();
        if fields.len() < 7 || fields[5] != "REFERER" || fields[3].is_empty() {
            return None;
        }

        Some(Self {
            request_id: fields[0].parse().ok()?,
            start_time: OffsetDateTime::parse(fields[1], &Rfc3339).ok()?,
            client: fields[2].parse().ok()?,
            method: fields[3].to_string(),
            uri: fields[4].to_string(),
            referer: fields[6].to_string(),
            status: fields
                .get(7)
                .and_then(|s| s.parse().ok())
                .and_then(RequestStatus::from_code),
            file_size: fields.get(8).and_then(|s| s.parse().ok()).unwrap_or(0),
        })
    }
}

/// Completed response lines, `id finishTime RSP uri 2 size`, keyed by URI.
fn completed_response(line: &str) -> Option<(&str, u64)> {
    let fields: Vec<&str> = line.trim_end().split(' ').collect();
    match fields.as_slice() {
        [_, _, "RSP", uri, status, size]
            if status.parse().ok().and_then(RequestStatus::from_code)
                == Some(RequestStatus::Completed) =>
        {
            Some((*uri, size.parse().ok()?))
        }
        _ => None,
    }
}

/// Rebuilds the state of one logged request and logs it again, so the
/// current messages log can be replayed in turn. Returns whether it was queued.
pub(crate) fn replay_entry(state: &State, entry: &LoggedRequest) -> bool {
    state.resume_request_ids_after(entry.request_id);

    if !is_valid_uri(&entry.uri) || classify(&entry.uri) != Classification::Content {
        return false;
    }

    let mut exchange = Exchange {
        request_id: entry.request_id,
        client: entry.client,
        method: entry.method.clone(),
        record: RequestRecord::new(&state.cache, &entry.uri, "", &entry.referer),
        raw_request: Vec::new(),
    };
    exchange.record.start_time = entry.start_time;

    let queued = if entry.status == Some(RequestStatus::Completed) {
        exchange.record.file_size = entry.file_size;
        exchange.record.finish(RequestStatus::Completed);
        false
    } else {
        match state.config.role {
            ProxyRole::Local => state.queue.enqueue(exchange.record.clone()),
            ProxyRole::Remote => false,
        }
    };

    state
        .audit
        .message(exchange.request_id, &admission_line(&exchange));
    state
        .audit
        .message(exchange.request_id, &response_line(&exchange.record));

    queued
}

/// Replays every admission line of the messages log at `path` and returns
/// the number of requests queued again.
pub(crate) async fn replay_log_file(state: &State, path: &Path) -> Result<usize, ProxyCacheError> {
    let content = tokio::fs::read_to_string(path).await?;

    let completed: HashMap<&str, u64> = content.lines().filter_map(completed_response).collect();

    let mut queued = 0;
    for line in content.lines() {
        let Some(mut entry) = LoggedRequest::parse(line) else {
            trace!("Skipping log line `{line}`");
            continue;
        };

        if let Some(&size) = completed.get(entry.uri.as_str()) {
            entry.status = Some(RequestStatus::Completed);
            entry.file_size = size;
        }

        if replay_entry(state, &entry) {
            queued += 1;
        }
    }

    Ok(queued)
}

#[cfg(test)]
mod tests {
    use std::net::Ipv4Addr;
    use std::sync::Arc;

    use time::macros::datetime;
    use tokio::io::AsyncReadExt as _;
    use tokio::io::AsyncWriteExt as _;

    use super::*;
    use crate::fetch::tests::StubFetcher;

    const CLIENT: IpAddr = IpAddr::V4(Ipv4Addr::new(10, 0, 0, 7));

    fn messages(state: &State) -> Vec<String> {
        std::fs::read_to_string(state.audit.messages_path())
            .unwrap()
            .lines()
            .map(str::to_string)
            .collect()
    }

    async fn exchange(state: &State, request: &str) -> String {
        let (mut client, server) = tokio::io::duplex(64 * 1024);
        client.write_all(request.as_bytes()).await.unwrap();

        handle_connection(state, server, CLIENT).await;

        let mut reply = String::new();
        client.read_to_string(&mut reply).await.unwrap();
        reply
    }

    #[test]
    fn classification() {
        assert_eq!(
            classify("http://www.ruralcafe.net/"),
            Classification::Admin(AdminPage::Home)
        );
        assert_eq!(
            classify("http://www.ruralcafe.net/request/eta?i=1"),
            Classification::Admin(AdminPage::Eta)
        );
        assert_eq!(
            classify("http://www.ruralcafe.net/request/queue?remove=12"),
            Classification::Admin(AdminPage::Queue)
        );
        assert_eq!(
            classify("http://www.ruralcafe.net/request/search?textfield=water"),
            Classification::Admin(AdminPage::Search)
        );
        assert_eq!(classify("http://www.ruralcafe.net/about.html"), Classification::Content);
        assert_eq!(classify("http://example.com/"), Classification::Content);
    }

    #[test]
    fn log_lines_parse_back() {
        let dir = tempfile::tempdir().unwrap();
        let state =
            State::for_tests(dir.path(), ProxyRole::Local, Arc::new(StubFetcher::default()));

        let mut record = RequestRecord::new(&state.cache, "http://example.com/a.html", "", "");
        record.start_time = datetime!(2024-03-05 07:08:09 UTC);
        let exchange = Exchange {
            request_id: 12,
            client: CLIENT,
            method: "GET".to_string(),
            record,
            raw_request: Vec::new(),
        };

        let line = format!("12 {}", admission_line(&exchange));
        assert_eq!(
            line,
            "12 2024-03-05T07:08:09Z 10.0.0.7 GET http://example.com/a.html REFERER  0 0"
        );

        let parsed = LoggedRequest::parse(&line).unwrap();
        assert_eq!(
            parsed,
            LoggedRequest {
                request_id: 12,
                start_time: datetime!(2024-03-05 07:08:09 UTC),
                client: CLIENT,
                method: "GET".to_string(),
                uri: "http://example.com/a.html".to_string(),
                referer: String::new(),
                status: Some(RequestStatus::Pending),
                file_size: 0,
            }
        );
    }

    #[test]
    fn parse_accepts_short_lines_only_when_well_formed() {
        let short = LoggedRequest::parse(
            "3 2024-03-05T07:08:09Z 10.0.0.7 GET http://example.com/ \
             REFERER http://ref.example.com/",
        )
        .unwrap();
        assert_eq!(short.status, None);
        assert_eq!(short.referer, "http://ref.example.com/");

        assert_eq!(
            LoggedRequest::parse("4 2024-03-05T07:08:09Z RSP http://example.com/ 2 10"),
            None
        );
        assert_eq!(LoggedRequest::parse(""), None);
        assert_eq!(
            LoggedRequest::parse(
                "x 2024-03-05T07:08:09Z 10.0.0.7 GET http://example.com/ REFERER  0 0"
            ),
            None
        );
    }

    #[tokio::test]
    async fn admin_requests_are_not_logged() {
        let dir = tempfile::tempdir().unwrap();
        let state =
            State::for_tests(dir.path(), ProxyRole::Local, Arc::new(StubFetcher::default()));

        let reply = exchange(
            &state,
            "GET http://www.ruralcafe.net/ HTTP/1.1\r\nHost: www.ruralcafe.net\r\n\r\n",
        )
        .await;

        assert!(reply.starts_with("HTTP/1.1 200 OK\r\n"));
        assert!(messages(&state).is_empty());
    }

    #[tokio::test]
    async fn content_requests_are_bracketed_by_log_lines() {
        let dir = tempfile::tempdir().unwrap();
        let state =
            State::for_tests(dir.path(), ProxyRole::Local, Arc::new(StubFetcher::default()));

        let reply = exchange(
            &state,
            "GET http://example.com/a.html HTTP/1.1\r\nHost: example.com\r\n\
             Referer: http://example.com/\r\n\r\n",
        )
        .await;
        assert!(reply.starts_with("HTTP/1.1 202 Accepted\r\n"));

        let lines = messages(&state);
        assert_eq!(lines.len(), 2);
        assert!(lines[0].starts_with("1 "));
        assert!(lines[0].ends_with(
            " 10.0.0.7 GET http://example.com/a.html REFERER http://example.com/ 0 0"
        ));
        assert!(lines[1].starts_with("1 "));
        assert!(lines[1].contains(" RSP http://example.com/a.html 0 0"));
        assert_eq!(state.queue.len(), 1);
    }

    #[tokio::test]
    async fn rejected_clients_get_forbidden() {
        let dir = tempfile::tempdir().unwrap();
        let mut state =
            State::for_tests(dir.path(), ProxyRole::Local, Arc::new(StubFetcher::default()));
        let mut config = crate::config::Config::default();
        config.allowed_proxy_clients = vec![crate::config::IpNetOrAddr::Addr(IpAddr::V4(
            Ipv4Addr::new(192, 168, 1, 1),
        ))];
        state.config = Arc::new(config);

        let reply = exchange(&state, "GET http://example.com/ HTTP/1.1\r\n\r\n").await;
        assert!(reply.starts_with("HTTP/1.1 403 Forbidden\r\n"));
        assert!(messages(&state).is_empty());
    }

    #[tokio::test]
    async fn malformed_requests_close_quietly() {
        let dir = tempfile::tempdir().unwrap();
        let state =
            State::for_tests(dir.path(), ProxyRole::Local, Arc::new(StubFetcher::default()));

        let reply = exchange(&state, "garbage").await;
        assert!(reply.is_empty());
        assert!(messages(&state).is_empty());
    }

    #[tokio::test]
    async fn replay_rebuilds_queue() {
        let dir = tempfile::tempdir().unwrap();
        let state =
            State::for_tests(dir.path(), ProxyRole::Local, Arc::new(StubFetcher::default()));

        let log = dir.path().join("previous-messages.log");
        std::fs::write(
            &log,
            "5 2024-03-05T07:08:09Z 10.0.0.7 GET http://example.com/a.html REFERER  0 0\n\
             5 2024-03-05T07:08:09Z RSP http://example.com/a.html 0 0\n\
             6 2024-03-05T07:08:10Z 10.0.0.7 GET http://example.com/b.html REFERER  0 0\n\
             6 2024-03-05T07:08:10Z RSP http://example.com/b.html 0 0\n\
             9 2024-03-05T07:09:00Z RSP http://example.com/b.html 2 17\n\
             7 2024-03-05T07:08:11Z 10.0.0.7 GET http://www.ruralcafe.net/ REFERER  0 0\n\
             not a log line\n",
        )
        .unwrap();

        assert_eq!(replay_log_file(&state, &log).await.unwrap(), 1);

        let queued = state.queue.snapshot();
        assert_eq!(queued.len(), 1);
        assert_eq!(queued[0].uri(), "http://example.com/a.html");
        assert_eq!(queued[0].start_time, datetime!(2024-03-05 07:08:09 UTC));

        let lines = messages(&state);
        assert_eq!(lines.len(), 4);
        assert_eq!(
            lines[0],
            "5 2024-03-05T07:08:09Z 10.0.0.7 GET http://example.com/a.html REFERER  0 0"
        );
        assert!(lines[1].starts_with("5 "));
        assert!(lines[1].ends_with(" RSP http://example.com/a.html 0 0"));
        assert_eq!(
            lines[2],
            "6 2024-03-05T07:08:10Z 10.0.0.7 GET http://example.com/b.html REFERER  2 17"
        );
        assert!(lines[3].starts_with("6 "));
        assert!(lines[3].ends_with(" RSP http://example.com/b.html 2 17"));

        assert_eq!(state.next_request_id(), 8);
    }

    #[tokio::test]
    async fn queued_requests_survive_repeated_restarts() {
        let first_run = tempfile::tempdir().unwrap();
        let log = first_run.path().join("messages.log");
        std::fs::write(
            &log,
            "3 2024-03-05T07:08:09Z 10.0.0.7 GET http://example.com/pending.html REFERER  0 0\n\
             3 2024-03-05T07:08:09Z RSP http://example.com/pending.html 0 0\n",
        )
        .unwrap();

        let second_run = tempfile::tempdir().unwrap();
        let second = State::for_tests(
            second_run.path(),
            ProxyRole::Local,
            Arc::new(StubFetcher::default()),
        );
        assert_eq!(replay_log_file(&second, &log).await.unwrap(), 1);

        let third_run = tempfile::tempdir().unwrap();
        let third = State::for_tests(
            third_run.path(),
            ProxyRole::Local,
            Arc::new(StubFetcher::default()),
        );
        assert_eq!(
            replay_log_file(&third, second.audit.messages_path()).await.unwrap(),
            1
        );

        let queued = third.queue.snapshot();
        assert_eq!(queued.len(), 1);
        assert_eq!(queued[0].uri(), "http://example.com/pending.html");
        assert_eq!(queued[0].start_time, datetime!(2024-03-05 07:08:09 UTC));
    }
}
