use std::sync::Arc;

use hyper::StatusCode;
use log::{debug, info, trace, warn};
use tokio::io::AsyncReadExt as _;
use tokio::io::AsyncWrite;
use tokio::io::AsyncWriteExt as _;

use crate::State;
use crate::cache_store::CacheStore;
use crate::config::ProxyRole;
use crate::error::ProxyCacheError;
use crate::fetch::download_to_cache;
use crate::http_util::content_type_for;
use crate::http_util::response_head;
use crate::http_util::send_error_page;
use crate::http_util::send_response;
use crate::lifecycle::Exchange;
use crate::lifecycle::response_line;
use crate::links::ResultLinks;
use crate::queue::Admission;
use crate::queue::write_package;
use crate::record::CompletionSet;
use crate::record::RequestRecord;
use crate::record::RequestStatus;
use crate::relay::relay;
use crate::web_interface::queued_page;

/// Handles a cacheable request according to the node's role.
///
/// Requests that cannot be cached are relayed unchanged instead.
pub(crate) async fn handle<W>(
    state: &State,
    exchange: &mut Exchange,
    client: &mut W,
) -> Result<(), ProxyCacheError>
where
    W: AsyncWrite + Unpin + ?Sized,
{
    let result = match state.config.role {
        ProxyRole::Local => handle_local(state, exchange, client).await,
        ProxyRole::Remote => handle_remote(state, exchange, client).await,
    };

    match result {
        Err(err) if err.is_fallback() => {
            state.audit.debug(exchange.request_id, &format!("{err}, relaying"));
            relay(
                &exchange.raw_request,
                client,
                state.bandwidth.as_ref(),
                state.config.buffer_size,
            )
            .await?;
            Ok(())
        }
        other => other,
    }
}

fn check_cacheable(record: &RequestRecord) -> Result<(), ProxyCacheError> {
    if CacheStore::is_cacheable(&record.cache_file_name) {
        Ok(())
    } else {
        Err(ProxyCacheError::NotCacheable(record.cache_file_name.clone()))
    }
}

async fn handle_local<W>(
    state: &State,
    exchange: &mut Exchange,
    client: &mut W,
) -> Result<(), ProxyCacheError>
where
    W: AsyncWrite + Unpin + ?Sized,
{
    check_cacheable(&exchange.record)?;

    match state.queue.admit(exchange.record.clone()).await {
        Admission::CacheHit(size) => {
            exchange.record.file_size = size;
            exchange.record.finish(RequestStatus::Completed);
            serve_entry(state, exchange, client).await
        }
        admission => {
            let already = admission == Admission::AlreadyQueued;
            exchange.record.status = RequestStatus::Pending;
            state.audit.debug(
                exchange.request_id,
                if already { "already queued" } else { "queued" },
            );

            let page = queued_page(&exchange.record, already);
            send_response(client, StatusCode::ACCEPTED, "text/html", page.as_bytes()).await?;
            Ok(())
        }
    }
}

async fn handle_remote<W>(
    state: &State,
    exchange: &mut Exchange,
    client: &mut W,
) -> Result<(), ProxyCacheError>
where
    W: AsyncWrite + Unpin + ?Sized,
{
    check_cacheable(&exchange.record)?;

    if let Err(err) =
        download_to_cache(state.fetcher.as_ref(), &state.cache, &mut exchange.record, false).await
    {
        send_error_page(
            client,
            StatusCode::BAD_GATEWAY,
            &format!("Failed to fetch {}", exchange.record.uri()),
        )
        .await?;
        return Err(err);
    }

    if is_search_page(state, exchange.record.uri()) {
        let (children, complete) = fan_out(state, &exchange.record).await;
        state.audit.debug(
            exchange.request_id,
            &format!(
                "fetched {children} result links{}",
                if complete { "" } else { ", timed out waiting" }
            ),
        );
    }

    if let Err(err) = package(state, &exchange.record).await {
        warn!("Failed to package {}:  {err}", exchange.record.uri());
    }

    serve_entry(state, exchange, client).await
}

/// Packages the cache entry of `record`. A redirect stub is packaged along
/// with the entry holding the body it points at.
async fn package(state: &State, record: &RequestRecord) -> Result<(), ProxyCacheError> {
    let packages = &state.config.packages_directory;

    let package = write_package(packages, record).await?;
    trace!("Package ready at `{}`", package.display());

    if let Some(location) = CacheStore::read_redirect_target(&record.cache_file_name).await {
        let resolved = RequestRecord::new(&state.cache, &location, "", record.uri());
        if resolved.cache_file_name != record.cache_file_name {
            let package = write_package(packages, &resolved).await?;
            trace!("Package of redirect target ready at `{}`", package.display());
        }
    }

    Ok(())
}

fn is_search_page(state: &State, uri: &str) -> bool {
    state
        .config
        .search_result_prefixes
        .iter()
        .any(|prefix| uri.starts_with(prefix.as_str()))
}

/// Fetches and packages the result links of the cached search page of
/// `parent` concurrently. Returns the number of links and whether all of
/// them finished within the request timeout.
async fn fan_out(state: &State, parent: &RequestRecord) -> (usize, bool) {
    let Some(page) = CacheStore::read_text(&parent.cache_file_name).await else {
        return (0, true);
    };

    let children: Vec<RequestRecord> =
        ResultLinks::new(&page, &state.cache, &state.blacklist, parent.uri())
            .take(state.config.max_result_links)
            .collect();

    let completion = CompletionSet::new(children.len());

    for (child_number, mut child) in children.into_iter().enumerate() {
        child.attach_completion(Arc::clone(&completion), child_number);
        let state = state.clone();

        tokio::task::spawn(async move {
            // signal completion even if the download panics
            let mut child = scopeguard::guard(child, |child| child.set_done());

            if download_to_cache(state.fetcher.as_ref(), &state.cache, &mut child, false)
                .await
                .is_ok()
                && let Err(err) = package(&state, &child).await
            {
                debug!(
                    "Failed to package result link #{} {}:  {err}",
                    child.child_number(),
                    child.uri()
                );
            }
        });
    }

    let complete = match state.config.request_timeout() {
        Some(timeout) => tokio::time::timeout(timeout, completion.wait())
            .await
            .is_ok(),
        None => {
            completion.wait().await;
            true
        }
    };

    (completion.len(), complete)
}

/// Sends a cache entry to the client. Redirect stubs already are a complete
/// response and go out verbatim.
async fn serve_entry<W>(
    state: &State,
    exchange: &Exchange,
    client: &mut W,
) -> Result<(), ProxyCacheError>
where
    W: AsyncWrite + Unpin + ?Sized,
{
    let path = &exchange.record.cache_file_name;
    let mut file = tokio::fs::File::open(path).await?;
    let len = file.metadata().await?.len();

    let mut buf = vec![0; state.config.buffer_size];
    let n = file.read(&mut buf).await?;

    if CacheStore::is_redirect_stub(&buf[..n]) {
        client.write_all(&buf[..n]).await?;
        tokio::io::copy(&mut file, client).await?;
        client.flush().await?;
        return Ok(());
    }

    let head = response_head(
        StatusCode::OK,
        content_type_for(path),
        &[("Content-Length", len.to_string())],
    );
    client.write_all(head.as_bytes()).await?;

    if !exchange.head_only() {
        client.write_all(&buf[..n]).await?;
        tokio::io::copy(&mut file, client).await?;
    }

    client.flush().await?;
    Ok(())
}

/// Fulfills the local queue in the background, one round per poll interval.
pub(crate) async fn fulfill_queue(state: State) {
    let mut interval = tokio::time::interval(state.config.queue_poll_interval);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    loop {
        interval.tick().await;

        let completed = fulfill_pending(&state).await;
        if completed > 0 {
            info!(
                "Fulfilled {completed} queued requests, {} entries queued",
                state.queue.len()
            );
        }
    }
}

/// Downloads every pending queue entry, expiring those past the request
/// timeout. Returns the number of completed entries.
pub(crate) async fn fulfill_pending(state: &State) -> usize {
    let timeout = state.config.request_timeout();
    let mut completed = 0;

    for mut record in state.queue.claim_pending() {
        let request_id = state.next_request_id();

        if record.is_timed_out(timeout) {
            record.finish(RequestStatus::Failed);
            state.audit.debug(request_id, &format!("{} timed out", record.uri()));
        } else if download_to_cache(state.fetcher.as_ref(), &state.cache, &mut record, false)
            .await
            .is_ok()
        {
            completed += 1;
        }

        state.queue.update(&record);
        state.audit.message(request_id, &response_line(&record));
    }

    completed
}
