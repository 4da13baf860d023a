use std::path::Path;
use std::time::Duration;

use bytes::Bytes;
use futures_util::FutureExt as _;
use futures_util::future::BoxFuture;
use http_body_util::BodyExt as _;
use http_body_util::combinators::BoxBody;
use hyper::Request;
use hyper::Response;
use hyper::Uri;
use hyper::body::Incoming;
use hyper::header::HOST;
use hyper::header::LOCATION;
use hyper::header::REFERER;
use hyper::header::USER_AGENT;
#[cfg(feature = "tls_rustls")]
use hyper_rustls::{ConfigBuilderExt as _, HttpsConnector};
#[cfg(all(feature = "tls_default", not(feature = "tls_rustls")))]
use hyper_tls::HttpsConnector;
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::rt::TokioIo;
use log::debug;
use log::info;
use log::trace;
use log::warn;
use tokio::io::AsyncWriteExt as _;
use tokio::io::BufWriter;

use crate::APP_USER_AGENT;
use crate::cache_store::CacheSlot;
use crate::cache_store::CacheStore;
use crate::empty;
use crate::error::ProxyCacheError;
use crate::humanfmt::HumanFmt;
use crate::record::RequestRecord;
use crate::record::RequestStatus;
use crate::uri_path::HashPath;
use crate::uri_path::to_file_path;

type Client = hyper_util::client::legacy::Client<
    hyper_timeout::TimeoutConnector<HttpsConnector<HttpConnector>>,
    BoxBody<Bytes, ProxyCacheError>,
>;

/// Size of the writes used to persist a response body.
const DOWNLOAD_CHUNK_SIZE: usize = 32;

/// Body and final location of a successful upstream response.
pub(crate) struct FetchResponse {
    /// The URI the body was actually served from, after redirects.
    pub(crate) resolved_uri: String,
    pub(crate) body: BoxBody<Bytes, ProxyCacheError>,
}

impl std::fmt::Debug for FetchResponse {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FetchResponse")
            .field("resolved_uri", &self.resolved_uri)
            .finish_non_exhaustive()
    }
}

/// Source of upstream content.
pub(crate) trait Fetcher: Send + Sync {
    /// Issues a GET for `uri`, following at most one redirect. Non-success
    /// statuses are errors.
    fn fetch<'a>(
        &'a self,
        uri: &'a str,
        referer: &'a str,
    ) -> BoxFuture<'a, Result<FetchResponse, ProxyCacheError>>;
}

/// Fetches over HTTP or HTTPS, either directly or through an upstream proxy.
pub(crate) struct HttpFetcher {
    client: Client,
    gateway: Option<String>,
    timeout: Option<Duration>,
}

impl HttpFetcher {
    #[must_use]
    pub(crate) fn new(timeout: Option<Duration>, gateway: Option<String>) -> Self {
        let mut timeout_connector = hyper_timeout::TimeoutConnector::new(https_connector());
        debug!("Using http timeout of {timeout:?}");
        timeout_connector.set_connect_timeout(timeout);
        timeout_connector.set_read_timeout(timeout);
        timeout_connector.set_write_timeout(timeout);

        let client =
            hyper_util::client::legacy::Client::builder(hyper_util::rt::TokioExecutor::new())
                .build(timeout_connector);

        Self {
            client,
            gateway,
            timeout,
        }
    }

    async fn send(&self, uri: &Uri, referer: &str) -> Result<Response<Incoming>, ProxyCacheError> {
        let mut builder = Request::get(uri.clone()).header(USER_AGENT, APP_USER_AGENT);
        if !referer.is_empty() {
            builder = builder.header(REFERER, referer);
        }

        match &self.gateway {
            None => Ok(request_with_retry(&self.client, builder.body(empty())?).await?),
            Some(gateway) => {
                if let Some(authority) = uri.authority() {
                    builder = builder.header(HOST, authority.as_str());
                }
                let request = builder.body(empty())?;

                match self.timeout {
                    Some(timeout) => {
                        tokio::time::timeout(timeout, send_via_gateway(gateway, request))
                            .await
                            .map_err(|_elapsed| ProxyCacheError::Timeout(timeout))?
                    }
                    None => send_via_gateway(gateway, request).await,
                }
            }
        }
    }

    async fn fetch_uri(&self, uri: &str, referer: &str) -> Result<FetchResponse, ProxyCacheError> {
        let requested = uri
            .parse::<Uri>()
            .map_err(|_err| ProxyCacheError::InvalidUri(uri.to_string()))?;

        let mut resolved_uri = uri.to_string();
        let mut response = self.send(&requested, referer).await?;

        if response.status().is_redirection()
            && let Some(location) = response.headers().get(LOCATION)
            && let Ok(location) = location.to_str()
        {
            let target = resolve_location(&requested, location)?;
            debug!("Following redirect from {uri} to {target}");
            resolved_uri = target.to_string();
            response = self.send(&target, referer).await?;
        }

        if !response.status().is_success() {
            return Err(ProxyCacheError::UpstreamStatus(
                response.status(),
                resolved_uri,
            ));
        }

        Ok(FetchResponse {
            resolved_uri,
            body: response.into_body().map_err(ProxyCacheError::Hyper).boxed(),
        })
    }
}

#[cfg(all(feature = "tls_default", not(feature = "tls_rustls")))]
fn https_connector() -> HttpsConnector<HttpConnector> {
    HttpsConnector::new()
}

#[cfg(feature = "tls_rustls")]
fn https_connector() -> HttpsConnector<HttpConnector> {
    /* Set a process wide default crypto provider. */
    let _ = rustls::crypto::aws_lc_rs::default_provider().install_default();

    let tls_cfg = match rustls::ClientConfig::builder().with_native_roots() {
        Ok(builder) => builder.with_no_client_auth(),
        Err(err) => {
            warn!("No native root certificates, https fetches will fail:  {err}");
            rustls::ClientConfig::builder()
                .with_root_certificates(rustls::RootCertStore::empty())
                .with_no_client_auth()
        }
    };

    hyper_rustls::HttpsConnectorBuilder::new()
        .with_tls_config(tls_cfg)
        .https_or_http()
        .enable_http1()
        .build()
}

impl Fetcher for HttpFetcher {
    fn fetch<'a>(
        &'a self,
        uri: &'a str,
        referer: &'a str,
    ) -> BoxFuture<'a, Result<FetchResponse, ProxyCacheError>> {
        self.fetch_uri(uri, referer).boxed()
    }
}

/// Sends an absolute-form request to an upstream proxy over a fresh connection.
async fn send_via_gateway(
    gateway: &str,
    request: Request<BoxBody<Bytes, ProxyCacheError>>,
) -> Result<Response<Incoming>, ProxyCacheError> {
    let stream = tokio::net::TcpStream::connect(gateway).await?;
    let (mut sender, conn) = hyper::client::conn::http1::handshake(TokioIo::new(stream)).await?;

    tokio::task::spawn(async move {
        if let Err(err) = conn.await {
            debug!("Gateway connection closed:  {err}");
        }
    });

    Ok(sender.send_request(request).await?)
}

async fn request_with_retry(
    client: &Client,
    request: Request<BoxBody<Bytes, ProxyCacheError>>,
) -> Result<Response<Incoming>, hyper_util::client::legacy::Error> {
    const MAX_RETRIES: u32 = 5;

    let (parts, _body) = request.into_parts();

    let mut tries = 0;
    let mut sleep_prev = 1;
    let mut sleep_curr = 1;

    loop {
        let pre = tokio::time::Instant::now();

        let req_clone = Request::from_parts(parts.clone(), empty());

        match client.request(req_clone).await {
            Ok(response) => return Ok(response),
            Err(err) if !err.is_connect() => {
                debug!("Request of internal client failed:  {err}  --  {err:?}");
                return Err(err);
            }
            Err(err) => {
                if tries >= MAX_RETRIES {
                    return Err(err);
                }

                tries += 1;
                trace!("Connect to {} failed (try {tries}):  {err}", parts.uri);

                tokio::time::sleep_until(pre + Duration::from_secs(sleep_curr)).await;

                let p = sleep_prev;
                sleep_prev = sleep_curr;
                sleep_curr += p;
            }
        }
    }
}

/// Resolves a `Location` header value against the URI that produced it.
fn resolve_location(base: &Uri, location: &str) -> Result<Uri, ProxyCacheError> {
    let invalid = || ProxyCacheError::InvalidUri(location.to_string());

    if let Ok(uri) = location.parse::<Uri>()
        && uri.scheme().is_some()
        && uri.authority().is_some()
    {
        return Ok(uri);
    }

    let scheme = base.scheme_str().unwrap_or("http");
    let authority = base.authority().ok_or_else(invalid)?;

    let target = if let Some(network_path) = location.strip_prefix("//") {
        format!("{scheme}://{network_path}")
    } else if location.starts_with('/') {
        format!("{scheme}://{authority}{location}")
    } else {
        let base_path = base.path();
        let dir = base_path.rsplit_once('/').map_or("", |(dir, _)| dir);
        format!("{scheme}://{authority}{dir}/{location}")
    };

    target.parse().map_err(|_err| invalid())
}

/// Downloads `record` into its cache entry and returns the entry size.
///
/// An existing non-empty entry is kept unless `force_replace` is set. When the
/// upstream redirects, a redirect stub is left at the original entry and the
/// body is stored under the entry of the resolved URI. A failed download
/// leaves no partial entry behind.
pub(crate) async fn download_to_cache(
    fetcher: &dyn Fetcher,
    cache: &CacheStore,
    record: &mut RequestRecord,
    force_replace: bool,
) -> Result<u64, ProxyCacheError> {
    let start = std::time::Instant::now();
    record.status = RequestStatus::Downloading;

    match fetch_into_cache(fetcher, cache, record, force_replace).await {
        Ok(size) => {
            info!(
                "Cached {} ({}, {})",
                record.uri(),
                HumanFmt::Size(size),
                HumanFmt::Rate(size, start.elapsed())
            );
            record.file_size = size;
            record.finish(RequestStatus::Completed);
            Ok(size)
        }
        Err(err) => {
            warn!("Failed to cache {}:  {err}", record.uri());
            record.finish(RequestStatus::Failed);
            Err(err)
        }
    }
}

async fn fetch_into_cache(
    fetcher: &dyn Fetcher,
    cache: &CacheStore,
    record: &RequestRecord,
    force_replace: bool,
) -> Result<u64, ProxyCacheError> {
    let original = &record.cache_file_name;

    if let CacheSlot::Satisfied(size) = CacheStore::prepare(original, force_replace).await? {
        debug!("Cache hit for {} at `{}`", record.uri(), original.display());
        return Ok(size);
    }

    let response = fetcher.fetch(record.uri(), &record.referer_uri).await?;

    let mut target = original.clone();
    if response.resolved_uri != record.uri() {
        let file_name = to_file_path(&response.resolved_uri);
        let resolved = cache.entry_path(&HashPath::from_file_name(&file_name), &file_name);

        if resolved != *original {
            if let Err(err) =
                CacheStore::write_redirect_stub(original, &response.resolved_uri).await
            {
                discard_partial(original).await;
                return Err(err);
            }

            target = resolved;
            if let CacheSlot::Satisfied(size) = CacheStore::prepare(&target, force_replace).await? {
                return Ok(size);
            }
        }
    }

    match store_body(&target, response.body).await {
        Ok(size) => Ok(size),
        Err(err) => {
            discard_partial(&target).await;
            Err(err)
        }
    }
}

async fn store_body(
    path: &Path,
    mut body: BoxBody<Bytes, ProxyCacheError>,
) -> Result<u64, ProxyCacheError> {
    let file = CacheStore::create(path).await?;
    let mut writer = BufWriter::new(file);
    let mut written = 0_u64;

    while let Some(frame) = body.frame().await {
        let Ok(data) = frame?.into_data() else {
            continue;
        };

        for chunk in data.chunks(DOWNLOAD_CHUNK_SIZE) {
            writer.write_all(chunk).await?;
            written += chunk.len() as u64;
        }
    }

    writer.flush().await?;

    Ok(written)
}

async fn discard_partial(path: &Path) {
    if let Err(err) = CacheStore::delete(path).await {
        warn!(
            "Failed to remove partial cache entry `{}`:  {err}",
            path.display()
        );
    }
}
