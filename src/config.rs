use std::net::IpAddr;
use std::net::Ipv6Addr;
use std::num::NonZero;
use std::path::Path;
use std::path::PathBuf;
use std::str::FromStr as _;
use std::time::Duration;

use anyhow::Context as _;
use anyhow::anyhow;
use anyhow::bail;
use ipnet::IpNet;
use log::LevelFilter;
use serde::Deserialize;
use serde::Deserializer;

#[macro_export]
macro_rules! nonzero {
    ($exp:expr) => {
        const {
            match NonZero::new($exp) {
                Some(v) => v,
                None => panic!("Value is zero"),
            }
        }
    };
}

pub(crate) const DEFAULT_BIND_ADDRESS: IpAddr = IpAddr::V6(Ipv6Addr::UNSPECIFIED);
pub(crate) const DEFAULT_BIND_PORT: NonZero<u16> = nonzero!(8080);
pub(crate) const DEFAULT_BUF_SIZE: usize = 4 * 1024; // 4 KiB
pub(crate) const DEFAULT_REQUEST_BUF_SIZE: usize = 8 * 1024; // 8 KiB
pub(crate) const DEFAULT_CACHE_DIR: &str = "/var/cache/splitproxy/cache";
pub(crate) const DEFAULT_PACKAGES_DIR: &str = "/var/cache/splitproxy/packages";
pub(crate) const DEFAULT_LOG_DIR: &str = "/var/log/splitproxy";
pub(crate) const DEFAULT_CONFIGURATION_PATH: &str = "/etc/splitproxy/splitproxy.conf";
pub(crate) const DEFAULT_HTTP_TIMEOUT: Duration = Duration::from_secs(60);
pub(crate) const DEFAULT_REMOTE_REQUEST_TIMEOUT: Duration = Duration::from_secs(180);
pub(crate) const DEFAULT_LOG_LEVEL: LevelFilter = LevelFilter::Info;
pub(crate) const DEFAULT_MAX_CONNECTIONS: NonZero<usize> = nonzero!(256);
pub(crate) const DEFAULT_QUEUE_POLL_INTERVAL: Duration = Duration::from_secs(5);
pub(crate) const DEFAULT_MAX_RESULT_LINKS: usize = 10;
pub(crate) const DEFAULT_SEARCH_RESULT_PREFIX: &str = "http://www.google.com/search";

/// Which half of the split proxy this process runs as.
#[derive(Clone, Copy, Debug, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub(crate) enum ProxyRole {
    /// Runs next to the clients, answers from cache and queues misses.
    Local,
    /// Runs on the well-connected side and fetches on behalf of clients.
    Remote,
}

impl std::fmt::Display for ProxyRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Local => f.write_str("local"),
            Self::Remote => f.write_str("remote"),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub(crate) enum ConfigDomainName {
    Wildcard(String),
    Full(String),
}

impl ConfigDomainName {
    pub(crate) fn new(domain: String) -> Result<Self, String> {
        if is_valid_config_domain(&domain) {
            match domain.strip_prefix('*') {
                Some(d) => Ok(Self::Wildcard(d.to_ascii_lowercase())),
                None => Ok(Self::Full(domain.to_ascii_lowercase())),
            }
        } else {
            Err(domain)
        }
    }

    #[must_use]
    pub(crate) fn matches(&self, host: &str) -> bool {
        match self {
            Self::Wildcard(d) => host.ends_with(d.as_str()),
            Self::Full(d) => host == d,
        }
    }
}

impl<'de> Deserialize<'de> for ConfigDomainName {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        use serde::de::Error as _;
        let s: String = Deserialize::deserialize(deserializer)?;

        Self::new(s)
            .map_err(|s| anyhow!("Invalid configuration domain `{s}`"))
            .map_err(D::Error::custom)
    }
}

#[derive(Debug)]
pub(crate) enum IpNetOrAddr {
    Net(IpNet),
    Addr(IpAddr),
}

impl IpNetOrAddr {
    #[must_use]
    pub(crate) fn contains(&self, ip: &IpAddr) -> bool {
        match self {
            Self::Addr(ipaddr) => ipaddr == ip,
            Self::Net(ipnet) => ipnet.contains(ip),
        }
    }
}

impl<'de> Deserialize<'de> for IpNetOrAddr {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        use serde::de::Error as _;
        let s: String = Deserialize::deserialize(deserializer)?;

        if let Ok(ip) = s.parse::<IpAddr>() {
            return Ok(Self::Addr(ip));
        }

        s.parse::<IpNet>()
            .map(IpNetOrAddr::Net)
            .map_err(D::Error::custom)
    }
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub(crate) struct Config {
    /// Role of this node.
    #[serde(default = "default_role")]
    pub(crate) role: ProxyRole,

    /// Minimum log level severity to output.
    /// Can be overridden via program options.
    #[serde(default = "default_log_level", deserialize_with = "from_level_name")]
    pub(crate) log_level: LevelFilter,

    /// Address to listen on.
    #[serde(default = "default_bind_addr")]
    pub(crate) bind_addr: IpAddr,

    /// Port to listen on.
    #[serde(default = "default_bind_port")]
    pub(crate) bind_port: NonZero<u16>,

    /// Path to cache directory.
    #[serde(default = "default_cache_dir")]
    pub(crate) cache_directory: PathBuf,

    /// Path to the directory holding compressed packages.
    #[serde(default = "default_packages_dir")]
    pub(crate) packages_directory: PathBuf,

    /// Path to the directory receiving the per-run message and debug logs.
    #[serde(default = "default_log_dir")]
    pub(crate) log_directory: PathBuf,

    /// Timeout for outbound http operations.
    #[serde(default = "default_http_timeout", deserialize_with = "from_secs_f32")]
    pub(crate) http_timeout: Duration,

    /// Age after which a queued request counts as timed out.
    /// Unset means infinite for the local role and 180s for the remote role.
    #[serde(default, deserialize_with = "from_opt_secs_f32")]
    pub(crate) request_timeout: Option<Duration>,

    /// Upper bound of the single read taken from a client connection.
    #[serde(
        default = "default_request_buffer_size",
        deserialize_with = "from_usize_with_magnitude"
    )]
    pub(crate) request_buffer_size: usize,

    /// Size of buffer used for relaying and streaming.
    #[serde(
        default = "default_buffer_size",
        deserialize_with = "from_usize_with_magnitude"
    )]
    pub(crate) buffer_size: usize,

    /// Downlink limit of the transparent relay in bytes per second.
    #[serde(default, deserialize_with = "from_nonzero_usize_with_magnitude")]
    pub(crate) downlink_rate: Option<NonZero<usize>>,

    /// Maximum number of connections handled concurrently.
    #[serde(default = "default_max_connections")]
    pub(crate) max_connections: NonZero<usize>,

    /// List of clients permitted to use the proxy.
    /// Empty means all clients are allowed.
    #[serde(default)]
    pub(crate) allowed_proxy_clients: Vec<IpNetOrAddr>,

    /// Domains never fetched or extracted as result links.
    #[serde(default)]
    pub(crate) blacklist: Vec<ConfigDomainName>,

    /// Remote node (`host:port`) used by the local role to fulfill its queue.
    #[serde(default)]
    pub(crate) gateway: Option<String>,

    /// Whether the local role drains its queue in the background.
    #[serde(default = "default_queue_fulfillment")]
    pub(crate) queue_fulfillment: bool,

    #[serde(
        default = "default_queue_poll_interval",
        deserialize_with = "from_secs_f32"
    )]
    pub(crate) queue_poll_interval: Duration,

    /// URI prefixes whose pages are scraped for result links by the remote role.
    #[serde(default = "default_search_result_prefixes")]
    pub(crate) search_result_prefixes: Vec<String>,

    /// Maximum number of result links fetched per search page.
    #[serde(default = "default_max_result_links")]
    pub(crate) max_result_links: usize,
}

fn from_level_name<'de, D>(deserializer: D) -> Result<LevelFilter, D::Error>
where
    D: Deserializer<'de>,
{
    use serde::de::Error as _;
    let s: String = Deserialize::deserialize(deserializer)?;

    LevelFilter::from_str(&s).map_err(D::Error::custom)
}

fn from_secs_f32<'de, D>(deserializer: D) -> Result<Duration, D::Error>
where
    D: Deserializer<'de>,
{
    use serde::de::Error as _;
    let s: f32 = Deserialize::deserialize(deserializer)?;

    Duration::try_from_secs_f32(s).map_err(D::Error::custom)
}

fn from_opt_secs_f32<'de, D>(deserializer: D) -> Result<Option<Duration>, D::Error>
where
    D: Deserializer<'de>,
{
    from_secs_f32(deserializer).map(Some)
}

fn from_usize_with_magnitude<'de, D>(deserializer: D) -> Result<usize, D::Error>
where
    D: Deserializer<'de>,
{
    use serde::de::Error as _;
    let s: String = Deserialize::deserialize(deserializer)?;

    parse_usize_with_magnitude(s.trim()).map_err(D::Error::custom)
}

fn from_nonzero_usize_with_magnitude<'de, D>(
    deserializer: D,
) -> Result<Option<NonZero<usize>>, D::Error>
where
    D: Deserializer<'de>,
{
    use serde::de::Error as _;
    let s: String = Deserialize::deserialize(deserializer)?;

    parse_usize_with_magnitude(s.trim())
        .map(NonZero::new)
        .map_err(D::Error::custom)
}

fn parse_usize_with_magnitude(s: &str) -> anyhow::Result<usize> {
    const MAGNITUDES: [(&str, usize); 6] = [
        ("k", 1000),
        ("Ki", 1024),
        ("M", 1000 * 1000),
        ("Mi", 1024 * 1024),
        ("G", 1000 * 1000 * 1000),
        ("Gi", 1024 * 1024 * 1024),
    ];

    if let Ok(val) = s.parse::<usize>() {
        return Ok(val);
    }

    let Some(x) = s.find(|c| !char::is_ascii_digit(&c)) else {
        bail!("Could not split input");
    };

    let (val, mag) = s.split_at(x);

    let val = val.parse::<usize>()?;
    let mag = mag.trim();

    let Some((_, factor)) = MAGNITUDES.iter().find(|(name, _)| *name == mag) else {
        bail!("Invalid magnitude `{mag}`, expected `k`, `Ki`, `M`, `Mi`, `G` or `Gi`");
    };

    val.checked_mul(*factor)
        .ok_or_else(|| anyhow!("Multiplication overflow"))
}

const fn default_role() -> ProxyRole {
    ProxyRole::Local
}

const fn default_log_level() -> LevelFilter {
    DEFAULT_LOG_LEVEL
}

const fn default_bind_addr() -> IpAddr {
    DEFAULT_BIND_ADDRESS
}

const fn default_bind_port() -> NonZero<u16> {
    DEFAULT_BIND_PORT
}

fn default_cache_dir() -> PathBuf {
    PathBuf::from(DEFAULT_CACHE_DIR)
}

fn default_packages_dir() -> PathBuf {
    PathBuf::from(DEFAULT_PACKAGES_DIR)
}

fn default_log_dir() -> PathBuf {
    PathBuf::from(DEFAULT_LOG_DIR)
}

const fn default_http_timeout() -> Duration {
    DEFAULT_HTTP_TIMEOUT
}

const fn default_request_buffer_size() -> usize {
    DEFAULT_REQUEST_BUF_SIZE
}

const fn default_buffer_size() -> usize {
    DEFAULT_BUF_SIZE
}

const fn default_max_connections() -> NonZero<usize> {
    DEFAULT_MAX_CONNECTIONS
}

const fn default_queue_fulfillment() -> bool {
    true
}

const fn default_queue_poll_interval() -> Duration {
    DEFAULT_QUEUE_POLL_INTERVAL
}

fn default_search_result_prefixes() -> Vec<String> {
    vec![DEFAULT_SEARCH_RESULT_PREFIX.to_string()]
}

const fn default_max_result_links() -> usize {
    DEFAULT_MAX_RESULT_LINKS
}

#[must_use]
pub(crate) fn is_valid_config_domain(domain: &str) -> bool {
    // ASCII labels only; a leading `*` label marks a suffix match.
    let labels = domain.strip_prefix("*.").unwrap_or(domain);

    labels.split('.').all(|label| {
        !label.is_empty()
            && label.len() <= 63
            && !label.starts_with('-')
            && !label.ends_with('-')
            && label.bytes().all(|b| b.is_ascii_alphanumeric() || b == b'-')
    })
}

impl Config {
    pub(crate) fn default() -> Self {
        Self {
            role: ProxyRole::Local,
            log_level: DEFAULT_LOG_LEVEL,
            bind_addr: DEFAULT_BIND_ADDRESS,
            bind_port: DEFAULT_BIND_PORT,
            cache_directory: PathBuf::from(DEFAULT_CACHE_DIR),
            packages_directory: PathBuf::from(DEFAULT_PACKAGES_DIR),
            log_directory: PathBuf::from(DEFAULT_LOG_DIR),
            http_timeout: DEFAULT_HTTP_TIMEOUT,
            request_timeout: None,
            request_buffer_size: DEFAULT_REQUEST_BUF_SIZE,
            buffer_size: DEFAULT_BUF_SIZE,
            downlink_rate: None,
            max_connections: DEFAULT_MAX_CONNECTIONS,
            allowed_proxy_clients: Vec::new(),
            blacklist: Vec::new(),
            gateway: None,
            queue_fulfillment: true,
            queue_poll_interval: DEFAULT_QUEUE_POLL_INTERVAL,
            search_result_prefixes: default_search_result_prefixes(),
            max_result_links: DEFAULT_MAX_RESULT_LINKS,
        }
    }

    pub(crate) fn new(file: &Path) -> anyhow::Result<(Self, bool)> {
        let content = match std::fs::read_to_string(file) {
            Ok(c) => c,
            Err(err)
                if err.kind() == std::io::ErrorKind::NotFound
                    && file == Path::new(DEFAULT_CONFIGURATION_PATH) =>
            {
                return Ok((Self::default(), true));
            }
            Err(err) => {
                return Err(err)
                    .with_context(|| format!("Failed to read file `{}`", file.display()));
            }
        };

        let config = Self::parse(&content)?;

        Ok((config, false))
    }

    fn parse(content: &str) -> anyhow::Result<Self> {
        let mut config: Self = toml::from_str(content).context("Failed to parse configuration")?;

        config.validate()?;

        Ok(config)
    }

    fn validate(&mut self) -> anyhow::Result<()> {
        if self.http_timeout > Duration::from_secs(6 * 60) {
            bail!(
                "Invalid http_timeout value of {}: must be less or equal to 360s",
                self.http_timeout.as_secs_f32()
            );
        }

        if self.buffer_size < 64 || self.buffer_size > 64 * 1024 * 1024 {
            bail!(
                "Invalid buffer_size value of {}: must be in between 64 and 64Mi",
                self.buffer_size
            );
        }

        if self.request_buffer_size < 256 || self.request_buffer_size > 1024 * 1024 {
            bail!(
                "Invalid request_buffer_size value of {}: must be in between 256 and 1Mi",
                self.request_buffer_size
            );
        }

        if self.queue_poll_interval.is_zero() {
            bail!("Invalid queue_poll_interval of 0s");
        }

        if let Some(gateway) = &self.gateway {
            if self.role == ProxyRole::Remote {
                bail!("Option gateway is only supported for the local role");
            }

            if gateway.rsplit_once(':').is_none_or(|(host, port)| {
                host.is_empty() || port.parse::<NonZero<u16>>().is_err()
            }) {
                bail!("Invalid gateway `{gateway}`: expected `host:port`");
            }
        }

        self.blacklist.sort();

        Ok(())
    }

    /// Effective timeout for queued requests, `None` meaning infinite.
    #[must_use]
    pub(crate) fn request_timeout(&self) -> Option<Duration> {
        match (self.request_timeout, self.role) {
            (Some(timeout), _) if timeout.is_zero() => None,
            (Some(timeout), _) => Some(timeout),
            (None, ProxyRole::Local) => None,
            (None, ProxyRole::Remote) => Some(DEFAULT_REMOTE_REQUEST_TIMEOUT),
        }
    }

    /// Timeout for outbound http operations, `None` meaning none.
    #[must_use]
    pub(crate) fn http_timeout(&self) -> Option<Duration> {
        match self.http_timeout {
            x if x.is_zero() => None,
            x => Some(x),
        }
    }

    #[must_use]
    pub(crate) fn is_client_allowed(&self, ip: &IpAddr) -> bool {
        self.allowed_proxy_clients.is_empty()
            || self
                .allowed_proxy_clients
                .iter()
                .any(|ipn| ipn.contains(&ip.to_canonical()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn link_rates_with_magnitude() {
        assert_eq!(parse_usize_with_magnitude("12345").unwrap(), 12_345);
        assert_eq!(parse_usize_with_magnitude("56k").unwrap(), 56_000);
        assert_eq!(parse_usize_with_magnitude("64Ki").unwrap(), 65_536);
        assert_eq!(parse_usize_with_magnitude("2 M").unwrap(), 2_000_000);
        assert_eq!(parse_usize_with_magnitude("1Gi").unwrap(), 1 << 30);

        for invalid in ["", "k", "-1k", "3 kb", "5m", "1.5M", "18446744073709551615k"] {
            assert!(
                parse_usize_with_magnitude(invalid).is_err(),
                "`{invalid}` should be rejected"
            );
        }
    }

    #[test]
    fn blacklist_domain_syntax() {
        for valid in ["example.com", "ads.example-cdn.net", "*.example.com", "localhost"] {
            assert!(is_valid_config_domain(valid), "`{valid}` should be valid");
        }

        for invalid in [
            "",
            "example..com",
            "-example.com",
            "example-.com",
            "exa_mple.com",
            "*e.example.com",
            "ads.*.example.com",
            "http://example.com",
        ] {
            assert!(!is_valid_config_domain(invalid), "`{invalid}` should be invalid");
        }
    }

    #[test]
    fn test_domain_matching() {
        let wildcard = ConfigDomainName::new("*.Example.com".to_string()).unwrap();
        assert!(wildcard.matches("ads.example.com"));
        assert!(!wildcard.matches("example.org"));

        let full = ConfigDomainName::new("tracker.net".to_string()).unwrap();
        assert!(full.matches("tracker.net"));
        assert!(!full.matches("www.tracker.net"));
    }

    #[test]
    fn test_parse_config() {
        let config = Config::parse(
            r#"
            role = "remote"
            bind_port = 9090
            cache_directory = "/tmp/cache"
            downlink_rate = "56k"
            blacklist = ["*.ads.example.com", "tracker.net"]
            allowed_proxy_clients = ["10.0.0.0/8", "::1"]
            "#,
        )
        .unwrap();

        assert_eq!(config.role, ProxyRole::Remote);
        assert_eq!(config.bind_port.get(), 9090);
        assert_eq!(config.cache_directory, Path::new("/tmp/cache"));
        assert_eq!(config.downlink_rate, NonZero::new(56_000));
        assert_eq!(config.blacklist.len(), 2);
        assert_eq!(config.request_timeout(), Some(DEFAULT_REMOTE_REQUEST_TIMEOUT));
        assert!(config.is_client_allowed(&"10.1.2.3".parse().unwrap()));
        assert!(config.is_client_allowed(&"::ffff:10.1.2.3".parse().unwrap()));
        assert!(!config.is_client_allowed(&"192.168.0.1".parse().unwrap()));
    }

    #[test]
    fn test_parse_config_rejects_invalid() {
        assert!(Config::parse("unknown_key = 1").is_err());
        assert!(Config::parse("role = \"middle\"").is_err());
        assert!(Config::parse("blacklist = [\"bad_domain\"]").is_err());
        assert!(Config::parse("gateway = \"no-port\"").is_err());
        assert!(Config::parse("role = \"remote\"\ngateway = \"remote.example:8081\"").is_err());
        assert!(Config::parse("buffer_size = \"1\"").is_err());
    }

    #[test]
    fn test_request_timeout_defaults() {
        let mut config = Config::default();
        assert_eq!(config.request_timeout(), None);

        config.role = ProxyRole::Remote;
        assert_eq!(config.request_timeout(), Some(Duration::from_secs(180)));

        config.request_timeout = Some(Duration::ZERO);
        assert_eq!(config.request_timeout(), None);

        config.request_timeout = Some(Duration::from_secs(30));
        assert_eq!(config.request_timeout(), Some(Duration::from_secs(30)));
    }
}
