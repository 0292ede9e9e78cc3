use std::net::IpAddr;
use thiserror::Error;
use url::Url;

/// Errors from server URL validation.
#[derive(Error, Debug)]
pub enum UrlValidationError {
    #[error("Invalid URL: {0}")]
    InvalidUrl(#[from] url::ParseError),
    #[error("Unsupported scheme: {0} (only http/https allowed)")]
    UnsupportedScheme(String),
    /// Plain HTTP to a public host would send credentials in the clear.
    #[error("HTTPS required for {0} (plain HTTP only allowed for local servers)")]
    InsecureScheme(String),
    #[error("URL cannot be used as a base: {0}")]
    CannotBeBase(String),
}

/// Validates the aggregation server URL.
///
/// HTTPS is required, except for loopback and private-network hosts where
/// self-hosted servers (FreshRSS, Miniflux) commonly run without TLS.
///
/// ```
/// use feedstream::util::validate_base_url;
///
/// assert!(validate_base_url("https://www.inoreader.com").is_ok());
/// assert!(validate_base_url("http://192.168.1.10/api/greader.php").is_ok());
/// assert!(validate_base_url("http://reader.example.com").is_err());
/// ```
pub fn validate_base_url(url_str: &str) -> Result<Url, UrlValidationError> {
    let url = Url::parse(url_str.trim())?;

    if url.cannot_be_a_base() {
        return Err(UrlValidationError::CannotBeBase(url_str.to_string()));
    }

    match url.scheme() {
        "https" => Ok(url),
        "http" => {
            let host = url.host_str().unwrap_or_default();
            if is_local_host(host) {
                tracing::warn!(host = %host, "Using plain HTTP for a local server");
                Ok(url)
            } else {
                Err(UrlValidationError::InsecureScheme(host.to_string()))
            }
        }
        scheme => Err(UrlValidationError::UnsupportedScheme(scheme.to_owned())),
    }
}

/// True for absolute `http`/`https` URLs; used to vet derived thumbnail links.
pub fn is_web_url(url: &Url) -> bool {
    matches!(url.scheme(), "http" | "https") && url.host_str().is_some()
}

fn is_local_host(host: &str) -> bool {
    if host == "localhost" || host.ends_with(".local") {
        return true;
    }

    // Strip brackets from IPv6 addresses for parsing
    let host = host
        .strip_prefix('[')
        .and_then(|h| h.strip_suffix(']'))
        .unwrap_or(host);

    match host.parse::<IpAddr>() {
        Ok(IpAddr::V4(ip)) => ip.is_loopback() || ip.is_private() || ip.is_link_local(),
        Ok(IpAddr::V6(ip)) => {
            let first = ip.segments()[0];
            // Unique Local (fc00::/7)
            ip.is_loopback() || (first & 0xfe00) == 0xfc00
        }
        Err(_) => false,
    }
}
