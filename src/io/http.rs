use async_trait::async_trait;
use reqwest::header::{CONTENT_RANGE, LOCATION, RANGE};
use reqwest::{Client, Response, StatusCode};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tracing::{debug, instrument};
use url::Url;

use super::{Backend, ReadAt, check_bounds};
use crate::auth::Credentials;
use crate::error::{Error, Result};

const REQUEST_TIMEOUT: Duration = Duration::from_secs(60);
const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);
const MAX_REDIRECTS: usize = 10;

/// Opens archives with one ranged GET per read.
///
/// The client (connection pool and cookie store) is shared by every handle the
/// backend opens. Redirects are followed by hand so credentials can be sent to
/// the login host of the redirect chain.
#[derive(Clone)]
pub struct HttpBackend {
    client: Client,
    credentials: Option<Credentials>,
}

impl HttpBackend {
    pub fn new(credentials: Option<Credentials>) -> Result<Self> {
        let client = Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .connect_timeout(CONNECT_TIMEOUT)
            .redirect(reqwest::redirect::Policy::none())
            .cookie_store(true)
            .user_agent(concat!(env!("CARGO_PKG_NAME"), "/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| Error::connection("http client", e))?;
        Ok(Self {
            client,
            credentials,
        })
    }

    pub(crate) async fn open_reader(&self, location: &str) -> Result<HttpRangeReader> {
        HttpRangeReader::open(self.client.clone(), location, self.credentials.clone()).await
    }
}

#[async_trait]
impl Backend for HttpBackend {
    async fn open(&self, location: &str) -> Result<Arc<dyn ReadAt>> {
        Ok(Arc::new(self.open_reader(location).await?))
    }
}

/// HTTP Range reader for remote ZIP files
pub struct HttpRangeReader {
    client: Client,
    url: Url,
    location: String,
    credentials: Option<Credentials>,
    size: u64,
    transferred_bytes: AtomicU64,
}

impl HttpRangeReader {
    /// Open a remote resource.
    ///
    /// Sends a one-byte ranged GET: the server must answer `206 Partial Content`
    /// and report the total size in `Content-Range`.
    #[instrument(level = "debug", skip(client, credentials))]
    pub async fn open(
        client: Client,
        location: &str,
        credentials: Option<Credentials>,
    ) -> Result<Self> {
        let url = Url::parse(location)
            .map_err(|e| Error::InvalidInput(format!("invalid URL {location:?}: {e}")))?;
        let mut reader = Self {
            client,
            url,
            location: location.to_string(),
            credentials,
            size: 0,
            transferred_bytes: AtomicU64::new(0),
        };

        let resp = reader.send_range(0, 0).await?;
        match resp.status() {
            StatusCode::PARTIAL_CONTENT => {}
            StatusCode::OK => return Err(Error::range_unsupported(location)),
            status => return Err(Error::from_status(location, status.as_u16())),
        }

        let size = resp
            .headers()
            .get(CONTENT_RANGE)
            .and_then(|v| v.to_str().ok())
            .and_then(total_from_content_range)
            .ok_or_else(|| Error::range_unsupported(location))?;

        debug!(size, "remote archive opened");
        reader.size = size;
        Ok(reader)
    }

    fn credentials_for(&self, url: &Url) -> Option<&Credentials> {
        let creds = self.credentials.as_ref()?;
        let host = url.host_str()?;
        let origin = self.url.host_str();
        (creds.host.eq_ignore_ascii_case(host) || origin == Some(host)).then_some(creds)
    }

    async fn send_range(&self, start: u64, end: u64) -> Result<Response> {
        let range = format!("bytes={}-{}", start, end);
        let mut url = self.url.clone();

        for _ in 0..=MAX_REDIRECTS {
            let mut request = self.client.get(url.clone()).header(RANGE, &range);
            if let Some(creds) = self.credentials_for(&url) {
                request = request.basic_auth(&creds.username, Some(&creds.password));
            }

            let resp = request
                .send()
                .await
                .map_err(|e| Error::from_reqwest(&self.location, e))?;
            if !resp.status().is_redirection() {
                return Ok(resp);
            }

            let next = resp
                .headers()
                .get(LOCATION)
                .and_then(|v| v.to_str().ok())
                .ok_or_else(|| {
                    Error::connection(&self.location, "redirect without a Location header")
                })?;
            url = url
                .join(next)
                .map_err(|e| Error::connection(&self.location, e))?;
            debug!(host = url.host_str().unwrap_or(""), "following redirect");
        }

        Err(Error::connection(&self.location, "too many redirects"))
    }
}

#[async_trait]
impl ReadAt for HttpRangeReader {
    async fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<()> {
        if buf.is_empty() {
            return Ok(());
        }
        check_bounds(&self.location, self.size, offset, buf.len() as u64)?;

        let end = offset + buf.len() as u64 - 1;
        let resp = self.send_range(offset, end).await?;
        match resp.status() {
            StatusCode::PARTIAL_CONTENT => {}
            StatusCode::OK => return Err(Error::range_unsupported(&self.location)),
            status => return Err(Error::from_status(&self.location, status.as_u16())),
        }

        // A server or proxy answering another span than the one asked for
        // cannot serve this archive.
        let start = resp
            .headers()
            .get(CONTENT_RANGE)
            .and_then(|v| v.to_str().ok())
            .and_then(start_from_content_range);
        if start != Some(offset) {
            debug!(offset, ?start, "partial response for another range");
            return Err(Error::range_unsupported(&self.location));
        }

        let bytes = resp
            .bytes()
            .await
            .map_err(|e| Error::from_reqwest(&self.location, e))?;
        if bytes.len() != buf.len() {
            return Err(Error::transient(
                &self.location,
                format!("short read: got {} of {} bytes", bytes.len(), buf.len()),
            ));
        }

        buf.copy_from_slice(&bytes);
        self.transferred_bytes
            .fetch_add(bytes.len() as u64, Ordering::Relaxed);
        Ok(())
    }

    fn size(&self) -> u64 {
        self.size
    }

    fn location(&self) -> &str {
        &self.location
    }

    fn transferred_bytes(&self) -> u64 {
        self.transferred_bytes.load(Ordering::Relaxed)
    }
}

/// `first-last/total` part of a `Content-Range: bytes first-last/total` value.
fn byte_range_value(value: &str) -> Option<&str> {
    let (unit, rest) = value.trim().split_once(' ')?;
    unit.eq_ignore_ascii_case("bytes").then_some(rest)
}

/// Total length from a `Content-Range: bytes 0-0/12345` header.
fn total_from_content_range(value: &str) -> Option<u64> {
    byte_range_value(value)?.rsplit_once('/')?.1.trim().parse().ok()
}

/// First byte position from a `Content-Range: bytes 100-199/12345` header.
fn start_from_content_range(value: &str) -> Option<u64> {
    byte_range_value(value)?.split_once('-')?.0.trim().parse().ok()
}
