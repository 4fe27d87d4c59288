use std::path::PathBuf;
use std::pin::Pin;
use std::time::Duration;

use futures_util::{Stream, StreamExt};
use log::{debug, warn};
use reqwest::{Client, Url};
use tokio::io::AsyncReadExt;

use crate::error::{BootstrapError, Result};

const READ_CHUNK: usize = 64 * 1024;
const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);
const USER_AGENT: &str = concat!("app-bootstrap/", env!("CARGO_PKG_VERSION"));

/// Where a manifest or artifact lives.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SourceLocation {
    Local(PathBuf),
    Remote {
        url: Url,
        credentials: Option<(String, Option<String>)>,
    },
}

impl SourceLocation {
    /// Classify a location. `file:` URLs and bare paths are local; user-info on
    /// HTTP(S) URLs is split off into Basic credentials.
    pub fn parse(location: &str) -> std::result::Result<Self, String> {
        match Url::parse(location) {
            Ok(url) if url.scheme() == "file" => url
                .to_file_path()
                .map(SourceLocation::Local)
                .map_err(|_| format!("invalid file location {location}")),
            Ok(mut url) if matches!(url.scheme(), "http" | "https") => {
                let credentials = if url.username().is_empty() {
                    None
                } else {
                    Some((
                        url.username().to_owned(),
                        url.password().map(str::to_owned),
                    ))
                };
                // Credentials travel in the Authorization header only.
                let _ = url.set_username("");
                let _ = url.set_password(None);
                Ok(SourceLocation::Remote { url, credentials })
            }
            // Single-letter schemes are Windows drive letters.
            Ok(url) if url.scheme().len() > 1 => {
                Err(format!("unsupported scheme {} in {location}", url.scheme()))
            }
            _ => Ok(SourceLocation::Local(PathBuf::from(location))),
        }
    }
}

type ChunkStream = Pin<Box<dyn Stream<Item = reqwest::Result<Vec<u8>>> + Send>>;

/// A readable body, either a local file or an HTTP response stream.
pub enum ByteSource {
    File(tokio::fs::File),
    Http(ChunkStream),
}

impl ByteSource {
    /// Next chunk of the body, `None` at the end.
    pub async fn next_chunk(&mut self, location: &str) -> Result<Option<Vec<u8>>> {
        match self {
            ByteSource::File(file) => {
                let mut buf = vec![0u8; READ_CHUNK];
                let read = file
                    .read(&mut buf)
                    .await
                    .map_err(|e| BootstrapError::network(location, e))?;
                if read == 0 {
                    return Ok(None);
                }
                buf.truncate(read);
                Ok(Some(buf))
            }
            ByteSource::Http(stream) => match stream.next().await {
                Some(chunk) => chunk
                    .map(Some)
                    .map_err(|e| BootstrapError::network(location, e)),
                None => Ok(None),
            },
        }
    }
}

#[derive(Clone)]
pub struct NetworkClient {
    client: Client,
}

impl NetworkClient {
    /// `ignore_ssl` disables certificate and hostname verification.
    pub fn new(ignore_ssl: bool) -> Self {
        Self::with_connect_timeout(ignore_ssl, CONNECT_TIMEOUT)
    }

    /// Only connection setup is bounded; bodies stream for as long as they take.
    pub fn with_connect_timeout(ignore_ssl: bool, connect_timeout: Duration) -> Self {
        if ignore_ssl {
            warn!("network client: TLS verification disabled (--ignoressl)");
        }
        let client = Client::builder()
            .connect_timeout(connect_timeout)
            .user_agent(USER_AGENT)
            .danger_accept_invalid_certs(ignore_ssl)
            .build()
            .unwrap_or_else(|err| {
                warn!("network client: falling back to default HTTP client configuration ({err})");
                Client::new()
            });
        Self { client }
    }

    /// Open a location for streaming. Local sources never touch the network stack.
    pub async fn open(&self, location: &str) -> Result<ByteSource> {
        let source =
            SourceLocation::parse(location).map_err(|e| BootstrapError::network(location, e))?;
        match source {
            SourceLocation::Local(path) => {
                debug!("network client: reading {} from disk", path.display());
                let file = tokio::fs::File::open(&path)
                    .await
                    .map_err(|e| BootstrapError::network(location, e))?;
                Ok(ByteSource::File(file))
            }
            SourceLocation::Remote { url, credentials } => {
                debug!("network client: GET {url}");
                let mut request = self.client.get(url);
                if let Some((user, password)) = credentials {
                    request = request.basic_auth(user, password);
                }
                let response = request
                    .send()
                    .await
                    .map_err(|e| BootstrapError::network(location, e))?
                    .error_for_status()
                    .map_err(|e| BootstrapError::network(location, e))?;
                let stream = response
                    .bytes_stream()
                    .map(|chunk| chunk.map(|bytes| bytes.to_vec()));
                Ok(ByteSource::Http(Box::pin(stream)))
            }
        }
    }

    /// Read a whole (small) document such as a manifest.
    pub async fn fetch_bytes(&self, location: &str) -> Result<Vec<u8>> {
        let mut source = self.open(location).await?;
        let mut body = Vec::new();
        while let Some(chunk) = source.next_chunk(location).await? {
            body.extend_from_slice(&chunk);
        }
        Ok(body)
    }
}
