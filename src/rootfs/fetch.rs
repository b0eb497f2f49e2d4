//! Downloading a rootfs archive and its published checksum

use crate::{context::Context, errors::DownloadError};
use http::header::HeaderValue;
use regex::Regex;
use std::{
    convert::TryInto,
    future::Future,
    path::{Path, PathBuf},
    time::Duration,
};
use tokio::io::AsyncWriteExt;
use url::Url;

/// A downloaded archive waiting to be verified
///
/// The artifact owns its file: dropping it deletes the archive, whichever way
/// the install went.
#[derive(Debug)]
pub struct RootfsArtifact {
    archive: PathBuf,
    checksum: String,
}

impl RootfsArtifact {
    pub fn new(archive: PathBuf, checksum: String) -> Self {
        RootfsArtifact { archive, checksum }
    }

    /// Path of the downloaded, still-compressed archive
    pub fn archive(&self) -> &Path {
        &self.archive
    }

    /// Expected sha256 as lowercase hex
    pub fn checksum(&self) -> &str {
        &self.checksum
    }
}

impl Drop for RootfsArtifact {
    fn drop(&mut self) {
        match std::fs::remove_file(&self.archive) {
            Ok(()) => log::debug!("removed archive {:?}", self.archive),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => (),
            Err(err) => log::warn!("could not remove archive {:?}, {}", self.archive, err),
        }
    }
}

/// Something that can produce a rootfs archive plus its expected checksum
pub trait Fetch: Send + Sync {
    fn fetch(&self) -> impl Future<Output = Result<RootfsArtifact, DownloadError>> + Send;
}

/// Parse a checksum response body
///
/// Accepts `"<hex>  <filename>"` or a bare `"<hex>"`, keeping only the first
/// whitespace-separated token, lowercased.
pub fn parse_checksum(body: &str) -> Result<String, DownloadError> {
    lazy_static! {
        static ref SHA256_HEX: Regex = Regex::new(r"^[0-9a-f]{64}$").unwrap();
    }
    let token = match body.split_whitespace().next() {
        Some(token) => token.to_lowercase(),
        None => return Err(DownloadError::EmptyChecksum),
    };
    if SHA256_HEX.is_match(&token) {
        Ok(token)
    } else {
        Err(DownloadError::MalformedChecksum(token))
    }
}

/// Builder for configuring custom [HttpFetcher] instances
#[derive(Debug)]
pub struct HttpFetcherBuilder {
    req: reqwest::ClientBuilder,
    image_url: Url,
    checksum_url: Url,
    cache_dir: PathBuf,
}

impl HttpFetcherBuilder {
    /// Start with the urls and cache directory from a [Context]
    ///
    /// Requests time out after 120 seconds unless changed.
    pub fn new(context: &Context) -> Self {
        let req = reqwest::Client::builder()
            .user_agent(HttpFetcher::default_user_agent())
            .connect_timeout(Duration::from_secs(120))
            .timeout(Duration::from_secs(120));
        HttpFetcherBuilder {
            req,
            image_url: context.rootfs.image_url.clone(),
            checksum_url: context.rootfs.checksum_url.clone(),
            cache_dir: context.cache_dir.clone(),
        }
    }

    /// Set a timeout for each network request
    ///
    /// This timeout applies from the beginning of a request until the last
    /// byte has been received.
    pub fn request_timeout(mut self, timeout: Duration) -> Self {
        self.req = self.req.timeout(timeout);
        self
    }

    /// Set a timeout for only the initial connect phase of each request
    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.req = self.req.connect_timeout(timeout);
        self
    }

    /// Sets the `User-Agent` header used by this fetcher
    pub fn user_agent<V>(mut self, value: V) -> Self
    where
        V: TryInto<HeaderValue>,
        V::Error: Into<http::Error>,
    {
        self.req = self.req.user_agent(value);
        self
    }

    /// Change where archives are downloaded to
    pub fn cache_dir(mut self, dir: &Path) -> Self {
        self.cache_dir = dir.to_path_buf();
        self
    }

    pub fn image_url(mut self, url: Url) -> Self {
        self.image_url = url;
        self
    }

    pub fn checksum_url(mut self, url: Url) -> Self {
        self.checksum_url = url;
        self
    }

    /// Construct an HttpFetcher using the parameters from this Builder
    pub fn build(self) -> Result<HttpFetcher, DownloadError> {
        Ok(HttpFetcher {
            req: self.req.build()?,
            image_url: self.image_url,
            checksum_url: self.checksum_url,
            cache_dir: self.cache_dir,
        })
    }
}

/// Fetches the rootfs archive and checksum over HTTP(S)
#[derive(Clone, Debug)]
pub struct HttpFetcher {
    req: reqwest::Client,
    image_url: Url,
    checksum_url: Url,
    cache_dir: PathBuf,
}

impl HttpFetcher {
    pub fn new(context: &Context) -> Result<HttpFetcher, DownloadError> {
        HttpFetcher::builder(context).build()
    }

    pub fn builder(context: &Context) -> HttpFetcherBuilder {
        HttpFetcherBuilder::new(context)
    }

    /// Default value for the `User-Agent` header
    pub fn default_user_agent() -> HeaderValue {
        static USER_AGENT: &str = concat!(env!("CARGO_PKG_NAME"), "/", env!("CARGO_PKG_VERSION"));
        HeaderValue::from_static(USER_AGENT)
    }

    fn temp_path(&self) -> PathBuf {
        self.cache_dir.join(format!(
            "rootfs-{}-{:016x}.tar.gz",
            std::process::id(),
            rand::random::<u64>()
        ))
    }

    async fn get(&self, url: &Url) -> Result<reqwest::Response, DownloadError> {
        log::debug!("GET {}", url);
        let response = self.req.get(url.clone()).send().await?;
        let status = response.status();
        if status.is_success() {
            Ok(response)
        } else {
            Err(DownloadError::Status {
                url: url.clone(),
                status,
            })
        }
    }

    async fn download_checksum(&self) -> Result<String, DownloadError> {
        let body = self.get(&self.checksum_url).await?.text().await?;
        parse_checksum(&body)
    }

    async fn download_archive(&self, path: &Path) -> Result<u64, DownloadError> {
        let mut response = self.get(&self.image_url).await?;
        let mut file = tokio::fs::File::create(path).await?;
        let mut size = 0u64;
        loop {
            match response.chunk().await? {
                None => break,
                Some(chunk) => {
                    file.write_all(&chunk).await?;
                    size += chunk.len() as u64;
                }
            }
        }
        file.flush().await?;
        Ok(size)
    }
}

impl Fetch for HttpFetcher {
    async fn fetch(&self) -> Result<RootfsArtifact, DownloadError> {
        tokio::fs::create_dir_all(&self.cache_dir).await?;
        let checksum = self.download_checksum().await?;
        log::info!("expecting rootfs sha256 {}", checksum);

        let path = self.temp_path();
        // from here on the artifact cleans up the partial file on error
        let artifact = RootfsArtifact::new(path, checksum);
        let size = self.download_archive(artifact.archive()).await?;
        log::info!("downloaded {} bytes from {}", size, self.image_url);
        Ok(artifact)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn checksum_with_filename() {
        let hex = "A".repeat(64);
        assert_eq!(
            parse_checksum(&format!("{}  alpine.tar.gz\n", hex)).unwrap(),
            "a".repeat(64)
        );
    }

    #[test]
    fn checksum_bare() {
        let hex = "0123456789abcdef".repeat(4);
        assert_eq!(parse_checksum(&hex).unwrap(), hex);
    }

    #[test]
    fn checksum_empty() {
        assert!(matches!(
            parse_checksum("  \n"),
            Err(DownloadError::EmptyChecksum)
        ));
    }

    #[test]
    fn checksum_malformed() {
        assert!(matches!(
            parse_checksum("<html>not found</html>"),
            Err(DownloadError::MalformedChecksum(_))
        ));
        assert!(matches!(
            parse_checksum(&"f".repeat(63)),
            Err(DownloadError::MalformedChecksum(_))
        ));
    }

    #[test]
    fn artifact_drop_removes_archive() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a.tar.gz");
        std::fs::write(&path, b"x").unwrap();
        drop(RootfsArtifact::new(path.clone(), "0".repeat(64)));
        assert!(!path.exists());
    }
}
