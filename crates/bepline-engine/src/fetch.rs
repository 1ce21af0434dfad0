//! Fetching remote artifact contents by content hash.

use std::fmt;
use std::io::Read;
use std::sync::Arc;
use std::time::Duration;

use bepline_config::RemoteSettings;
use bepline_util::hash::{is_sha256_hex, verify_sha256};

use crate::error::EngineError;

/// Retrieves the bytes of a remote artifact given its hash id.
pub trait RemoteFetcher: Send + Sync + fmt::Debug {
    /// Fetch the full contents addressed by `hash_id`.
    ///
    /// # Errors
    /// Returns an error if the content is unavailable or fails verification.
    fn fetch(&self, hash_id: &str) -> Result<Vec<u8>, EngineError>;
}

/// Build the fetcher described by `[remote]`: HTTP when a `cas_url` is set,
/// otherwise one that always fails.
pub fn fetcher_for(settings: &RemoteSettings) -> Arc<dyn RemoteFetcher> {
    match settings.cas_url.as_deref() {
        Some(url) => Arc::new(HttpCasFetcher::new(
            url,
            Duration::from_secs(settings.timeout_secs),
        )),
        None => Arc::new(UnavailableFetcher),
    }
}

/// Fetches from an HTTP content-addressed store laid out as `{base}/cas/{hash}`.
pub struct HttpCasFetcher {
    base_url: String,
    agent: ureq::Agent,
}

impl fmt::Debug for HttpCasFetcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HttpCasFetcher")
            .field("base_url", &self.base_url)
            .finish_non_exhaustive()
    }
}

impl HttpCasFetcher {
    pub fn new(base_url: &str, timeout: Duration) -> Self {
        let agent = ureq::Agent::new_with_config(
            ureq::config::Config::builder()
                .timeout_connect(Some(Duration::from_secs(30)))
                .timeout_global(Some(timeout))
                .build(),
        );
        Self {
            base_url: base_url.trim_end_matches('/').to_owned(),
            agent,
        }
    }

    /// URL of the blob for `hash_id`.
    pub fn blob_url(&self, hash_id: &str) -> String {
        format!("{}/cas/{hash_id}", self.base_url)
    }
}

impl RemoteFetcher for HttpCasFetcher {
    fn fetch(&self, hash_id: &str) -> Result<Vec<u8>, EngineError> {
        let url = self.blob_url(hash_id);
        let fetch_error = |message: String| EngineError::Fetch {
            hash_id: hash_id.to_owned(),
            message,
        };

        let response = self
            .agent
            .get(&url)
            .call()
            .map_err(|e| fetch_error(e.to_string()))?;
        let mut body = response.into_body();
        let mut data = Vec::new();
        body.as_reader()
            .read_to_end(&mut data)
            .map_err(|e| fetch_error(e.to_string()))?;

        if is_sha256_hex(hash_id) {
            verify_sha256(&url, &data, hash_id)?;
        }
        tracing::debug!(url = %url, bytes = data.len(), "fetched remote artifact");
        Ok(data)
    }
}

/// Used when no remote store is configured.
#[derive(Debug, Clone, Copy, Default)]
pub struct UnavailableFetcher;

impl RemoteFetcher for UnavailableFetcher {
    fn fetch(&self, hash_id: &str) -> Result<Vec<u8>, EngineError> {
        Err(EngineError::Fetch {
            hash_id: hash_id.to_owned(),
            message: "no remote artifact store is configured (set remote.cas_url)".to_owned(),
        })
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::io::{BufRead, BufReader, Write};
    use std::net::TcpListener;

    use bepline_util::hash::sha256_bytes;

    use super::*;

    /// Serve one HTTP/1.1 response with `body` and return the base URL.
    fn serve_once(body: &'static [u8]) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        std::thread::spawn(move || {
            let (stream, _) = listener.accept().unwrap();
            let mut reader = BufReader::new(stream.try_clone().unwrap());
            let mut line = String::new();
            loop {
                line.clear();
                reader.read_line(&mut line).unwrap();
                if line == "\r\n" || line.is_empty() {
                    break;
                }
            }
            let mut stream = stream;
            write!(
                stream,
                "HTTP/1.1 200 OK\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
                body.len()
            )
            .unwrap();
            stream.write_all(body).unwrap();
        });
        format!("http://{addr}")
    }

    #[test]
    fn blob_url_trims_trailing_slash() {
        let fetcher = HttpCasFetcher::new("http://cache:8080/", Duration::from_secs(5));
        assert_eq!(fetcher.blob_url("abc"), "http://cache:8080/cas/abc");
    }

    #[test]
    fn unavailable_always_fails() {
        let err = UnavailableFetcher.fetch("abc").unwrap_err().to_string();
        assert!(err.contains("cannot fetch remote artifact abc"), "error was: {err}");
    }

    #[test]
    fn fetcher_for_without_url_is_unavailable() {
        let fetcher = fetcher_for(&RemoteSettings::default());
        assert!(fetcher.fetch("abc").is_err());
    }

    #[test]
    fn http_fetch_verifies_digest() {
        let base = serve_once(b"artifact bytes");
        let fetcher = HttpCasFetcher::new(&base, Duration::from_secs(10));
        let data = fetcher.fetch(&sha256_bytes(b"artifact bytes")).unwrap();
        assert_eq!(data, b"artifact bytes");
    }

    #[test]
    fn http_fetch_rejects_wrong_content() {
        let base = serve_once(b"tampered");
        let fetcher = HttpCasFetcher::new(&base, Duration::from_secs(10));
        let err = fetcher.fetch(&sha256_bytes(b"original")).unwrap_err().to_string();
        assert!(err.contains("hash mismatch"), "error was: {err}");
    }

    #[test]
    fn http_fetch_skips_verification_for_opaque_ids() {
        let base = serve_once(b"opaque");
        let fetcher = HttpCasFetcher::new(&base, Duration::from_secs(10));
        assert_eq!(fetcher.fetch("blob-17").unwrap(), b"opaque");
    }
}
