use std::time::Duration;

use hyper::body::HttpBody;
use hyper::client::HttpConnector;
use hyper::header::{RANGE, USER_AGENT};
use hyper::{Body, Client, Request, StatusCode};
use log::{debug, trace};
use tokio::time::timeout;

use crate::error::{Error, Result};
use crate::magnet::MagnetDescriptor;

/// a url leaves the rotation after this many consecutive failures
pub const MAX_URL_FAILURES: u32 = 3;

/// connect + read budget for one url
const FETCH_TIMEOUT: Duration = Duration::from_secs(30);

/// BEP 19 range fetcher: pulls piece-aligned byte ranges over plain http
/// GETs, walking the seed urls in declaration order.
///
/// Failure accounting is per url and counts consecutive failures only; a
/// url that answers a full range is forgiven its history. Length-mismatched
/// answers are not punished, they just end the current call; the next call
/// walks the list again.
pub struct WebSeeds {
    client: Client<HttpConnector>,
    urls: Vec<SeedUrl>,
    user_agent: String,
}

struct SeedUrl {
    url: String,
    failures: u32,
}

impl WebSeeds {
    /// Seed order is `ws=` entries first, then `as=` entries, both in
    /// declaration order.
    pub fn from_descriptor(descriptor: &MagnetDescriptor, user_agent: &str) -> WebSeeds {
        let urls = descriptor
            .web_seeds
            .iter()
            .chain(&descriptor.acceptable_sources)
            .map(|url| SeedUrl {
                url: url.clone(),
                failures: 0,
            })
            .collect();

        WebSeeds {
            client: Client::new(),
            urls,
            user_agent: user_agent.into(),
        }
    }

    pub fn has_urls(&self) -> bool {
        !self.urls.is_empty()
    }

    /// puts every url back into the rotation
    pub fn reset_failure_counts(&mut self) {
        for url in &mut self.urls {
            url.failures = 0;
        }
    }

    #[cfg(test)]
    pub(crate) fn failure_counts(&self) -> Vec<u32> {
        self.urls.iter().map(|u| u.failures).collect()
    }

    /// Fetches `size` bytes of piece `index` starting at `offset` into the
    /// torrent's data, trying every eligible url in order. `None` means
    /// this round came up empty; the caller decides when to try again.
    pub async fn download_piece(
        &mut self,
        index: usize,
        offset: u64,
        size: usize,
    ) -> Option<Vec<u8>> {
        if size == 0 {
            return None;
        }

        for i in 0..self.urls.len() {
            if self.urls[i].failures >= MAX_URL_FAILURES {
                continue;
            }

            let url = self.urls[i].url.clone();
            match timeout(FETCH_TIMEOUT, self.fetch_range(&url, offset, size)).await {
                Ok(Ok(Some(bytes))) => {
                    trace!("web seed {} served piece {} ({} bytes)", url, index, size);
                    self.urls[i].failures = 0;
                    return Some(bytes);
                }

                // well-formed answer of the wrong length ends the round
                Ok(Ok(None)) => {
                    debug!("web seed {} returned a short or oversized range", url);
                    return None;
                }

                Ok(Err(e)) => {
                    debug!("web seed {} failed piece {}: {}", url, index, e);
                    self.urls[i].failures += 1;
                }

                Err(_) => {
                    debug!("web seed {} timed out on piece {}", url, index);
                    self.urls[i].failures += 1;
                }
            }
        }

        None
    }

    async fn fetch_range(&self, url: &str, offset: u64, size: usize) -> Result<Option<Vec<u8>>> {
        let uri: hyper::Uri = url.parse()?;
        let request = Request::get(uri)
            .header(RANGE, format!("bytes={}-{}", offset, offset + size as u64 - 1))
            .header(USER_AGENT, self.user_agent.as_str())
            .body(Body::empty())?;

        let response = self.client.request(request).await?;

        // 206 must deliver the requested range and nothing else; 200 means
        // the server ignored the range header and we trim its body locally
        let (mut skip, trimming) = match response.status() {
            StatusCode::PARTIAL_CONTENT => (0, false),
            StatusCode::OK => (offset, true),
            status => return Err(Error::SeedStatus(status)),
        };

        let mut bytes = Vec::with_capacity(size);
        let mut body = response.into_body();

        while let Some(chunk) = body.data().await {
            let chunk = chunk?;
            let mut chunk = &chunk[..];

            if skip > 0 {
                let eat = (chunk.len() as u64).min(skip);
                skip -= eat;
                chunk = &chunk[eat as usize..];
            }
            if chunk.is_empty() {
                continue;
            }

            let want = size - bytes.len();
            if trimming {
                bytes.extend_from_slice(&chunk[..want.min(chunk.len())]);
                if bytes.len() == size {
                    // rest of the body is dropped with the connection
                    return Ok(Some(bytes));
                }
            } else {
                if chunk.len() > want {
                    // server sent more than the range it acknowledged
                    return Ok(None);
                }
                bytes.extend_from_slice(chunk);
            }
        }

        Ok((bytes.len() == size).then(|| bytes))
    }
}
