// crates/verifetch-painter/src/http.rs

//! Thin ranged-HTTP client used by the painter.
//!
//! One request per call; retry policy lives in the painter, which owns the
//! per-chunk budget. The full-GET fallback streams and discards bytes
//! outside the requested window so memory stays bounded by the chunk size.

use crate::{PaintError, PainterOptions};
use futures::StreamExt;
use reqwest::header::{CONTENT_RANGE, RANGE};
use reqwest::StatusCode;
use tracing::debug;

#[derive(Debug, Clone)]
pub(crate) struct RangeClient {
    http: reqwest::Client,
}

impl RangeClient {
    pub fn new(opts: &PainterOptions) -> Result<Self, PaintError> {
        let http = reqwest::Client::builder()
            .timeout(opts.request_timeout)
            .build()?;
        Ok(Self { http })
    }

    /// `HEAD` the artifact and report its advertised length.
    pub async fn content_length(&self, url: &str) -> Result<u64, PaintError> {
        let resp = self.http.head(url).send().await?.error_for_status()?;
        resp.content_length()
            .ok_or_else(|| PaintError::Protocol(format!("HEAD {url} carried no Content-Length")))
    }

    /// Plain bounded GET for a sidecar file.
    pub async fn fetch_sidecar(&self, url: &str) -> Result<Vec<u8>, PaintError> {
        debug!(url, "fetching sidecar");
        let resp = self.http.get(url).send().await?.error_for_status()?;
        Ok(resp.bytes().await?.to_vec())
    }

    /// Ranged GET for `bytes=start-end_incl`. Expects 206 + `Content-Range`;
    /// a 200 means the server ignored the range.
    pub async fn fetch_range(
        &self,
        url: &str,
        start: u64,
        end_incl: u64,
    ) -> Result<Vec<u8>, PaintError> {
        debug!(url, start, end_incl, "ranged fetch");
        let resp = self
            .http
            .get(url)
            .header(RANGE, format!("bytes={start}-{end_incl}"))
            .send()
            .await?;

        match resp.status() {
            StatusCode::PARTIAL_CONTENT => {
                if resp.headers().get(CONTENT_RANGE).is_none() {
                    return Err(PaintError::Protocol(format!(
                        "206 from {url} without Content-Range"
                    )));
                }
                Ok(resp.bytes().await?.to_vec())
            }
            StatusCode::OK => Err(PaintError::RangeNotSupported(format!(
                "{url} answered a ranged GET with 200"
            ))),
            status => match resp.error_for_status() {
                Err(e) => Err(e.into()),
                Ok(_) => Err(PaintError::Protocol(format!(
                    "unexpected status {status} for ranged GET {url}"
                ))),
            },
        }
    }

    /// Last-resort full GET, windowed to `[start, start + len)`. Bytes before
    /// the window are discarded as they stream; the connection is dropped as
    /// soon as the window is complete.
    pub async fn fetch_range_via_full_get(
        &self,
        url: &str,
        start: u64,
        len: usize,
    ) -> Result<Vec<u8>, PaintError> {
        debug!(url, start, len, "full-body fallback fetch");
        let resp = self.http.get(url).send().await?.error_for_status()?;
        let mut stream = resp.bytes_stream();

        let mut skipped = 0u64;
        let mut out = Vec::with_capacity(len);
        while let Some(piece) = stream.next().await {
            let piece = piece?;
            let mut slice: &[u8] = &piece;
            if skipped < start {
                let skip = usize::try_from((start - skipped).min(slice.len() as u64))
                    .unwrap_or(slice.len());
                skipped += skip as u64;
                slice = &slice[skip..];
            }
            if !slice.is_empty() {
                let take = (len - out.len()).min(slice.len());
                out.extend_from_slice(&slice[..take]);
                if out.len() == len {
                    break;
                }
            }
        }
        // A short stream surfaces as a short body at the caller.
        Ok(out)
    }
}
