use futures::stream::Stream;
use futures::{
    stream::{self},
    StreamExt,
};
use reqwest::header::HeaderMap;
use serde::{de::DeserializeOwned, Serialize};
use std::{fmt::Debug, pin::Pin};
use tracing::{event, instrument, Level};

#[derive(Clone)]
pub struct Client {
    client: reqwest::Client,
}

pub type BoxedStream<T> = Pin<Box<dyn Stream<Item = T> + Send>>;

/// Append a raw network chunk to `buffer`, then decode every complete line
/// through `process`. An incomplete trailing line stays in the buffer for the
/// next chunk; lines that fail to decode are skipped.
fn drain_lines<T, F>(buffer: &mut String, chunk: &[u8], process: &F) -> Vec<T>
where
    T: DeserializeOwned,
    F: Fn(&str) -> Option<&str>,
{
    buffer.push_str(&String::from_utf8_lossy(chunk));

    let mut items = Vec::new();
    let mut last_newline_pos = 0;

    for (idx, _) in buffer.match_indices('\n') {
        let line = &buffer[last_newline_pos..idx];
        last_newline_pos = idx + 1;

        if let Some(payload) = process(line) {
            if payload.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<T>(payload) {
                Ok(item) => items.push(item),
                Err(e) => {
                    tracing::warn!("failed to parse stream line: {}: {}", payload, e);
                }
            }
        }
    }

    // Keep incomplete line in buffer
    *buffer = buffer[last_newline_pos..].to_string();
    items
}

/// Decode a raw byte stream into typed items, one per complete line.
///
/// A transport error is emitted as a single `Err` item and terminates the
/// stream; it is never swallowed, so a consumer can tell a broken stream
/// from a clean end-of-stream.
fn decode_lines<S, E, T, F>(bytes: S, process: F) -> BoxedStream<anyhow::Result<T>>
where
    S: Stream<Item = Result<bytes::Bytes, E>> + Send + 'static,
    E: std::error::Error + Send + Sync + 'static,
    T: DeserializeOwned + Send + 'static,
    F: Fn(&str) -> Option<&str> + Send + 'static,
{
    // scan carries the partial-line buffer across network chunks and a
    // flag that ends the stream after an error has been emitted
    let decoded = bytes.scan((String::new(), false), move |state, chunk| {
        let (buffer, failed) = state;
        if *failed {
            return futures::future::ready(None);
        }
        let items: Vec<anyhow::Result<T>> = match chunk {
            Ok(chunk) => drain_lines(buffer, &chunk, &process)
                .into_iter()
                .map(Ok)
                .collect(),
            Err(e) => {
                *failed = true;
                vec![Err(anyhow::Error::new(e).context("stream transport failed"))]
            }
        };
        futures::future::ready(Some(items))
    });
    Box::pin(decoded.flat_map(stream::iter))
}

impl Client {
    pub fn new() -> Self {
        Client {
            client: reqwest::Client::new(),
        }
    }

    pub fn with_headers(headers: HeaderMap) -> Self {
        Client {
            client: reqwest::Client::builder()
                .default_headers(headers)
                .build()
                .expect("Failed to build headers"),
        }
    }

    #[instrument(level = "trace", skip(self))]
    pub async fn get<U, T>(&self, url: U) -> anyhow::Result<T>
    where
        U: reqwest::IntoUrl + std::fmt::Debug,
        T: DeserializeOwned,
    {
        let response = self.client.get(url).send().await?;
        if !response.status().is_success() {
            let status = response.status();
            let error_body = response
                .text()
                .await
                .unwrap_or_else(|_| "Failed to read error body".to_string());
            return Err(anyhow::anyhow!(
                "Request failed with status {}: {}",
                status,
                error_body
            ));
        }
        let text = response.text().await?;
        event!(Level::TRACE, response = text);

        Ok(serde_json::from_str::<T>(&text)?)
    }

    #[instrument(level = "trace", skip(self, request), fields(json_request = serde_json::to_string(request).unwrap_or_default()))]
    pub async fn post<U, S, T>(&self, url: U, request: &S) -> anyhow::Result<T>
    where
        U: reqwest::IntoUrl + std::fmt::Debug,
        S: Serialize + Sized,
        T: DeserializeOwned,
    {
        let response = self.client.post(url).json(request).send().await?;
        if !response.status().is_success() {
            let status = response.status();
            let error_body = response
                .text()
                .await
                .unwrap_or_else(|_| "Failed to read error body".to_string());
            return Err(anyhow::anyhow!(
                "Request failed with status {}: {}",
                status,
                error_body
            ));
        }
        let text = response.text().await?;
        event!(Level::TRACE, response = text);

        Ok(serde_json::from_str::<T>(&text)?)
    }

    #[instrument(level = "trace", skip(self, request, process), fields(json_request = serde_json::to_string(request).unwrap_or_default()))]
    pub async fn post_stream<U, S, F, T>(
        &self,
        url: U,
        request: &S,
        process: F,
    ) -> anyhow::Result<BoxedStream<anyhow::Result<T>>>
    where
        U: reqwest::IntoUrl + Debug,
        S: Serialize + Sized,
        T: DeserializeOwned + Send + 'static,
        F: Fn(&str) -> Option<&str> + 'static + Send,
    {
        let response = self.client.post(url).json(&request).send().await?;
        if !response.status().is_success() {
            let status = response.status();
            let error_body = response
                .text()
                .await
                .unwrap_or_else(|_| "Failed to read error body".to_string());
            return Err(anyhow::anyhow!(
                "Request failed with status {}: {}",
                status,
                error_body
            ));
        }

        Ok(decode_lines(response.bytes_stream(), process))
    }
}

impl Default for Client {
    fn default() -> Self {
        Self::new()
    }
}
