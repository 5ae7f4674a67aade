//! HTTP client for the chat backend

use crate::chat::config::ChatConfig;
use crate::chat::wire::{
    parse_chat_response, parse_stream_line, ChatReply, ChatRequest, Fragment, HealthStatus,
    LineBuffer, ModelInfo, ModelList,
};
use crate::{ErrorKind, Result, VoxError};
use async_stream::try_stream;
use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::{BoxStream, Stream};
use futures::StreamExt;
use reqwest::{Client, Response};
use std::time::Duration;
use tracing::{debug, info, warn};

/// Stream of fragments of one streamed reply
pub type FragmentStream = BoxStream<'static, Result<Fragment>>;

/// Seam between the aggregator and whatever produces replies
#[async_trait]
pub trait ChatBackend: Send + Sync {
    /// Issue one request and return the whole reply
    async fn chat(&self, request: &ChatRequest) -> Result<ChatReply>;

    /// Issue one request and return its fragments lazily
    async fn stream_chat(&self, request: &ChatRequest) -> Result<FragmentStream>;

    /// List the models the backend can serve
    async fn list_models(&self) -> Result<Vec<ModelInfo>>;
}

/// Longest slice of an error body carried into the error message
const ERROR_BODY_LIMIT: usize = 200;

fn transport_error(e: reqwest::Error) -> VoxError {
    VoxError::chat(VoxError::from_transport(&e), e.to_string())
}

/// Turn a non-2xx response into an `upstream-error` carrying its body
async fn check_status(response: Response) -> Result<Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    let body = response.text().await.unwrap_or_default();
    let body: String = body.chars().take(ERROR_BODY_LIMIT).collect();
    Err(VoxError::chat(
        ErrorKind::UpstreamError,
        format!("server returned {}: {}", status, body.trim()),
    ))
}

/// Frame a response body into fragments.
///
/// Unparseable lines are skipped; an `error` object from the server ends the
/// stream with `upstream-error`; no data for `idle` ends it with `timeout`.
fn fragment_stream<S>(bytes: S, idle: Duration) -> impl Stream<Item = Result<Fragment>> + Send
where
    S: Stream<Item = reqwest::Result<Bytes>> + Send + 'static,
{
    try_stream! {
        let mut bytes = Box::pin(bytes);
        let mut lines = LineBuffer::new();
        loop {
            let next = tokio::time::timeout(idle, bytes.next())
                .await
                .map_err(|_| VoxError::chat(ErrorKind::Timeout, "stream stalled"))?;

            let chunk = match next {
                Some(chunk) => chunk.map_err(transport_error)?,
                None => break,
            };

            for line in lines.push(&chunk) {
                match parse_stream_line(&line) {
                    Some(Ok(fragment)) => {
                        yield fragment;
                    }
                    Some(Err(e)) if e.kind() == Some(ErrorKind::MalformedResponse) => {
                        warn!("Skipping stream line: {}", e);
                    }
                    Some(Err(e)) => {
                        Err::<(), VoxError>(e)?;
                    }
                    None => {}
                }
            }
        }

        if let Some(line) = lines.finish() {
            match parse_stream_line(&line) {
                Some(Ok(fragment)) => {
                    yield fragment;
                }
                Some(Err(e)) => warn!("Skipping trailing stream data: {}", e),
                None => {}
            }
        }
    }
}

/// Chat backend reached over HTTP (`/chat`, `/tags`, `/health`)
#[derive(Clone)]
pub struct HttpChatClient {
    client: Client,
    config: ChatConfig,
}

impl HttpChatClient {
    pub fn new(config: ChatConfig) -> Result<Self> {
        let client = Client::builder()
            .connect_timeout(config.timeout)
            .build()
            .map_err(|e| VoxError::ConfigError(format!("Failed to build HTTP client: {}", e)))?;

        info!("Chat backend at {}", config.base_url);
        Ok(Self { client, config })
    }

    pub fn config(&self) -> &ChatConfig {
        &self.config
    }

    /// Query `/health`
    pub async fn health(&self) -> Result<HealthStatus> {
        let response = self
            .client
            .get(self.config.endpoint("health"))
            .timeout(self.config.timeout)
            .send()
            .await
            .map_err(transport_error)?;

        check_status(response)
            .await?
            .json::<HealthStatus>()
            .await
            .map_err(transport_error)
    }
}

#[async_trait]
impl ChatBackend for HttpChatClient {
    async fn chat(&self, request: &ChatRequest) -> Result<ChatReply> {
        debug!(
            "POST chat: model={} messages={}",
            request.model,
            request.messages.len()
        );

        let body = request.clone().with_stream(false);
        let response = self
            .client
            .post(self.config.endpoint("chat"))
            .json(&body)
            .timeout(self.config.timeout)
            .send()
            .await
            .map_err(transport_error)?;

        let text = check_status(response)
            .await?
            .text()
            .await
            .map_err(transport_error)?;

        parse_chat_response(&text)
    }

    async fn stream_chat(&self, request: &ChatRequest) -> Result<FragmentStream> {
        debug!(
            "POST chat (streaming): model={} messages={}",
            request.model,
            request.messages.len()
        );

        let body = request.clone().with_stream(true);
        let response = tokio::time::timeout(
            self.config.timeout,
            self.client
                .post(self.config.endpoint("chat"))
                .json(&body)
                .send(),
        )
        .await
        .map_err(|_| VoxError::chat(ErrorKind::Timeout, "no response from server"))?
        .map_err(transport_error)?;

        let bytes = check_status(response).await?.bytes_stream();
        Ok(Box::pin(fragment_stream(bytes, self.config.timeout)))
    }

    async fn list_models(&self) -> Result<Vec<ModelInfo>> {
        let response = self
            .client
            .get(self.config.endpoint("tags"))
            .timeout(self.config.timeout)
            .send()
            .await
            .map_err(transport_error)?;

        let list = check_status(response)
            .await?
            .json::<ModelList>()
            .await
            .map_err(transport_error)?;

        debug!("Backend lists {} models", list.models.len());
        Ok(list.models)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_client_uses_config_endpoint() {
        let client =
            HttpChatClient::new(ChatConfig::default().with_base_url("http://127.0.0.1:1/api"))
                .unwrap();
        assert_eq!(client.config().endpoint("chat"), "http://127.0.0.1:1/api/chat");
    }

    fn body(chunks: &[&'static str]) -> impl Stream<Item = reqwest::Result<Bytes>> + Send {
        futures::stream::iter(
            chunks
                .iter()
                .map(|c| Ok(Bytes::from_static(c.as_bytes())))
                .collect::<Vec<_>>(),
        )
    }

    #[tokio::test]
    async fn test_fragment_stream_frames_split_lines() {
        let stream = fragment_stream(
            body(&[
                "data: {\"message\":{\"content\":\"he\"},\"done\":false}\n\ndata: {\"mess",
                "age\":{\"content\":\"hello\"},\"done\":true}\n",
            ]),
            Duration::from_secs(1),
        );
        let fragments: Vec<_> = stream.collect().await;

        assert_eq!(fragments.len(), 2);
        assert_eq!(fragments[0].as_ref().unwrap(), &Fragment::partial("he"));
        let last = fragments[1].as_ref().unwrap();
        assert_eq!(last.content.as_deref(), Some("hello"));
        assert!(last.done);
    }

    #[tokio::test]
    async fn test_fragment_stream_skips_garbage_and_stops_on_server_error() {
        let stream = fragment_stream(
            body(&[
                "{not json}\n",
                "{\"message\":{\"content\":\"a\"},\"done\":false}\n",
                "{\"error\":\"model crashed\"}\n",
                "{\"message\":{\"content\":\"never\"},\"done\":true}\n",
            ]),
            Duration::from_secs(1),
        );
        let items: Vec<_> = stream.collect().await;

        assert_eq!(items.len(), 2);
        assert!(items[0].is_ok());
        let err = items[1].as_ref().unwrap_err();
        assert_eq!(err.kind(), Some(ErrorKind::UpstreamError));
    }

    #[tokio::test]
    async fn test_fragment_stream_trailing_line_without_newline() {
        let stream = fragment_stream(
            body(&["{\"message\":{\"content\":\"x\"},\"done\":true}"]),
            Duration::from_secs(1),
        );
        let items: Vec<_> = stream.collect().await;
        assert_eq!(items.len(), 1);
        assert!(items[0].as_ref().unwrap().done);
    }

    #[tokio::test]
    async fn test_fragment_stream_stall_is_timeout() {
        let stalled = futures::stream::iter(vec![Ok::<_, reqwest::Error>(Bytes::from_static(
            b"{\"message\":{\"content\":\"he\"},\"done\":false}\n",
        ))])
        .chain(futures::stream::pending());
        let mut stream = Box::pin(fragment_stream(stalled, Duration::from_millis(50)));

        assert_eq!(stream.next().await.unwrap().unwrap(), Fragment::partial("he"));
        let err = stream.next().await.unwrap().unwrap_err();
        assert_eq!(err.kind(), Some(ErrorKind::Timeout));
        assert!(stream.next().await.is_none());
    }

    #[tokio::test]
    async fn test_unreachable_server_is_network_error() {
        let config = ChatConfig::default()
            .with_base_url("http://127.0.0.1:1/api")
            .with_timeout(std::time::Duration::from_secs(2));
        let client = HttpChatClient::new(config).unwrap();
        let request = ChatRequest::new("gemma3:1b", Vec::new());

        let err = client.chat(&request).await.unwrap_err();
        assert!(matches!(
            err.kind(),
            Some(ErrorKind::NetworkError) | Some(ErrorKind::Timeout)
        ));
    }
}
