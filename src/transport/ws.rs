use super::{Connection, Connector, Inbound};
use crate::config::Credential;
use crate::error::{LiveError, Result};
use bytes::Bytes;
use futures::future::BoxFuture;
use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::header::{HeaderValue, AUTHORIZATION, USER_AGENT};
use tokio_tungstenite::tungstenite::protocol::Message;
use tokio_tungstenite::tungstenite::Error as WsError;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

type Stream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Websocket connector. The credential is sent as `Authorization: Bearer` on every attempt.
#[derive(Debug, Clone)]
pub struct WsConnector {
    url: String,
    credential: Option<Credential>,
    user_agent: String,
}

impl WsConnector {
    pub fn new(url: impl Into<String>, credential: Option<Credential>, user_agent: &str) -> Self {
        Self {
            url: url.into(),
            credential,
            user_agent: user_agent.to_string(),
        }
    }

    async fn open(&self) -> Result<Stream> {
        let mut request = self
            .url
            .as_str()
            .into_client_request()
            .map_err(|e| LiveError::Config(format!("websocket request for {}: {e}", self.url)))?;
        let headers = request.headers_mut();
        if let Some(cred) = &self.credential {
            let value = HeaderValue::from_str(&cred.header_value())
                .map_err(|_| LiveError::Config("credential is not a valid header value".into()))?;
            headers.insert(AUTHORIZATION, value);
        }
        if let Ok(ua) = HeaderValue::from_str(&self.user_agent) {
            headers.insert(USER_AGENT, ua);
        }

        tracing::debug!(url = %self.url, "opening websocket");
        match tokio_tungstenite::connect_async(request).await {
            Ok((stream, _)) => Ok(stream),
            Err(WsError::Http(resp)) => {
                let status = resp.status();
                Err(match status.as_u16() {
                    401 => LiveError::Unauthorized(self.url.clone()),
                    403 => LiveError::Forbidden(self.url.clone()),
                    code => LiveError::Network(format!("websocket upgrade answered {code}")),
                })
            }
            Err(e) => Err(LiveError::Network(e.to_string())),
        }
    }
}

impl Connector for WsConnector {
    fn connect(&self) -> BoxFuture<'_, Result<Box<dyn Connection>>> {
        Box::pin(async move {
            let stream = self.open().await?;
            Ok(Box::new(WsConnection { stream }) as Box<dyn Connection>)
        })
    }
}

struct WsConnection {
    stream: Stream,
}

fn network(e: WsError) -> LiveError {
    LiveError::Network(e.to_string())
}

impl Connection for WsConnection {
    fn send_text(&mut self, text: String) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            self.stream
                .send(Message::Text(text.into()))
                .await
                .map_err(network)
        })
    }

    fn next_frame(&mut self) -> BoxFuture<'_, Result<Inbound>> {
        Box::pin(async move {
            match self.stream.next().await {
                Some(Ok(Message::Text(text))) => Ok(Inbound::Text(text.as_str().to_owned())),
                Some(Ok(Message::Binary(data))) => match String::from_utf8(data.to_vec()) {
                    Ok(text) => Ok(Inbound::Text(text)),
                    Err(_) => {
                        tracing::warn!(len = data.len(), "ignoring non-UTF-8 binary frame");
                        Ok(Inbound::Activity)
                    }
                },
                Some(Ok(Message::Ping(payload))) => {
                    self.stream
                        .send(Message::Pong(payload))
                        .await
                        .map_err(network)?;
                    Ok(Inbound::Activity)
                }
                Some(Ok(Message::Pong(_))) | Some(Ok(Message::Frame(_))) => Ok(Inbound::Activity),
                Some(Ok(Message::Close(frame))) => {
                    Ok(Inbound::Closed(frame.map(|f| f.reason.as_str().to_owned())))
                }
                Some(Err(e)) => Err(network(e)),
                None => Ok(Inbound::Closed(None)),
            }
        })
    }

    fn ping(&mut self) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            self.stream
                .send(Message::Ping(Bytes::new()))
                .await
                .map_err(network)
        })
    }

    fn close(&mut self) -> BoxFuture<'_, ()> {
        Box::pin(async move {
            let _ = self.stream.close(None).await;
        })
    }
}
