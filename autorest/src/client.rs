use std::collections::HashMap;

use async_trait::async_trait;
use bytes::Bytes;
use foldhash::fast::RandomState;
use http_body_util::{BodyExt, Full};
use hyper::{Request, StatusCode, client::conn::http1};
use hyper_util::rt::TokioIo;
use parking_lot::Mutex;
use serde::{Serialize, de::DeserializeOwned};
use serde_json::Value;

use crate::{
    ApiCall, Error, ErrorKind, HttpVerb, Result, ReturnKind, ServerSideEvent, wire,
};

/// Sends one serialized call and decodes the response into a JSON value.
///
/// Generated proxies go through this trait, so a test double can stand in
/// for the real HTTP transport.
#[async_trait]
pub trait CallTransport: Send + Sync {
    async fn call(&self, call: &ApiCall) -> Result<Value>;
}

/// Opens the event stream behind a service event property and pumps its
/// frames into a local [`ServerSideEvent`].
pub trait EventConnector: Send + Sync {
    fn connect<T>(&self, host: &str, route: &str, event_name: &str) -> ServerSideEvent<T>
    where
        T: Serialize + DeserializeOwned + Send + Sync + 'static;
}

type Sender = http1::SendRequest<Full<Bytes>>;

/// HTTP/1 call transport with a per-authority connection pool. Idle
/// connections are reused across calls and dropped once the peer closes
/// them.
#[derive(Default)]
pub struct HttpCallTransport {
    pool: Mutex<HashMap<String, Vec<Sender>, RandomState>>,
}

impl HttpCallTransport {
    /// Yields a pooled sender (flagged `true`) or a fresh connection.
    async fn acquire(&self, authority: &str) -> Result<(Sender, bool)> {
        loop {
            let cached = self.pool.lock().get_mut(authority).and_then(Vec::pop);
            match cached {
                Some(mut sender) => {
                    if sender.ready().await.is_ok() {
                        return Ok((sender, true));
                    }
                    // stale pooled connection, try the next one
                }
                None => return Ok((connect(authority).await?, false)),
            }
        }
    }

    async fn round_trip(
        &self,
        authority: &str,
        mut sender: Sender,
        req: Request<Full<Bytes>>,
    ) -> Result<(StatusCode, Bytes)> {
        let rsp = sender
            .send_request(req)
            .await
            .map_err(|e| Error::new(ErrorKind::HttpSendReqFailed, e.to_string()))?;
        let status = rsp.status();
        let bytes = rsp
            .into_body()
            .collect()
            .await
            .map_err(|e| Error::new(ErrorKind::HttpReadRspFailed, e.to_string()))?
            .to_bytes();
        self.release(authority, sender);
        Ok((status, bytes))
    }

    fn release(&self, authority: &str, sender: Sender) {
        if !sender.is_closed() {
            self.pool
                .lock()
                .entry(authority.to_string())
                .or_default()
                .push(sender);
        }
    }
}

impl std::fmt::Debug for HttpCallTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpCallTransport")
            .field("pooled", &self.pool.lock().values().map(Vec::len).sum::<usize>())
            .finish()
    }
}

#[async_trait]
impl CallTransport for HttpCallTransport {
    async fn call(&self, call: &ApiCall) -> Result<Value> {
        let body = match call.verb {
            HttpVerb::Get | HttpVerb::Delete => Bytes::new(),
            HttpVerb::Post | HttpVerb::Put => {
                let value = call.body.clone().unwrap_or(Value::Null);
                Bytes::from(serde_json::to_vec(&value)?)
            }
            other => {
                return Err(Error::new(
                    ErrorKind::UnsupportedVerb,
                    format!("{other} calls are not supported"),
                ));
            }
        };

        let authority = authority_of(&call.host);
        let path = format!("{}{}", call.method, wire::query_string(&call.params));
        let build_req = || {
            Request::builder()
                .method(call.verb.method())
                .uri(&path)
                .header(hyper::header::HOST, authority)
                .header(hyper::header::CONTENT_TYPE, "application/json")
                .body(Full::new(body.clone()))
                .map_err(|e| Error::new(ErrorKind::HttpBuildReqFailed, e.to_string()))
        };

        let (sender, reused) = self.acquire(authority).await?;
        let (status, bytes) = match self.round_trip(authority, sender, build_req()?).await {
            Ok(outcome) => outcome,
            // a pooled connection may have been closed by the peer since its
            // last use; the call gets exactly one fresh connection
            Err(err) if reused && err.kind == ErrorKind::HttpSendReqFailed => {
                let sender = connect(authority).await?;
                self.round_trip(authority, sender, build_req()?).await?
            }
            Err(err) => return Err(err),
        };

        match status {
            StatusCode::OK => {
                if call.returns == ReturnKind::Unit || bytes.is_empty() {
                    return Ok(Value::Null);
                }
                serde_json::from_slice(&bytes).map_err(Error::from)
            }
            StatusCode::NOT_FOUND => Err(Error::new(
                ErrorKind::RouteNotFound,
                format!("could not find endpoint {}", call.method),
            )),
            // a handler failure travels as the JSON-encoded Error itself
            StatusCode::INTERNAL_SERVER_ERROR => Err(serde_json::from_slice::<Error>(&bytes)
                .unwrap_or_else(|_| {
                    Error::new(
                        ErrorKind::Unknown("InternalServerError".to_string()),
                        String::from_utf8_lossy(&bytes).into_owned(),
                    )
                })),
            other => Err(Error::new(
                ErrorKind::Unknown(other.to_string()),
                String::from_utf8_lossy(&bytes).into_owned(),
            )),
        }
    }
}

async fn connect(authority: &str) -> Result<Sender> {
    let stream = tokio::net::TcpStream::connect(authority)
        .await
        .map_err(|e| Error::new(ErrorKind::TcpConnectFailed, format!("{authority}: {e}")))?;
    let (sender, conn) = http1::handshake(TokioIo::new(stream))
        .await
        .map_err(|e| Error::new(ErrorKind::TcpConnectFailed, e.to_string()))?;
    tokio::spawn(async move {
        if let Err(e) = conn.await {
            tracing::debug!("client connection ended: {e}");
        }
    });
    Ok(sender)
}

fn authority_of(host: &str) -> &str {
    let host = host.strip_prefix("http://").unwrap_or(host);
    host.trim_end_matches('/')
}

/// Event connector speaking the server's `data:` framed stream protocol.
///
/// [`connect`](EventConnector::connect) returns immediately with a local
/// event bus; a background task opens `{route}/subscribe` and raises every
/// decoded frame on that bus. Keepalive frames and frames of other events
/// are dropped silently.
#[derive(Clone, Copy, Debug, Default)]
pub struct SseEventConnector;

impl EventConnector for SseEventConnector {
    fn connect<T>(&self, host: &str, route: &str, event_name: &str) -> ServerSideEvent<T>
    where
        T: Serialize + DeserializeOwned + Send + Sync + 'static,
    {
        let bus = ServerSideEvent::new();
        let reader = bus.clone();
        let host = host.to_string();
        let subscribe_path = format!("{route}/subscribe");
        let event_name = event_name.to_string();
        tokio::spawn(async move {
            if let Err(e) = read_event_stream(&host, &subscribe_path, &event_name, &reader).await {
                tracing::warn!("event stream for {event_name} ended: {e}");
            }
        });
        bus
    }
}

async fn read_event_stream<T>(
    host: &str,
    subscribe_path: &str,
    event_name: &str,
    bus: &ServerSideEvent<T>,
) -> Result<()>
where
    T: Serialize + DeserializeOwned + Send + Sync + 'static,
{
    let authority = authority_of(host);
    let mut sender = connect(authority).await?;
    let req = Request::builder()
        .method(hyper::Method::GET)
        .uri(subscribe_path)
        .header(hyper::header::HOST, authority)
        .body(Full::new(Bytes::new()))
        .map_err(|e| Error::new(ErrorKind::HttpBuildReqFailed, e.to_string()))?;
    let rsp = sender
        .send_request(req)
        .await
        .map_err(|e| Error::new(ErrorKind::HttpSendReqFailed, e.to_string()))?;
    if rsp.status() != StatusCode::OK {
        return Err(Error::new(
            ErrorKind::HttpReadRspFailed,
            format!("subscribe returned {}", rsp.status()),
        ));
    }

    let mut body = rsp.into_body();
    let mut buffer = String::new();
    while let Some(frame) = body.frame().await {
        let frame = frame.map_err(|e| Error::new(ErrorKind::HttpReadRspFailed, e.to_string()))?;
        let Some(data) = frame.data_ref() else {
            continue;
        };
        buffer.push_str(&String::from_utf8_lossy(data));
        while let Some(block) = next_block(&mut buffer) {
            handle_block(&block, event_name, bus);
        }
    }
    Err(Error::kind(ErrorKind::EventStreamClosed))
}

/// Pops the next blank-line terminated block off the stream buffer.
fn next_block(buffer: &mut String) -> Option<String> {
    let pos = buffer.find("\n\n")?;
    let block = buffer[..pos].to_string();
    buffer.drain(..pos + 2);
    Some(block)
}

fn handle_block<T>(block: &str, event_name: &str, bus: &ServerSideEvent<T>)
where
    T: Serialize + DeserializeOwned,
{
    for line in block.lines() {
        let Some(json) = wire::parse_data_line(line) else {
            continue;
        };
        // keepalives carry a bare `{}` that fails envelope decoding
        let Ok(envelope) = serde_json::from_str::<wire::EventInvoke>(json) else {
            continue;
        };
        if envelope.event_name != event_name {
            continue;
        }
        match serde_json::from_str::<T>(&envelope.data) {
            Ok(payload) => bus.raise(&payload),
            Err(e) => {
                tracing::warn!("dropping undecodable {event_name} payload: {e}");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    };

    use super::*;
    use crate::EventHandler;

    #[test]
    fn test_authority_of() {
        assert_eq!(authority_of("http://localhost:8000"), "localhost:8000");
        assert_eq!(authority_of("http://localhost:8000/"), "localhost:8000");
        assert_eq!(authority_of("127.0.0.1:80"), "127.0.0.1:80");
    }

    #[test]
    fn test_next_block() {
        let mut buffer = String::from("event: Event\n\ndata: {\"a\"");
        assert_eq!(next_block(&mut buffer).as_deref(), Some("event: Event"));
        assert_eq!(next_block(&mut buffer), None);
        buffer.push_str(":1}\n\n");
        assert_eq!(next_block(&mut buffer).as_deref(), Some("data: {\"a\":1}"));
        assert!(buffer.is_empty());
    }

    #[test]
    fn test_handle_block_filters() {
        let bus = ServerSideEvent::<u32>::new();
        let hits = Arc::new(AtomicUsize::new(0));
        let handler: EventHandler<u32> = {
            let hits = hits.clone();
            Arc::new(move |v| {
                hits.fetch_add(*v as usize, Ordering::AcqRel);
            })
        };
        bus.subscribe(handler);

        // keepalive, wrong event, then a real frame
        handle_block("data: {}", "Tick", &bus);
        handle_block(
            "data: {\"ServerDateTime\":\"20260823120000\",\"EventName\":\"Tock\",\"Data\":\"1\"}",
            "Tick",
            &bus,
        );
        handle_block(
            "data: {\"ServerDateTime\":\"20260823120000\",\"EventName\":\"Tick\",\"Data\":\"7\"}",
            "Tick",
            &bus,
        );
        assert_eq!(hits.load(Ordering::Acquire), 7);
    }
}
