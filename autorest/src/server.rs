use std::{convert::Infallible, net::SocketAddr, sync::Arc};

use bytes::Bytes;
use http_body_util::{BodyExt, Full, StreamBody, combinators::BoxBody};
use hyper::{
    Request, Response, StatusCode,
    body::{Frame, Incoming},
    server::conn::http1,
};
use hyper_util::rt::TokioIo;
use tokio::sync::mpsc;
use tokio_stream::{StreamExt, wrappers::UnboundedReceiverStream};
use tokio_util::{
    sync::{CancellationToken, DropGuard},
    task::TaskTracker,
};

use crate::{
    Endpoint, EndpointKind, Error, ErrorKind, Registry, RelayHandler, Result, ServiceId,
    SubscriptionManager, wire,
};

type RspBody = BoxBody<Bytes, Infallible>;

/// REST/event server: owns the endpoint registry and the live subscription
/// list, accepts connections and dispatches requests against registered
/// services.
///
/// # Examples
///
/// ```rust,ignore
/// # use std::{net::SocketAddr, str::FromStr, sync::Arc};
/// # use autorest::{RestApiServer, Result};
/// #[autorest::api("api/sample")]
/// trait SampleApi {
///     async fn to_upper(&self, value: String) -> Result<String>;
/// }
///
/// struct SampleService;
///
/// #[autorest::async_trait]
/// impl SampleApi for SampleService {
///     async fn to_upper(&self, value: String) -> Result<String> {
///         Ok(value.to_uppercase())
///     }
/// }
///
/// # #[tokio::main]
/// # async fn main() {
/// let server = RestApiServer::create();
/// Arc::new(SampleService).rest_export(&server);
///
/// let addr = SocketAddr::from_str("127.0.0.1:8000").unwrap();
/// server.listen(addr).await.unwrap();
/// server.join().await;
/// # }
/// ```
pub struct RestApiServer {
    registry: Arc<Registry>,
    subscriptions: Arc<SubscriptionManager>,
    relay: RelayHandler,
    shutdown: CancellationToken,
    tasks: TaskTracker,
    _drop_guard: DropGuard,
}

impl Default for RestApiServer {
    fn default() -> Self {
        Self::create()
    }
}

impl RestApiServer {
    /// Creates a server and starts its keepalive loop. Must be called from
    /// within a tokio runtime.
    #[must_use]
    pub fn create() -> Self {
        let registry = Arc::new(Registry::default());
        let subscriptions = Arc::new(SubscriptionManager::default());
        let shutdown = CancellationToken::new();
        let tasks = TaskTracker::new();

        let relay: RelayHandler = {
            let subscriptions = subscriptions.clone();
            Arc::new(move |owner, event_name, payload| {
                tracing::debug!("event {event_name} raised, relaying to subscribers");
                subscriptions.broadcast(owner, event_name, payload);
            })
        };

        {
            let subscriptions = subscriptions.clone();
            let token = shutdown.clone();
            tasks.spawn(async move {
                let mut interval = tokio::time::interval(wire::KEEPALIVE_INTERVAL);
                interval.tick().await; // first tick completes immediately
                loop {
                    tokio::select! {
                        () = token.cancelled() => break,
                        _ = interval.tick() => subscriptions.keepalive(),
                    }
                }
            });
        }

        Self {
            registry,
            subscriptions,
            relay,
            shutdown: shutdown.clone(),
            tasks,
            _drop_guard: shutdown.drop_guard(),
        }
    }

    /// Appends endpoints built by a generated `rest_export`.
    pub fn register_endpoints(&self, endpoints: Vec<Endpoint>) {
        for endpoint in &endpoints {
            tracing::info!("registered {:?} endpoint {}", endpoint.kind, endpoint.route);
        }
        self.registry.register(endpoints);
    }

    /// Removes every endpoint owned by the given service instance.
    pub fn unregister(&self, service: ServiceId) {
        self.registry.unregister(service);
    }

    /// The server's single relay callback; `rest_export` subscribes it to
    /// every event bus of a registered service.
    #[must_use]
    pub fn relay_handler(&self) -> RelayHandler {
        self.relay.clone()
    }

    #[must_use]
    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    #[must_use]
    pub fn subscriptions(&self) -> &SubscriptionManager {
        &self.subscriptions
    }

    /// Starts accepting connections, one task per accepted stream. Returns
    /// the bound address (useful with port 0).
    ///
    /// # Errors
    ///
    /// Returns an error when the address cannot be bound.
    pub async fn listen(&self, addr: SocketAddr) -> Result<SocketAddr> {
        let listener = tokio::net::TcpListener::bind(addr)
            .await
            .map_err(|e| Error::new(ErrorKind::TcpBindFailed, e.to_string()))?;
        let listener_addr = listener
            .local_addr()
            .map_err(|e| Error::new(ErrorKind::TcpBindFailed, e.to_string()))?;

        let state = DispatchState {
            registry: self.registry.clone(),
            subscriptions: self.subscriptions.clone(),
        };
        let token = self.shutdown.clone();
        let tasks = self.tasks.clone();
        self.tasks.spawn(async move {
            tracing::info!("start listening: {listener_addr}");
            loop {
                tokio::select! {
                    () = token.cancelled() => {
                        tracing::info!("stop accept loop");
                        break;
                    }
                    accepted = listener.accept() => {
                        let (stream, peer) = match accepted {
                            Ok(accepted) => accepted,
                            Err(e) => {
                                tracing::error!("accept failed: {e}");
                                continue;
                            }
                        };
                        let state = state.clone();
                        let token = token.clone();
                        tasks.spawn(async move {
                            let service = hyper::service::service_fn(move |req| {
                                state.clone().dispatch(req, peer)
                            });
                            let connection = http1::Builder::new()
                                .keep_alive(true)
                                .serve_connection(TokioIo::new(stream), service);
                            tokio::select! {
                                () = token.cancelled() => {}
                                r = connection => {
                                    if let Err(e) = r {
                                        tracing::debug!("connection from {peer} ended: {e}");
                                    }
                                }
                            }
                        });
                    }
                }
            }
        });

        Ok(listener_addr)
    }

    /// Stops accepting connections and closes open streams.
    pub fn stop(&self) {
        self.shutdown.cancel();
        self.tasks.close();
    }

    /// Waits for all server tasks to finish. Call [`stop`](Self::stop)
    /// first.
    pub async fn join(&self) {
        self.tasks.wait().await;
    }
}

#[derive(Clone)]
struct DispatchState {
    registry: Arc<Registry>,
    subscriptions: Arc<SubscriptionManager>,
}

impl DispatchState {
    async fn dispatch(
        self,
        req: Request<Incoming>,
        peer: SocketAddr,
    ) -> std::result::Result<Response<RspBody>, Infallible> {
        let path = req.uri().path().to_string();
        let Some(endpoint) = self.registry.resolve(&path) else {
            tracing::debug!("no endpoint matches {path}");
            return Ok(json_response(StatusCode::NOT_FOUND, &[], Bytes::new()));
        };

        let response = match endpoint.kind {
            EndpointKind::Method => self.handle_method(&endpoint, req).await,
            EndpointKind::EventSubscribe => self.handle_subscribe(&endpoint, peer),
            EndpointKind::EventUnsubscribe => self.handle_unsubscribe(&endpoint, peer),
        };
        Ok(response)
    }

    /// Binds parameters, invokes the target method and encodes its result.
    /// Any binding or invocation failure becomes a 500 with the cause in
    /// the body; the connection task survives.
    async fn handle_method(&self, endpoint: &Endpoint, req: Request<Incoming>) -> Response<RspBody> {
        let Some(handler) = endpoint.handler.clone() else {
            // method endpoints always carry a handler
            return error_response(&Error::kind(ErrorKind::Invocation));
        };

        let query = req.uri().query().map(str::to_owned);
        let body = match req.into_body().collect().await {
            Ok(collected) => collected.to_bytes(),
            Err(e) => {
                return error_response(&Error::new(ErrorKind::Invocation, e.to_string()));
            }
        };

        let request = crate::ApiRequest::new(query.as_deref(), body);
        match handler(request).await {
            Ok(value) => {
                let body = Bytes::from(value.to_string());
                json_response(StatusCode::OK, &endpoint.response_headers, body)
            }
            Err(err) => {
                tracing::debug!("handler for {} failed: {err}", endpoint.route);
                error_response(&err)
            }
        }
    }

    /// Opens a long-lived event stream: registers the subscription, sends
    /// the streaming headers and the initial frame, and leaves the
    /// connection open.
    fn handle_subscribe(&self, endpoint: &Endpoint, peer: SocketAddr) -> Response<RspBody> {
        let (tx, rx) = mpsc::unbounded_channel::<Bytes>();
        let _ = tx.send(Bytes::from_static(wire::INITIAL_FRAME.as_bytes()));
        self.subscriptions
            .add(endpoint.service, endpoint.route.clone(), peer, tx);
        tracing::info!("{} subscribed to {}", peer, endpoint.route);

        let frames =
            UnboundedReceiverStream::new(rx).map(|bytes| Ok::<_, Infallible>(Frame::data(bytes)));
        let body = StreamBody::new(frames).boxed();

        Response::builder()
            .status(StatusCode::OK)
            .header(hyper::header::CONTENT_TYPE, "text/event-stream")
            .header(hyper::header::CACHE_CONTROL, "no-cache")
            .header(hyper::header::ACCESS_CONTROL_ALLOW_ORIGIN, "*")
            .body(body)
            .unwrap_or_else(|e| {
                tracing::error!("building subscribe response failed: {e}");
                plain_status(StatusCode::INTERNAL_SERVER_ERROR)
            })
    }

    /// Authoritative unsubscribe: closes the requesting peer's streams on
    /// this event. Broken streams are additionally pruned lazily on the
    /// next write.
    fn handle_unsubscribe(&self, endpoint: &Endpoint, peer: SocketAddr) -> Response<RspBody> {
        let subscribe_route = match endpoint.route.strip_suffix("/unsubscribe") {
            Some(prefix) => format!("{prefix}/subscribe"),
            None => endpoint.route.clone(),
        };
        let removed = self
            .subscriptions
            .unsubscribe(endpoint.service, &subscribe_route, peer.ip());
        tracing::info!("{} unsubscribed {} stream(s) from {}", peer, removed, subscribe_route);
        json_response(StatusCode::OK, &[], Bytes::from_static(b"null"))
    }
}

fn full(body: Bytes) -> RspBody {
    Full::new(body).boxed()
}

fn plain_status(status: StatusCode) -> Response<RspBody> {
    let mut response = Response::new(full(Bytes::new()));
    *response.status_mut() = status;
    response
}

fn json_response(status: StatusCode, headers: &[(String, String)], body: Bytes) -> Response<RspBody> {
    let mut builder = Response::builder()
        .status(status)
        .header(hyper::header::CONTENT_TYPE, "text/json; charset=utf-8");
    for (name, value) in headers {
        builder = builder.header(name.as_str(), value.as_str());
    }
    builder.body(full(body)).unwrap_or_else(|e| {
        tracing::error!("building response failed: {e}");
        plain_status(StatusCode::INTERNAL_SERVER_ERROR)
    })
}

fn error_response(err: &Error) -> Response<RspBody> {
    let body = serde_json::to_string(err).unwrap_or_else(|_| String::from("{}"));
    json_response(
        StatusCode::INTERNAL_SERVER_ERROR,
        &[],
        Bytes::from(body),
    )
}
