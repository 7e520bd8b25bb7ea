#![forbid(unsafe_code)]

use std::{net::SocketAddr, str::FromStr, sync::Arc};

use autorest::{Error, ErrorKind, RestApiServer, Result, ServiceId};
use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper_util::rt::TokioIo;

#[autorest::api("api/sample", header("X-Service", "sample"))]
trait SampleApi {
    async fn test(&self) -> Result<()>;

    async fn to_upper(&self, value: String) -> Result<String>;

    async fn numbers_0_to_10(&self) -> Result<Vec<i32>>;

    async fn dynamic_data(&self) -> Result<serde_json::Value>;

    async fn add(&self, a: i64, #[default(10)] b: i64) -> Result<i64>;

    async fn fail(&self) -> Result<()>;

    #[rest(verb = "POST", header("X-Service", "bulk"))]
    async fn send_lots_of_data(&self, #[body] data: String) -> Result<()>;
}

struct SampleImpl;

#[autorest::async_trait]
impl SampleApi for SampleImpl {
    async fn test(&self) -> Result<()> {
        Ok(())
    }

    async fn to_upper(&self, value: String) -> Result<String> {
        Ok(value.to_uppercase())
    }

    async fn numbers_0_to_10(&self) -> Result<Vec<i32>> {
        Ok((0..=10).collect())
    }

    async fn dynamic_data(&self) -> Result<serde_json::Value> {
        Ok(serde_json::json!({ "Name": "sample", "Numbers": [1, 2, 3] }))
    }

    async fn add(&self, a: i64, b: i64) -> Result<i64> {
        Ok(a + b)
    }

    async fn fail(&self) -> Result<()> {
        Err(Error::new(ErrorKind::Invocation, "boom".into()))
    }

    async fn send_lots_of_data(&self, data: String) -> Result<()> {
        assert!(!data.is_empty());
        Ok(())
    }
}

#[autorest::api("api/echo")]
trait EchoApi {
    async fn whoami(&self) -> Result<String>;
}

struct EchoImpl(&'static str);

#[autorest::async_trait]
impl EchoApi for EchoImpl {
    async fn whoami(&self) -> Result<String> {
        Ok(self.0.to_string())
    }
}

async fn start_sample() -> (RestApiServer, SocketAddr) {
    let server = RestApiServer::create();
    Arc::new(SampleImpl).rest_export(&server);
    let addr = server
        .listen(SocketAddr::from_str("127.0.0.1:0").unwrap())
        .await
        .unwrap();
    (server, addr)
}

async fn raw_request(
    addr: SocketAddr,
    method: hyper::Method,
    path: &str,
    body: Bytes,
) -> (hyper::StatusCode, hyper::HeaderMap, String) {
    let stream = tokio::net::TcpStream::connect(addr).await.unwrap();
    let (mut sender, conn) = hyper::client::conn::http1::handshake(TokioIo::new(stream))
        .await
        .unwrap();
    tokio::spawn(conn);
    let req = hyper::Request::builder()
        .method(method)
        .uri(path)
        .header(hyper::header::HOST, addr.to_string())
        .body(Full::new(body))
        .unwrap();
    let rsp = sender.send_request(req).await.unwrap();
    let status = rsp.status();
    let headers = rsp.headers().clone();
    let body = rsp.into_body().collect().await.unwrap().to_bytes();
    (status, headers, String::from_utf8_lossy(&body).into_owned())
}

async fn raw_get(addr: SocketAddr, path: &str) -> (hyper::StatusCode, hyper::HeaderMap, String) {
    raw_request(addr, hyper::Method::GET, path, Bytes::new()).await
}

#[tokio::test]
async fn test_proxy_end_to_end() {
    let _ = tracing_subscriber::fmt().try_init();

    let (server, addr) = start_sample().await;
    let client = SampleApiClient::implement(format!("http://{addr}"));

    client.test().await.unwrap();
    assert_eq!(client.to_upper("test".into()).await.unwrap(), "TEST");
    assert_eq!(
        client.numbers_0_to_10().await.unwrap(),
        (0..=10).collect::<Vec<_>>()
    );

    let value = client.dynamic_data().await.unwrap();
    assert_eq!(value["Name"], "sample");
    assert_eq!(value["Numbers"][2], 3);

    assert_eq!(client.add(5, 7).await.unwrap(), 12);

    // void returns come back as JSON null and decode to ()
    client.send_lots_of_data("x".repeat(4096)).await.unwrap();

    // a handler failure travels back with kind and message intact
    let err = client.fail().await.unwrap_err();
    assert_eq!(err, Error::new(ErrorKind::Invocation, "boom".into()));

    server.stop();
    server.join().await;

    let err = client.test().await.unwrap_err();
    assert_eq!(err.kind, ErrorKind::TcpConnectFailed);
}

#[tokio::test]
async fn test_wire_contract() {
    let (server, addr) = start_sample().await;

    let (status, headers, body) = raw_get(addr, "/api/sample/toupper?value=test").await;
    assert_eq!(status, hyper::StatusCode::OK);
    assert_eq!(headers["content-type"], "text/json; charset=utf-8");
    assert_eq!(headers["x-service"], "sample");
    assert_eq!(body, "\"TEST\"");

    // void returns encode as JSON null
    let (status, _, body) = raw_get(addr, "/api/sample/test").await;
    assert_eq!(status, hyper::StatusCode::OK);
    assert_eq!(body, "null");

    // void POST with a bound body; the method-level header replaces the
    // trait-level one
    let (status, headers, body) = raw_request(
        addr,
        hyper::Method::POST,
        "/api/sample/sendlotsofdata",
        Bytes::from_static(b"\"abc\""),
    )
    .await;
    assert_eq!(status, hyper::StatusCode::OK);
    assert_eq!(headers["x-service"], "bulk");
    assert_eq!(body, "null");

    // a body that is not valid JSON for the parameter fails binding
    let (status, _, body) = raw_request(
        addr,
        hyper::Method::POST,
        "/api/sample/sendlotsofdata",
        Bytes::from_static(b"{"),
    )
    .await;
    assert_eq!(status, hyper::StatusCode::INTERNAL_SERVER_ERROR);
    let err: Error = serde_json::from_str(&body).unwrap();
    assert_eq!(err.kind, ErrorKind::ParameterBinding);

    // defaulted parameter binds when absent
    let (_, _, body) = raw_get(addr, "/api/sample/add?a=1").await;
    assert_eq!(body, "11");

    let (status, _, _) = raw_get(addr, "/api/sample/nosuchmethod").await;
    assert_eq!(status, hyper::StatusCode::NOT_FOUND);

    server.stop();
    server.join().await;
}

#[tokio::test]
async fn test_missing_parameter_keeps_server_alive() {
    let (server, addr) = start_sample().await;

    let (status, _, body) = raw_get(addr, "/api/sample/toupper").await;
    assert_eq!(status, hyper::StatusCode::INTERNAL_SERVER_ERROR);
    let err: Error = serde_json::from_str(&body).unwrap();
    assert_eq!(err.kind, ErrorKind::ParameterBinding);
    assert!(err.msg.contains("value"));

    let (status, _, body) = raw_get(addr, "/api/sample/toupper?value=ok").await;
    assert_eq!(status, hyper::StatusCode::OK);
    assert_eq!(body, "\"OK\"");

    server.stop();
    server.join().await;
}

#[tokio::test]
async fn test_route_not_found_via_proxy() {
    let (server, addr) = start_sample().await;

    let client = EchoApiClient::implement(format!("http://{addr}"));
    let err = client.whoami().await.unwrap_err();
    assert_eq!(err.kind, ErrorKind::RouteNotFound);

    server.stop();
    server.join().await;
}

#[tokio::test]
async fn test_unregister_is_scoped_to_instance() {
    let server = RestApiServer::create();
    let first = Arc::new(EchoImpl("first"));
    let second = Arc::new(EchoImpl("second"));
    first.clone().rest_export(&server);
    second.clone().rest_export(&server);

    let addr = server
        .listen(SocketAddr::from_str("127.0.0.1:0").unwrap())
        .await
        .unwrap();
    let client = EchoApiClient::implement(format!("http://{addr}"));

    // duplicate routes resolve to the earliest registration
    assert_eq!(client.whoami().await.unwrap(), "first");

    server.unregister(ServiceId::of(&first));
    assert_eq!(client.whoami().await.unwrap(), "second");

    server.unregister(ServiceId::of(&second));
    let err = client.whoami().await.unwrap_err();
    assert_eq!(err.kind, ErrorKind::RouteNotFound);

    server.stop();
    server.join().await;
}
