use std::{collections::HashMap, future::Future, pin::Pin, sync::Arc};

use bytes::Bytes;
use foldhash::fast::RandomState;
use serde::de::DeserializeOwned;
use serde_json::Value;

use crate::{Error, ErrorKind, HttpVerb, Result, wire};

/// Identity of a registered service instance.
///
/// Derived from the `Arc` pointer, so two registrations of the same instance
/// compare equal while two instances of the same type do not. Identity only;
/// holding a `ServiceId` never keeps the service alive.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct ServiceId(usize);

impl ServiceId {
    #[must_use]
    pub fn of<S>(service: &Arc<S>) -> Self {
        Self(Arc::as_ptr(service) as *const () as usize)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EndpointKind {
    Method,
    EventSubscribe,
    EventUnsubscribe,
}

pub type MethodFuture = Pin<Box<dyn Future<Output = Result<Value>> + Send>>;

/// Bound invocation target: binds parameters from the request, invokes the
/// service method and JSON-encodes its return value.
pub type MethodHandler = Arc<dyn Fn(ApiRequest) -> MethodFuture + Send + Sync>;

/// A registered (route, kind, target) triple the dispatcher resolves
/// requests against. Immutable once registered.
#[derive(Clone)]
pub struct Endpoint {
    pub kind: EndpointKind,
    pub route: String,
    pub verb: HttpVerb,
    pub service: ServiceId,
    /// Merged type-level and method-level response headers, method wins.
    pub response_headers: Vec<(String, String)>,
    pub handler: Option<MethodHandler>,
}

impl Endpoint {
    #[must_use]
    pub fn method(
        service: ServiceId,
        route: impl Into<String>,
        verb: HttpVerb,
        response_headers: Vec<(String, String)>,
        handler: MethodHandler,
    ) -> Self {
        Self {
            kind: EndpointKind::Method,
            route: route.into(),
            verb,
            service,
            response_headers,
            handler: Some(handler),
        }
    }

    #[must_use]
    pub fn event_subscribe(service: ServiceId, route: impl Into<String>) -> Self {
        Self {
            kind: EndpointKind::EventSubscribe,
            route: route.into(),
            verb: HttpVerb::Get,
            service,
            response_headers: Vec::new(),
            handler: None,
        }
    }

    #[must_use]
    pub fn event_unsubscribe(service: ServiceId, route: impl Into<String>) -> Self {
        Self {
            kind: EndpointKind::EventUnsubscribe,
            route: route.into(),
            verb: HttpVerb::Get,
            service,
            response_headers: Vec::new(),
            handler: None,
        }
    }
}

impl std::fmt::Debug for Endpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Endpoint")
            .field("kind", &self.kind)
            .field("route", &self.route)
            .field("verb", &self.verb)
            .field("service", &self.service)
            .finish_non_exhaustive()
    }
}

/// Incoming request view handed to a [`MethodHandler`]: the parsed query
/// map and the raw body bytes.
#[derive(Debug, Default)]
pub struct ApiRequest {
    query: HashMap<String, String, RandomState>,
    body: Bytes,
}

impl ApiRequest {
    #[must_use]
    pub fn new(query: Option<&str>, body: Bytes) -> Self {
        Self {
            query: wire::parse_query(query),
            body,
        }
    }

    /// Binds a required query parameter.
    ///
    /// # Errors
    ///
    /// `ParameterBinding` when the parameter is absent or cannot be
    /// converted to the declared type.
    pub fn query_param<T: DeserializeOwned>(&self, name: &str) -> Result<T> {
        match self.query.get(name) {
            Some(raw) => wire::convert(raw),
            None => Err(Error::new(
                ErrorKind::ParameterBinding,
                format!("cannot fill required parameter: {name}"),
            )),
        }
    }

    /// Binds an optional query parameter, `None` when absent.
    ///
    /// # Errors
    ///
    /// `ParameterBinding` when the value is present but not convertible.
    pub fn query_param_opt<T: DeserializeOwned>(&self, name: &str) -> Result<Option<T>> {
        match self.query.get(name) {
            Some(raw) => Ok(Some(wire::convert(raw)?)),
            None => Ok(None),
        }
    }

    /// Decodes the raw request body into the declared body parameter type.
    /// An empty body decodes as JSON null.
    ///
    /// # Errors
    ///
    /// `ParameterBinding` when the body is not valid JSON for the type.
    pub fn body_json<T: DeserializeOwned>(&self) -> Result<T> {
        let result = if self.body.is_empty() {
            serde_json::from_value(Value::Null)
        } else {
            serde_json::from_slice(&self.body)
        };
        result.map_err(|e| {
            Error::new(
                ErrorKind::ParameterBinding,
                format!("cannot decode request body: {e}"),
            )
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_query_binding() {
        let req = ApiRequest::new(Some("value=test&count=3"), Bytes::new());
        let value: String = req.query_param("value").unwrap();
        assert_eq!(value, "test");
        let count: u32 = req.query_param("count").unwrap();
        assert_eq!(count, 3);

        let missing = req.query_param::<String>("absent").unwrap_err();
        assert_eq!(missing.kind, ErrorKind::ParameterBinding);
        assert!(missing.msg.contains("absent"));

        assert_eq!(req.query_param_opt::<u32>("absent").unwrap(), None);
        assert_eq!(req.query_param_opt::<u32>("count").unwrap(), Some(3));
    }

    #[test]
    fn test_body_binding() {
        let req = ApiRequest::new(None, Bytes::from_static(b"\"payload\""));
        let body: String = req.body_json().unwrap();
        assert_eq!(body, "payload");

        let req = ApiRequest::new(None, Bytes::new());
        let body: Option<String> = req.body_json().unwrap();
        assert_eq!(body, None);

        let req = ApiRequest::new(None, Bytes::from_static(b"{"));
        assert_eq!(
            req.body_json::<String>().unwrap_err().kind,
            ErrorKind::ParameterBinding
        );
    }

    #[test]
    fn test_service_id_identity() {
        let a = Arc::new(1u32);
        let b = Arc::new(1u32);
        assert_eq!(ServiceId::of(&a), ServiceId::of(&a));
        assert_ne!(ServiceId::of(&a), ServiceId::of(&b));
    }
}
