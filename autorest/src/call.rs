use serde_json::Value;

use crate::{HttpVerb, wire};

/// Semantic shape of a call's declared return type.
///
/// `Unit` discards the response, `Dynamic` hands the decoded JSON value back
/// unmodified, `Typed` is coerced into the declared type by the proxy.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ReturnKind {
    Unit,
    Dynamic,
    Typed,
}

/// The serialized intent of one outbound call, independent of transport.
///
/// Built by a generated proxy method, consumed by a [`CallTransport`].
/// Never mutated after construction and discarded once the call completes.
///
/// [`CallTransport`]: crate::CallTransport
#[derive(Clone, Debug)]
pub struct ApiCall {
    pub host: String,
    pub verb: HttpVerb,
    /// Full route of the target method, beginning with `/`.
    pub method: String,
    pub returns: ReturnKind,
    /// Non-body parameters in declaration order.
    pub params: Vec<(String, Value)>,
    /// Value of the parameter marked as request body, if any.
    pub body: Option<Value>,
}

impl ApiCall {
    #[must_use]
    pub fn new(
        host: impl Into<String>,
        verb: HttpVerb,
        method: impl Into<String>,
        returns: ReturnKind,
    ) -> Self {
        Self {
            host: host.into(),
            verb,
            method: method.into(),
            returns,
            params: Vec::new(),
            body: None,
        }
    }

    #[must_use]
    pub fn with_param(mut self, name: &str, value: Value) -> Self {
        self.params.push((name.to_string(), value));
        self
    }

    #[must_use]
    pub fn with_body(mut self, value: Value) -> Self {
        self.body = Some(value);
        self
    }

    /// Builds `{host}{route}{?querystring}` per the wire contract.
    #[must_use]
    pub fn url(&self) -> String {
        format!("{}{}{}", self.host, self.method, wire::query_string(&self.params))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_url() {
        let call = ApiCall::new("http://localhost:8000", HttpVerb::Get, "/api/sample/toupper", ReturnKind::Typed)
            .with_param("value", Value::String("test".into()));
        assert_eq!(call.url(), "http://localhost:8000/api/sample/toupper?value=test");

        let call = ApiCall::new("http://localhost:8000", HttpVerb::Post, "/api/sample/send", ReturnKind::Unit)
            .with_body(Value::String("payload".into()));
        assert_eq!(call.url(), "http://localhost:8000/api/sample/send");
        assert_eq!(call.body, Some(Value::String("payload".into())));
    }
}
