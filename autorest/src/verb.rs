use serde::{Deserialize, Serialize};

use crate::{Error, ErrorKind};

/// HTTP verb declared on an endpoint. Defaults to GET when a method carries
/// no verb attribute.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, Default, PartialEq, Eq)]
#[serde(rename_all = "UPPERCASE")]
pub enum HttpVerb {
    Head,
    #[default]
    Get,
    Post,
    Put,
    Delete,
    Connect,
    Options,
    Trace,
    Patch,
}

impl HttpVerb {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            HttpVerb::Head => "HEAD",
            HttpVerb::Get => "GET",
            HttpVerb::Post => "POST",
            HttpVerb::Put => "PUT",
            HttpVerb::Delete => "DELETE",
            HttpVerb::Connect => "CONNECT",
            HttpVerb::Options => "OPTIONS",
            HttpVerb::Trace => "TRACE",
            HttpVerb::Patch => "PATCH",
        }
    }

    #[must_use]
    pub fn method(&self) -> hyper::Method {
        match self {
            HttpVerb::Head => hyper::Method::HEAD,
            HttpVerb::Get => hyper::Method::GET,
            HttpVerb::Post => hyper::Method::POST,
            HttpVerb::Put => hyper::Method::PUT,
            HttpVerb::Delete => hyper::Method::DELETE,
            HttpVerb::Connect => hyper::Method::CONNECT,
            HttpVerb::Options => hyper::Method::OPTIONS,
            HttpVerb::Trace => hyper::Method::TRACE,
            HttpVerb::Patch => hyper::Method::PATCH,
        }
    }
}

impl std::str::FromStr for HttpVerb {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "HEAD" => Ok(HttpVerb::Head),
            "GET" => Ok(HttpVerb::Get),
            "POST" => Ok(HttpVerb::Post),
            "PUT" => Ok(HttpVerb::Put),
            "DELETE" => Ok(HttpVerb::Delete),
            "CONNECT" => Ok(HttpVerb::Connect),
            "OPTIONS" => Ok(HttpVerb::Options),
            "TRACE" => Ok(HttpVerb::Trace),
            "PATCH" => Ok(HttpVerb::Patch),
            other => Err(Error::new(
                ErrorKind::UnsupportedVerb,
                format!("unknown HTTP verb: {other}"),
            )),
        }
    }
}

impl std::fmt::Display for HttpVerb {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    #[test]
    fn test_verb_parse() {
        assert_eq!(HttpVerb::from_str("get").unwrap(), HttpVerb::Get);
        assert_eq!(HttpVerb::from_str("POST").unwrap(), HttpVerb::Post);
        assert_eq!(HttpVerb::default(), HttpVerb::Get);
        assert!(HttpVerb::from_str("YEET").is_err());
    }

    #[test]
    fn test_verb_serde() {
        assert_eq!(serde_json::to_string(&HttpVerb::Patch).unwrap(), "\"PATCH\"");
        let verb: HttpVerb = serde_json::from_str("\"DELETE\"").unwrap();
        assert_eq!(verb, HttpVerb::Delete);
    }
}
