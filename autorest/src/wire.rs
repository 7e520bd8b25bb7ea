//! Helpers for the wire contract shared by server and client: query-string
//! encoding, parameter conversion, and the event-stream envelopes.

use std::collections::HashMap;

use bytes::Bytes;
use foldhash::fast::RandomState;
use serde::{Deserialize, Serialize, de::DeserializeOwned};
use serde_json::Value;

use crate::{Error, ErrorKind, Result};

/// Interval between keepalive frames on open event streams.
pub const KEEPALIVE_INTERVAL: std::time::Duration = std::time::Duration::from_secs(5);

/// First frame written on a freshly opened event stream.
pub const INITIAL_FRAME: &str = "event: Event\n\n";

/// Envelope of one pushed event frame. Field names are part of the wire
/// contract; `data` holds the JSON-encoded payload as a string.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct EventInvoke {
    #[serde(rename = "ServerDateTime")]
    pub server_date_time: String,
    #[serde(rename = "EventName")]
    pub event_name: String,
    #[serde(rename = "Data")]
    pub data: String,
}

/// UTC timestamp in the `yyyyMMddHHmmss` wire format.
#[must_use]
pub fn timestamp() -> String {
    chrono::Utc::now().format("%Y%m%d%H%M%S").to_string()
}

/// Encodes ordered parameters as `?k=v&k2=v2`.
///
/// Plain strings are emitted verbatim, everything else as compact JSON.
/// Values are intentionally not URL-escaped; the parsing side splits the raw
/// text without unescaping.
#[must_use]
pub fn query_string(params: &[(String, Value)]) -> String {
    if params.is_empty() {
        return String::new();
    }
    let joined = params
        .iter()
        .map(|(k, v)| match v {
            Value::String(s) => format!("{k}={s}"),
            other => format!("{k}={other}"),
        })
        .collect::<Vec<_>>()
        .join("&");
    format!("?{joined}")
}

/// Splits a raw query string on `&` and the first `=`, without unescaping.
#[must_use]
pub fn parse_query(raw: Option<&str>) -> HashMap<String, String, RandomState> {
    let mut map = HashMap::default();
    let Some(raw) = raw else {
        return map;
    };
    for pair in raw.split('&').filter(|p| !p.is_empty()) {
        match pair.split_once('=') {
            Some((k, v)) => map.insert(k.to_string(), v.to_string()),
            None => map.insert(pair.to_string(), String::new()),
        };
    }
    map
}

/// Converts one raw query value to the declared parameter type.
///
/// Tries the value as JSON text first (integers, booleans, lists), then
/// falls back to treating it as a plain string so that `?value=test` binds
/// to a `String` parameter without quoting.
pub fn convert<T: DeserializeOwned>(raw: &str) -> Result<T> {
    if let Ok(value) = serde_json::from_str::<T>(raw) {
        return Ok(value);
    }
    serde_json::from_value(Value::String(raw.to_string())).map_err(|e| {
        Error::new(
            ErrorKind::ParameterBinding,
            format!("cannot convert query value {raw:?}: {e}"),
        )
    })
}

/// Wraps one JSON document into a `data:` frame.
#[must_use]
pub fn data_frame(json: &str) -> Bytes {
    Bytes::from(format!("data: {json}\n\n"))
}

/// Empty-object frame written by the keepalive loop.
#[must_use]
pub fn keepalive_frame() -> Bytes {
    Bytes::from_static(b"data: {}\n\n")
}

/// Returns the JSON part of a `data:` line, if it is one.
#[must_use]
pub fn parse_data_line(line: &str) -> Option<&str> {
    line.strip_prefix("data: ")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn round_trip<T: Serialize + DeserializeOwned + PartialEq + std::fmt::Debug>(value: T) {
        let params = vec![("p".to_string(), serde_json::to_value(&value).unwrap())];
        let encoded = query_string(&params);
        let map = parse_query(Some(encoded.trim_start_matches('?')));
        let back: T = convert(map.get("p").unwrap()).unwrap();
        assert_eq!(back, value);
    }

    #[test]
    fn test_query_round_trip() {
        round_trip("test".to_string());
        round_trip(42i64);
        round_trip(true);
        round_trip(vec![0, 1, 2, 3]);
        // strings that look like other JSON types stay strings.
        round_trip("5".to_string());
        round_trip("true".to_string());
    }

    #[test]
    fn test_query_string_shape() {
        let params = vec![
            ("value".to_string(), Value::String("test".into())),
            ("count".to_string(), Value::from(3)),
        ];
        assert_eq!(query_string(&params), "?value=test&count=3");
        assert_eq!(query_string(&[]), "");
    }

    #[test]
    fn test_parse_query() {
        let map = parse_query(Some("value=test&count=3&flag"));
        assert_eq!(map.get("value").map(String::as_str), Some("test"));
        assert_eq!(map.get("count").map(String::as_str), Some("3"));
        assert_eq!(map.get("flag").map(String::as_str), Some(""));
        assert!(parse_query(None).is_empty());
    }

    #[test]
    fn test_frames() {
        assert_eq!(&data_frame("{\"a\":1}")[..], b"data: {\"a\":1}\n\n");
        assert_eq!(parse_data_line("data: {}"), Some("{}"));
        assert_eq!(parse_data_line("event: Event"), None);
    }

    #[test]
    fn test_event_invoke_envelope() {
        let envelope = EventInvoke {
            server_date_time: "20260823120000".into(),
            event_name: "SimpleEvent".into(),
            data: "null".into(),
        };
        let json = serde_json::to_string(&envelope).unwrap();
        assert!(json.contains("\"ServerDateTime\""));
        assert!(json.contains("\"EventName\":\"SimpleEvent\""));
        let back: EventInvoke = serde_json::from_str(&json).unwrap();
        assert_eq!(back, envelope);
    }

    #[test]
    fn test_timestamp_shape() {
        let ts = timestamp();
        assert_eq!(ts.len(), 14);
        assert!(ts.chars().all(|c| c.is_ascii_digit()));
    }
}
