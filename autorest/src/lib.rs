#![forbid(unsafe_code)]

pub use autorest_macro::api;

// Re-exported for macro-generated code.
pub use async_trait::async_trait;
pub use serde_json;

mod error;
pub use error::{Error, ErrorKind, Result};

mod verb;
pub use verb::HttpVerb;

mod call;
pub use call::{ApiCall, ReturnKind};

mod endpoint;
pub use endpoint::{ApiRequest, Endpoint, EndpointKind, MethodFuture, MethodHandler, ServiceId};

mod registry;
pub use registry::Registry;

mod event;
pub use event::{EventHandler, RelayHandler, ServerSideEvent};

mod subscription;
pub use subscription::SubscriptionManager;

pub mod wire;

mod server;
pub use server::RestApiServer;

mod client;
pub use client::{CallTransport, EventConnector, HttpCallTransport, SseEventConnector};
