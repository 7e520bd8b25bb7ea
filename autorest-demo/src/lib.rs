use std::sync::atomic::{AtomicU64, Ordering};

use autorest::{Result, ServerSideEvent};
use serde_json::{Value, json};

#[autorest::api("api/sample")]
pub trait SampleApi {
    /// Reachability check, returns nothing.
    async fn test(&self, param1: String) -> Result<()>;

    async fn to_upper(&self, value: String) -> Result<String>;

    async fn numbers_0_to_10(&self) -> Result<Vec<i32>>;

    /// Shape decided by the server at runtime; the proxy hands the raw
    /// JSON value back.
    async fn dynamic_data(&self) -> Result<Value>;

    #[rest(verb = "POST")]
    async fn send_lots_of_data(&self, #[body] data: String) -> Result<()>;

    fn simple_event(&self) -> &ServerSideEvent<()>;

    #[rest(ignore)]
    fn raise_simple_event(&self) {
        self.simple_event().raise(&());
    }
}

#[derive(Default)]
pub struct SampleService {
    counter: AtomicU64,
    simple_event: ServerSideEvent<()>,
}

#[autorest::async_trait]
impl SampleApi for SampleService {
    async fn test(&self, param1: String) -> Result<()> {
        tracing::info!("test called: {param1}");
        Ok(())
    }

    async fn to_upper(&self, value: String) -> Result<String> {
        Ok(value.to_uppercase())
    }

    async fn numbers_0_to_10(&self) -> Result<Vec<i32>> {
        Ok((0..=10).collect())
    }

    async fn dynamic_data(&self) -> Result<Value> {
        let calls = self.counter.fetch_add(1, Ordering::AcqRel);
        Ok(json!({
            "Name": "autorest-demo",
            "Calls": calls,
            "Numbers": [0, 1, 1, 2, 3, 5, 8],
        }))
    }

    async fn send_lots_of_data(&self, data: String) -> Result<()> {
        tracing::info!("received {} bytes", data.len());
        Ok(())
    }

    fn simple_event(&self) -> &ServerSideEvent<()> {
        &self.simple_event
    }
}
