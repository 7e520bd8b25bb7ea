use std::{sync::Arc, time::Duration};

use autorest_demo::{SampleApi, SampleApiClient};
use clap::Parser;

#[derive(Parser, Debug, Clone)]
#[command(version, about, long_about = None)]
pub struct Args {
    /// Server address.
    #[arg(default_value = "http://127.0.0.1:8000")]
    pub host: String,

    /// Value for the toupper call.
    #[arg(short, long, default_value = "test")]
    pub value: String,

    /// Seconds to keep listening for events, 0 to skip.
    #[arg(long, default_value = "20")]
    pub secs: u64,
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::INFO)
        .init();

    let args = Args::parse();
    let client = SampleApiClient::implement(args.host.clone());

    let rsp = client.test("ping".to_string()).await;
    tracing::info!("test rsp: {rsp:?}");

    let rsp = client.to_upper(args.value.clone()).await;
    tracing::info!("toupper rsp: {rsp:?}");

    let rsp = client.numbers_0_to_10().await;
    tracing::info!("numbers0to10 rsp: {rsp:?}");

    let rsp = client.dynamic_data().await;
    tracing::info!("dynamicdata rsp: {rsp:?}");

    let rsp = client.send_lots_of_data("x".repeat(1 << 20)).await;
    tracing::info!("sendlotsofdata rsp: {rsp:?}");

    if args.secs > 0 {
        client.simple_event().subscribe(Arc::new(|_: &()| {
            tracing::info!("SimpleEvent received");
        }));
        tokio::time::sleep(Duration::from_secs(args.secs)).await;
    }
}
