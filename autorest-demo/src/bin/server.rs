use std::{sync::Arc, time::Duration};

use autorest::RestApiServer;
use autorest_demo::{SampleApi, SampleService};
use clap::Parser;

#[derive(Parser, Debug, Clone)]
#[command(version, about, long_about = None)]
pub struct Args {
    /// Listen address.
    #[arg(default_value = "0.0.0.0:8000")]
    pub addr: std::net::SocketAddr,

    /// Seconds between demo event raises.
    #[arg(long, default_value = "5")]
    pub event_secs: u64,
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::INFO)
        .init();

    let args = Args::parse();

    let server = RestApiServer::create();
    let service = Arc::new(SampleService::default());
    SampleApi::rest_export(service.clone(), &server);

    let addr = server.listen(args.addr).await.unwrap();
    tracing::info!("Serving {:?} on {addr}...", server.registry().routes());

    tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(args.event_secs));
        loop {
            interval.tick().await;
            service.raise_simple_event();
        }
    });

    server.join().await;
}
