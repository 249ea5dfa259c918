//! Follow one subsystem's live housekeeping and fetch a short history for a
//! few fields through a single coalesced request.
//!
//! ```sh
//! TELEMETRY_LINK_URL=ws://localhost:8080/ws cargo run --example tail -- fs1.eps temp volt
//! ```

use serde_json::json;
use telemetry_link::{BatchQuery, LinkConfig, TelemetryLink};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
	dotenv::dotenv().ok();

	tracing_subscriber::registry()
		.with(tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "telemetry_link=info,tail=info".into()))
		.with(tracing_subscriber::fmt::layer())
		.init();

	let mut args = std::env::args().skip(1);
	let subsystem = args.next().unwrap_or_else(|| "fs1.eps".to_string());
	let fields: Vec<String> = args.collect();

	let config = LinkConfig::from_env()?;
	tracing::info!("Connecting to {}", config.endpoint);
	let link = TelemetryLink::connect(config)?;

	let schema = link.call("housekeeping", "get_schema", json!({ "subsystem": subsystem })).await?;
	tracing::info!("Schema for {}: {}", subsystem, schema);

	let query = BatchQuery::new("housekeeping", subsystem.as_str()).strategy("latest").option("size", 10);
	let requests = fields.iter().map(|field| link.request(query.clone(), field));
	for (field, history) in fields.iter().zip(futures::future::join_all(requests).await) {
		match history {
			Ok(history) => tracing::info!("{}: {}", field, history),
			Err(e) => tracing::warn!("{} history unavailable: {}", field, e),
		}
	}

	let subscription = link
		.subscribe("housekeeping", &subsystem, |payload| {
			tracing::info!("{}", payload);
		})
		.await?;

	tokio::signal::ctrl_c().await?;

	subscription.unsubscribe().await?;
	let stats = link.stats().await?;
	tracing::info!("Calls sent: {}, pushes delivered: {}, reconnects: {}", stats.calls_sent, stats.pushes_delivered, stats.connections.saturating_sub(1));
	link.shutdown().await;
	Ok(())
}
