use energy_aggregator::config::Config;
use energy_aggregator::db::{self, PgEnergyStore};
use energy_aggregator::ingest::Ingestor;
use energy_aggregator::mqtt;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), anyhow::Error> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .compact()
        .init();

    let cfg_path =
        std::env::var("APP_CONFIG").unwrap_or_else(|_| "config/config.example.yaml".into());
    let cfg = Config::load(&cfg_path)?;
    info!("loaded config; pipelines: {}", cfg.pipelines.len());

    let pool = db::connect(&cfg.database.url, cfg.database.max_connections).await?;
    sqlx::query("SELECT 1").execute(&pool).await?;
    info!("connected to database");

    let ingestor = Ingestor::new(PgEnergyStore::new(pool), cfg.pipelines.clone())?;

    let (client, mut eventloop) = mqtt::connect(&cfg.mqtt);
    for p in &cfg.pipelines {
        client.subscribe(p.topic.clone(), mqtt::qos(p.qos)).await?;
    }
    info!(
        host = %cfg.mqtt.host,
        port = cfg.mqtt.port,
        "subscribed to {} pipeline topic(s)",
        cfg.pipelines.len()
    );

    let sig = tokio::signal::ctrl_c();
    tokio::pin!(sig);
    loop {
        tokio::select! {
            biased;
            _ = &mut sig => {
                info!("shutdown requested");
                break;
            }
            res = mqtt::next_publish(&mut eventloop) => {
                match res {
                    Ok(msg) => {
                        let topic = match std::str::from_utf8(&msg.topic) {
                            Ok(s) => s.to_string(),
                            Err(_) => {
                                warn!(topic_bytes = ?msg.topic, "non-utf8 topic; skipping message");
                                continue;
                            }
                        };
                        if let Err(e) = ingestor.handle_message(&topic, &msg.payload).await {
                            warn!(topic = %topic, error = %e, "processing failed for incoming message");
                        }
                    }
                    Err(e) => {
                        warn!("mqtt error: {e}; reconnecting after short delay");
                        tokio::time::sleep(std::time::Duration::from_secs(2)).await;
                    }
                }
            }
        }
    }

    Ok(())
}
