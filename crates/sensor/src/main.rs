use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context};
use clap::Parser;
use kube::ResourceExt;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use tripwire_sensor::{
    bus,
    config::{parse_sensor, Config, StoreKind},
    metrics,
    secrets::SecretReader,
    sensor::{InMemoryStore, KubeSensorStore, Listener, SensorStore},
    server::Server,
    triggers::{backoff::BackoffSchedule, ClientCache, TriggerEnv, TriggerRegistry},
};

#[derive(Parser, Debug)]
#[command(name = "tripwire-sensor", about = "Resolve event dependencies and fire triggers")]
struct Args {
    /// Sensor definition (JSON or YAML), instead of SENSOR_OBJECT
    #[arg(long)]
    sensor_file: Option<PathBuf>,

    /// Where sensor status is persisted: kubernetes or memory
    #[arg(long)]
    store: Option<StoreKind>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();
    metrics::register_metrics();

    let args = Args::parse();
    let mut config = Config::load().context("failed to load configuration")?;
    if let Some(store) = args.store {
        config.store = store;
    }
    info!("Loaded configuration: {:?}", config);

    let sensor = match &args.sensor_file {
        Some(path) => {
            let raw = tokio::fs::read(path)
                .await
                .with_context(|| format!("failed to read {}", path.display()))?;
            parse_sensor(&raw)?
        }
        None => match config.sensor()? {
            Some(sensor) => sensor,
            None => bail!("no sensor definition: set SENSOR_OBJECT or pass --sensor-file"),
        },
    };
    let namespace = sensor
        .namespace()
        .unwrap_or_else(|| config.kube.namespace.clone());

    let kube = match config.store {
        StoreKind::Kubernetes => Some(
            kube::Client::try_default()
                .await
                .context("failed to create Kubernetes client")?,
        ),
        StoreKind::Memory => match kube::Client::try_default().await {
            Ok(client) => Some(client),
            Err(e) => {
                warn!(error = %e, "no Kubernetes client, cluster triggers are unavailable");
                None
            }
        },
    };
    let store: Arc<dyn SensorStore> = match (&config.store, &kube) {
        (StoreKind::Kubernetes, Some(client)) => Arc::new(KubeSensorStore::new(client.clone(), &namespace)),
        _ => Arc::new(InMemoryStore::new()),
    };

    let registry = Arc::new(TriggerRegistry::new(
        TriggerEnv::new(
            sensor.name_any(),
            namespace.clone(),
            kube.clone(),
            SecretReader::new(&config.secrets_path),
        ),
        Arc::new(ClientCache::new()),
    ));

    let cancel = CancellationToken::new();
    let shutdown = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("shutdown requested");
        }
        shutdown.cancel();
    });

    let (queue, events) = mpsc::channel(config.listener.queue_size);

    let server = Server::new(queue.clone());
    let addr = config.server.addr.clone();
    let server_cancel = cancel.clone();
    let server_task = tokio::spawn(async move {
        if let Err(e) = server.start(&addr, server_cancel).await {
            error!(error = %e, "event receiver failed");
        }
    });

    if let (Some(url), Some(subject)) = (&config.bus.nats_url, &config.bus.nats_subject) {
        let client = async_nats::connect(url.as_str())
            .await
            .with_context(|| format!("failed to connect to NATS at {}", url))?;
        tokio::spawn(bus::run_nats_subscriber(
            client,
            subject.clone(),
            queue.clone(),
            cancel.clone(),
        ));
    }
    drop(queue);

    let persistence = BackoffSchedule::new(
        config.persistence.initial(),
        config.persistence.factor,
        0.0,
        config.persistence.steps,
    );
    let listener = Listener::new(sensor, registry, store, persistence, config.listener.workers);

    info!(sensor_namespace = %namespace, "starting sensor");
    let result = listener.run(events, cancel.clone()).await;
    cancel.cancel();
    let _ = server_task.await;

    let status = result.context("sensor stopped with an error")?;
    info!(phase = ?status.phase, cycles = status.trigger_cycle_count, "sensor stopped");
    Ok(())
}
