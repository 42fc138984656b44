use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use push_channel_client::{ForwardingHandler, PushEndpoint, PushError};
use push_channel_core::{CSRF_TOKEN_ID, UIDL_SECURITY_TOKEN_ID};
use push_transport::net::{HttpResourceLoader, NetTransport};
use push_transport::{LibraryLoader, TransportConfig, TransportKind};
use serde_json::{Map, Value};
use tokio::{signal, sync::mpsc};
use tracing::{info, warn};

mod telemetry;

const CLOSE_GRACE: Duration = Duration::from_millis(250);

#[derive(Debug, Parser)]
#[command(
    name = "push-probe",
    author,
    version,
    about = "Connects to a UIDL push endpoint and prints every payload it receives"
)]
struct Cli {
    /// Push endpoint to subscribe to.
    #[arg(long, env = "PUSH_PROBE_URL", default_value = "http://127.0.0.1:8090/push")]
    url: String,

    /// Runtime descriptor that must load before connecting. Defaults to `<url>/runtime`.
    #[arg(long, env = "PUSH_PROBE_RUNTIME_URL")]
    runtime_url: Option<String>,

    #[arg(long, env = "PUSH_PROBE_TRANSPORT", default_value = "websocket")]
    transport: TransportKind,

    #[arg(long, env = "PUSH_PROBE_FALLBACK_TRANSPORT", default_value = "streaming")]
    fallback_transport: TransportKind,

    /// Delay between reconnect attempts.
    #[arg(long, env = "PUSH_PROBE_RECONNECT_INTERVAL_MS", default_value_t = 5000)]
    reconnect_interval_ms: u64,

    /// JSON rpc payload to push once the first envelope arrives. Repeatable.
    #[arg(long = "rpc")]
    rpc: Vec<String>,
}

#[derive(Debug, Clone)]
struct ProbeConfig {
    url: String,
    runtime_url: String,
    transport: TransportConfig,
    rpc: Vec<Value>,
}

impl TryFrom<Cli> for ProbeConfig {
    type Error = anyhow::Error;

    fn try_from(cli: Cli) -> Result<Self, Self::Error> {
        if !(cli.url.starts_with("http://") || cli.url.starts_with("https://")) {
            anyhow::bail!("push url must be http(s): {}", cli.url);
        }
        let rpc = cli
            .rpc
            .iter()
            .map(|raw| {
                serde_json::from_str::<Value>(raw)
                    .with_context(|| format!("--rpc is not valid JSON: {raw}"))
            })
            .collect::<Result<Vec<_>>>()?;
        let runtime_url = cli
            .runtime_url
            .unwrap_or_else(|| format!("{}/runtime", cli.url.trim_end_matches('/')));
        let transport = TransportConfig::default()
            .with_transport(cli.transport)
            .with_fallback_transport(cli.fallback_transport)
            .with_reconnect_interval(Duration::from_millis(cli.reconnect_interval_ms));
        Ok(ProbeConfig {
            url: cli.url,
            runtime_url,
            transport,
            rpc,
        })
    }
}

enum Step {
    Shutdown,
    Event(Result<bool, PushError>),
    Payload(Option<String>),
}

#[tokio::main]
async fn main() -> Result<()> {
    telemetry::init()?;

    let config = ProbeConfig::try_from(Cli::parse())?;
    info!(
        url = %config.url,
        runtime_url = %config.runtime_url,
        transport = %config.transport.transport,
        "starting push-probe"
    );

    run(config).await
}

async fn run(config: ProbeConfig) -> Result<()> {
    let loader = LibraryLoader::new(
        config.runtime_url.clone(),
        Arc::new(HttpResourceLoader::new()),
    );
    if let Err(err) = loader.loaded().await {
        warn!(error = %err, "push runtime unavailable; push is disabled");
        return Ok(());
    }

    let (payload_tx, mut payloads) = mpsc::unbounded_channel();
    let mut endpoint = PushEndpoint::new(
        Arc::new(NetTransport::with_loader(loader)),
        ForwardingHandler::new(payload_tx),
    )
    .with_config(config.transport.clone());
    endpoint.connect(config.url.clone())?;

    let mut rpc = Some(config.rpc);
    let ctrl_c = signal::ctrl_c();
    tokio::pin!(ctrl_c);

    loop {
        let step = tokio::select! {
            _ = &mut ctrl_c => Step::Shutdown,
            event = endpoint.next_event() => Step::Event(event),
            payload = payloads.recv() => Step::Payload(payload),
        };

        match step {
            Step::Shutdown => {
                info!("interrupt received; disconnecting");
                endpoint.disconnect();
                tokio::time::sleep(CLOSE_GRACE).await;
                break;
            }
            Step::Event(Ok(true)) => {}
            Step::Event(Ok(false)) => break,
            Step::Event(Err(err)) => return Err(err).context("push endpoint failed"),
            Step::Payload(Some(json)) => {
                println!("{json}");
                if let Some(values) = rpc.take() {
                    let token = security_key(&json);
                    for value in values {
                        endpoint.push(client_message(token.as_deref(), value))?;
                    }
                }
            }
            Step::Payload(None) => break,
        }
    }

    info!(state = %endpoint.state(), "push-probe finished");
    Ok(())
}

/// Pulls the security key out of a UIDL envelope, if it carries one.
fn security_key(json: &str) -> Option<String> {
    let envelope: Value = serde_json::from_str(json).ok()?;
    envelope
        .get(UIDL_SECURITY_TOKEN_ID)?
        .as_str()
        .map(str::to_string)
}

fn client_message(token: Option<&str>, rpc: Value) -> String {
    let mut message = Map::new();
    if let Some(token) = token {
        message.insert(CSRF_TOKEN_ID.to_string(), Value::String(token.to_string()));
    }
    message.insert("rpc".to_string(), rpc);
    Value::Object(message).to_string()
}
