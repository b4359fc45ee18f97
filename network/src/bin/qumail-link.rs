use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use crypto::SigningIdentity;
use network::{
    CallFrameRouter, ChannelConfig, Frame, HandlerKey, ReconnectionSupervisor, TransportChannel,
    WebSocketConnector,
};
use pq_handshake::{
    CallEvent, CallNegotiator, CallType, HttpSignaling, HttpSignalingConfig, NegotiatorConfig,
};
use tokio::signal;
use tokio::sync::broadcast::error::RecvError;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "qumail-link", about = "QuMail real-time channel and secure call client")]
struct Cli {
    #[arg(long, env = "QUMAIL_WS_URL", default_value = "ws://localhost:8001")]
    ws_url: String,
    #[arg(long, env = "QUMAIL_API_URL", default_value = "http://localhost:8001/api")]
    api_url: String,
    #[arg(long, env = "QUMAIL_IDENTITY")]
    identity: String,
    #[arg(long, env = "QUMAIL_TOKEN")]
    token: Option<String>,
    /// Hex seed for the handshake signing identity; random when absent
    #[arg(long, env = "QUMAIL_SIGNING_SEED")]
    signing_seed: Option<String>,
    #[arg(long, default_value_t = 10)]
    connect_timeout_secs: u64,
    #[arg(long)]
    verbose: bool,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Print every inbound frame and answer incoming calls
    Listen,
    /// Call a contact and wait until the session is established
    Call {
        contact: String,
        #[arg(long)]
        video: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();
    let cli = Cli::parse();

    let identity = match &cli.signing_seed {
        Some(seed) => SigningIdentity::from_seed(&parse_seed(seed)?),
        None => SigningIdentity::generate().context("failed to generate signing identity")?,
    };
    info!(fingerprint = %identity.identity_key().fingerprint(), "signing identity ready");

    let mut signaling_config = HttpSignalingConfig::new(&cli.api_url);
    let mut connector = WebSocketConnector::new(&cli.ws_url);
    if let Some(token) = &cli.token {
        signaling_config = signaling_config.with_token(token);
        connector = connector.with_token(token);
    }
    let signaling = HttpSignaling::new(signaling_config).context("invalid signaling config")?;
    let mut negotiator_config = NegotiatorConfig::new();
    if cli.verbose {
        negotiator_config = negotiator_config.with_verbose_logging();
    }
    let negotiator = CallNegotiator::new(identity, Arc::new(signaling), negotiator_config);

    let config = ChannelConfig::default()
        .with_connect_timeout(std::time::Duration::from_secs(cli.connect_timeout_secs))
        .with_verbose_logging(cli.verbose);
    let channel = TransportChannel::new(&cli.identity, Arc::new(connector), config);
    let router = CallFrameRouter::new(negotiator.clone());
    router.attach(&channel);
    channel.register_handler(HandlerKey::All, |frame: &Frame| {
        println!("{}", frame.to_json()?);
        Ok(())
    });
    let _supervisor = ReconnectionSupervisor::new(channel.clone())
        .spawn()
        .context("failed to start reconnection supervisor")?;

    channel
        .connect()
        .await
        .with_context(|| format!("failed to connect as {}", cli.identity))?;
    info!(identity = %cli.identity, url = %cli.ws_url, "channel online");

    match cli.command {
        Command::Listen => {
            signal::ctrl_c()
                .await
                .context("failed to install signal handler")?;
        }
        Command::Call { contact, video } => {
            let call_type = if video { CallType::Video } else { CallType::Audio };
            let mut events = negotiator.subscribe();
            let call_id = negotiator
                .start_call(&contact, call_type)
                .await
                .with_context(|| format!("failed to call {contact}"))?;
            loop {
                tokio::select! {
                    event = events.recv() => match event {
                        Ok(CallEvent::Established { call_id: id, srtp, key_fingerprint, .. }) if id == call_id => {
                            info!(call_id = %id, srtp_key_id = %srtp.key_id(), fingerprint = %key_fingerprint, "call secured");
                        }
                        Ok(CallEvent::Failed { call_id: id, reason, .. }) if id == call_id => {
                            bail!("call {id} failed: {reason}");
                        }
                        Ok(_) => {}
                        Err(RecvError::Lagged(missed)) => warn!(missed, "call events lagged"),
                        Err(RecvError::Closed) => bail!("negotiator stopped"),
                    },
                    result = signal::ctrl_c() => {
                        result.context("failed to install signal handler")?;
                        break;
                    }
                }
            }
            negotiator.end_call(&call_id).await;
        }
    }

    info!("shutting down");
    channel.disconnect().await;
    Ok(())
}

fn parse_seed(seed: &str) -> Result<Vec<u8>> {
    let bytes = hex::decode(seed.trim()).context("signing seed must be hex")?;
    if bytes.len() != 32 {
        bail!("signing seed must be 32 bytes");
    }
    Ok(bytes)
}
