use chrono::Local;
use clap::Parser;
use log::{error, info, warn};
use pawcall::calls::{
    CallError, CallObserver, CallOptions, CallRegistry, CallRouter, CallSession, SignalEnvelope,
};
use pawcall::types::events::{CONNECT, DISCONNECT, RealtimeEvent};
use pawcall::{CallScreen, ClientConfig, RealtimeClient};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;

// Connects to the realtime backend, binds a call screen for one user and
// logs everything that happens until Ctrl-C.
//
// Usage:
//   cargo run -- --token <jwt> --user U1
//   cargo run -- -t <jwt> -u U1 --peer U2          # also place a call to U2
//   WS_URL=wss://rt.example.com/ws cargo run -- -t <jwt> -u U1

#[derive(Parser, Debug)]
#[command(name = "pawcall", about = "Realtime call signaling demo client")]
struct Args {
    /// Realtime endpoint
    #[arg(long, env = "WS_URL")]
    url: Option<String>,

    /// Identity token used to authenticate the connection
    #[arg(short, long, env = "PAWCALL_TOKEN")]
    token: String,

    /// Local user id
    #[arg(short, long, env = "PAWCALL_USER")]
    user: String,

    /// Place a call to this user once connected
    #[arg(long)]
    peer: Option<String>,

    /// Hang up calls that ring longer than this many seconds
    #[arg(long, default_value_t = 45)]
    ring_timeout: u64,
}

struct LoggingObserver;

impl CallObserver for LoggingObserver {
    fn on_state_change(&self, session: &CallSession) {
        match &session.info {
            Some(info) => info!(
                target: "Demo",
                "Call {} with {} ({}): {:?}",
                info.call_id, info.remote_name, info.remote_user_id, session.state
            ),
            None => info!(target: "Demo", "Call state: {:?}", session.state),
        }
        if let Some(secs) = session.duration_secs {
            info!(target: "Demo", "Call lasted {secs}s");
        }
    }

    fn on_error(&self, error: &CallError) {
        warn!(target: "Demo", "{} ({error})", error.user_message());
    }

    fn on_media_signal(&self, envelope: &SignalEnvelope) {
        info!(target: "Demo", "Media signal for call {}", envelope.call_id);
    }
}

fn main() {
    let args = Args::parse();

    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .format(|buf, record| {
            use std::io::Write;
            writeln!(
                buf,
                "{} [{:<5}] [{}] - {}",
                Local::now().format("%H:%M:%S"),
                record.level(),
                record.target(),
                record.args()
            )
        })
        .init();

    let rt = match tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
    {
        Ok(rt) => rt,
        Err(e) => {
            error!("Failed to build tokio runtime: {e}");
            return;
        }
    };

    rt.block_on(run(args));
}

async fn run(args: Args) {
    let mut config = ClientConfig::from_env();
    if let Some(url) = args.url {
        config = config.with_ws_url(url);
    }

    let client = RealtimeClient::with_websocket(config);
    client.set_identity_token(args.token);

    for event in RealtimeEvent::ALL {
        client.on(
            event.as_str(),
            Arc::new(move |payload: &Value| {
                info!(target: "Demo", "<{event}> {payload}");
            }),
        );
    }
    client.on(
        CONNECT,
        Arc::new(|_: &Value| info!(target: "Demo", "Connected")),
    );
    client.on(
        DISCONNECT,
        Arc::new(|_: &Value| warn!(target: "Demo", "Disconnected")),
    );

    let registry = CallRegistry::new(client.clone());
    let router = CallRouter::new(client.clone(), registry);
    let screen = CallScreen::attach("demo", &args.user, &router)
        .with_observer(Arc::new(LoggingObserver))
        .with_ring_timeout(Duration::from_secs(args.ring_timeout));

    if let Err(e) = client.connect().await {
        warn!("Initial connect failed, retrying in the background: {e}");
    }

    if let Some(peer) = args.peer {
        let options = CallOptions::audio().with_caller(args.user.clone(), None);
        if let Err(e) = screen.start(&peer, &peer, None, options).await {
            error!("Could not call {peer}: {e}");
        }
    }

    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("Failed to listen for Ctrl-C: {e}");
    }

    info!("Shutting down");
    if screen.state().is_live()
        && let Err(e) = screen.end().await
    {
        warn!("Could not hang up the live call: {e}");
    }
    screen.detach();
    client.disconnect().await;
}
