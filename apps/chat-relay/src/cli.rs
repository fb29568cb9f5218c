use std::net::SocketAddr;
use std::time::Duration;

use anyhow::{ensure, Context, Result};
use clap::{Args, Parser, Subcommand};
use futures_util::{SinkExt, StreamExt};
use serde_json::json;
use tokio::time::timeout;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, error};

use crate::config::{Config, Keyspace};
use crate::event::{ChatEvent, EventBody};

#[derive(Parser, Debug)]
#[command(name = "chat-relay")]
#[command(about = "Chat relay server and debug client")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Commands>,

    #[command(flatten)]
    pub serve: ServeArgs,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Connect to a relay, optionally send a name and a message, and print what arrives
    Chat(ChatArgs),
}

#[derive(Args, Debug, Clone)]
pub struct ServeArgs {
    /// Address to bind the HTTP/WebSocket listener to.
    #[arg(long, env = "CHAT_RELAY_LISTEN_ADDR", default_value = "0.0.0.0:7654")]
    pub listen_addr: String,

    /// Redis connection URI for session tables, history and pub/sub.
    #[arg(long, env = "REDIS_URL", default_value = "redis://127.0.0.1:6379")]
    pub redis_url: String,

    /// Pub/sub channel shared by every relay process.
    #[arg(long, env = "CHAT_RELAY_CHANNEL", default_value = "chat_channel")]
    pub channel: String,

    /// Prefix applied to every stored key.
    #[arg(long, env = "CHAT_RELAY_KEY_PREFIX", default_value = "")]
    pub key_prefix: String,

    /// Number of chat messages kept for replay.
    #[arg(long, env = "CHAT_RELAY_HISTORY_LIMIT", default_value_t = 100)]
    pub history_limit: usize,

    /// Idle time after which a session is expired.
    #[arg(long, env = "CHAT_RELAY_SESSION_LIFETIME_SECS", default_value_t = 240)]
    pub session_lifetime_secs: u64,

    /// Period of the expiry sweep.
    #[arg(long, env = "CHAT_RELAY_SWEEP_INTERVAL_SECS", default_value_t = 60)]
    pub sweep_interval_secs: u64,

    /// Grace period applied during shutdown.
    #[arg(long, env = "CHAT_RELAY_SHUTDOWN_GRACE_SECS", default_value_t = 5)]
    pub shutdown_grace_secs: u64,
}

impl TryFrom<ServeArgs> for Config {
    type Error = anyhow::Error;

    fn try_from(args: ServeArgs) -> Result<Self, Self::Error> {
        let listen_addr: SocketAddr = args
            .listen_addr
            .parse()
            .with_context(|| format!("invalid listen address: {}", args.listen_addr))?;
        ensure!(args.history_limit > 0, "history limit must be greater than zero");
        ensure!(
            args.sweep_interval_secs > 0,
            "sweep interval must be greater than zero"
        );
        ensure!(
            i64::try_from(args.session_lifetime_secs).is_ok(),
            "session lifetime of {}s is out of range",
            args.session_lifetime_secs
        );
        Ok(Config {
            listen_addr,
            redis_url: args.redis_url,
            keyspace: Keyspace::with_prefix(&args.key_prefix, args.channel),
            history_limit: args.history_limit,
            session_lifetime: Duration::from_secs(args.session_lifetime_secs),
            sweep_interval: Duration::from_secs(args.sweep_interval_secs),
            shutdown_grace: Duration::from_secs(args.shutdown_grace_secs),
            ..Config::default()
        })
    }
}

#[derive(Args, Debug, Clone)]
pub struct ChatArgs {
    /// WebSocket endpoint of the relay
    #[arg(short, long, default_value = "ws://localhost:7654/ws")]
    pub url: String,

    /// Session id from an earlier connection
    #[arg(short, long)]
    pub session: Option<String>,

    /// Display name to bind
    #[arg(short, long)]
    pub name: Option<String>,

    /// Message to send after naming
    #[arg(short, long)]
    pub message: Option<String>,

    /// Seconds to keep printing incoming events
    #[arg(long, default_value_t = 2)]
    pub listen_secs: u64,

    /// Print raw JSON instead of formatted lines
    #[arg(long)]
    pub raw: bool,
}

pub async fn run_chat_client(args: ChatArgs) -> Result<()> {
    let url = match &args.session {
        Some(session) => format!("{}?session_id={}", args.url, session),
        None => args.url.clone(),
    };
    debug!("Connecting to {}", url);

    let (ws_stream, _) = match timeout(Duration::from_secs(5), connect_async(url.as_str())).await {
        Ok(Ok(result)) => result,
        Ok(Err(e)) => {
            error!("Failed to connect to {}: {}", url, e);
            return Err(anyhow::anyhow!("Connection failed: {}", e));
        }
        Err(_) => {
            error!("Connection timeout after 5 seconds");
            return Err(anyhow::anyhow!(
                "Connection timeout - is the relay running?"
            ));
        }
    };
    let (mut write, mut read) = ws_stream.split();

    if let Some(name) = &args.name {
        let frame = json!({ "type": "user_name", "user_name": name }).to_string();
        write.send(Message::Text(frame.into())).await?;
    }
    if let Some(message) = &args.message {
        let frame = json!({ "type": "message", "message": message }).to_string();
        write.send(Message::Text(frame.into())).await?;
    }

    let deadline = tokio::time::sleep(Duration::from_secs(args.listen_secs));
    tokio::pin!(deadline);
    loop {
        tokio::select! {
            _ = &mut deadline => break,
            frame = read.next() => match frame {
                Some(Ok(Message::Text(text))) => print_event(text.as_str(), args.raw),
                Some(Ok(Message::Close(frame))) => {
                    debug!("relay closed the connection: {:?}", frame);
                    break;
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => return Err(e.into()),
                None => break,
            },
        }
    }

    let _ = write.send(Message::Close(None)).await;
    Ok(())
}

fn print_event(payload: &str, raw: bool) {
    if raw {
        println!("{}", payload);
        return;
    }
    match ChatEvent::decode(payload) {
        Ok(event) => println!("{}", describe(&event)),
        Err(_) => println!("{}", payload),
    }
}

fn describe(event: &ChatEvent) -> String {
    let stamp = event.timestamp.format("%H:%M:%S");
    let line = match &event.body {
        EventBody::SessionInit => format!("session {}", event.session_id),
        EventBody::UserName { user_name } => format!("* {} joined as {}", event.session_id, user_name),
        EventBody::Message { user_name, message } => format!("{}: {}", user_name, message),
        EventBody::Disconnected { user_name, message } => match (user_name, message) {
            (Some(name), _) => format!("* {} left", name),
            (None, Some(reason)) => format!("* disconnected: {}", reason),
            (None, None) => "* disconnected".to_string(),
        },
    };
    match &event.error_info {
        Some(info) if event.error => format!("[{}] {} (error: {})", stamp, line, info),
        _ => format!("[{}] {}", stamp, line),
    }
}
