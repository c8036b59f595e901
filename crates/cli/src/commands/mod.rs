// CLI subcommand dispatch and the pieces every command shares.

use std::future::Future;
use std::path::PathBuf;

use anyhow::Context;
use clap::{Args, Subcommand};
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, warn};

use supportchat_common::types::UserId;
use supportchat_session::config::ClientConfig;
use supportchat_session::{ChatSession, SessionEvent, SessionOptions, StompWsTransport};

use crate::exit_code::ServerUnreachable;

pub mod chat;
pub mod config;
pub mod send;

#[derive(Subcommand)]
pub enum Command {
    /// Interactive chat: stdin lines are sent, replies are printed
    Chat(chat::ChatArgs),
    /// Send one message and print the acknowledgement
    Send(send::SendArgs),
    /// Show the effective configuration
    Config(config::ConfigArgs),
}

/// Flags accepted by every subcommand.
#[derive(Debug, Clone, Default, Args)]
pub struct GlobalArgs {
    /// Config file (defaults to ~/.supportchat/config.toml).
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// Chat server host.
    #[arg(long, global = true)]
    pub host: Option<String>,

    /// Chat server port.
    #[arg(long, global = true)]
    pub port: Option<u16>,

    /// WebSocket path on the server.
    #[arg(long = "ws-path", global = true)]
    pub ws_path: Option<String>,

    /// Connect with wss://.
    #[arg(long, global = true)]
    pub secure: bool,

    /// Force JSON output.
    #[arg(long, global = true)]
    pub json: bool,
}

impl GlobalArgs {
    /// Config file contents with command-line overrides applied.
    pub fn load_config(&self) -> anyhow::Result<ClientConfig> {
        let mut config = match &self.config {
            Some(path) => ClientConfig::load_from(path)
                .with_context(|| format!("failed to load config from {}", path.display()))?,
            None => ClientConfig::load(),
        };
        if let Some(host) = &self.host {
            config.endpoint.host = host.clone();
        }
        if let Some(port) = self.port {
            config.endpoint.port = port;
        }
        if let Some(path) = &self.ws_path {
            config.endpoint.path = path.clone();
        }
        if self.secure {
            config.endpoint.secure = true;
        }
        Ok(config)
    }
}

pub fn run(global: GlobalArgs, cmd: Command) -> anyhow::Result<()> {
    match cmd {
        Command::Chat(args) => chat::run(&global, args),
        Command::Send(args) => send::run(&global, args),
        Command::Config(args) => config::run(&global, args),
    }
}

/// Drive `future` to completion on a fresh single-threaded runtime.
pub(crate) fn block_on<F: Future>(future: F) -> anyhow::Result<F::Output> {
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context("failed to build tokio runtime")?;
    Ok(runtime.block_on(future))
}

pub(crate) type Session = ChatSession<StompWsTransport>;

/// Connect as `user_id` and wait until the session is usable.
///
/// Fails with [`ServerUnreachable`] once the reconnect policy gives up.
pub(crate) async fn connect_session(
    config: &ClientConfig,
    user_id: UserId,
) -> anyhow::Result<(Session, broadcast::Receiver<SessionEvent>)> {
    let options = SessionOptions::from_config(config);
    let transport = StompWsTransport::new(options.connect_timeout);
    let session = ChatSession::new(options, transport);
    let mut events = session.events();
    session.connect(user_id).context("failed to start chat session")?;

    loop {
        match events.recv().await {
            Ok(SessionEvent::Connected { .. }) => return Ok((session, events)),
            Ok(SessionEvent::Failed { attempts }) => {
                return Err(ServerUnreachable { attempts }.into());
            }
            Ok(event) => debug!(?event, "waiting for connection"),
            Err(RecvError::Lagged(skipped)) => warn!(skipped, "session events lagged"),
            Err(RecvError::Closed) => anyhow::bail!("chat session closed while connecting"),
        }
    }
}
