// `supportchat send`: connect, send one chat message, print the ack.

use std::time::Duration;

use anyhow::Context;
use clap::Args;
use serde::Serialize;
use tokio::sync::broadcast::error::RecvError;
use tokio::time::{timeout_at, Instant};

use supportchat_common::protocol::envelope::Envelope;
use supportchat_common::types::UserId;
use supportchat_session::config::ClientConfig;
use supportchat_session::{ChatAck, SessionEvent};

use super::GlobalArgs;
use crate::output::{self, OutputFormat};

#[derive(Debug, Args)]
pub struct SendArgs {
    /// Numeric user id from the authentication flow.
    #[arg(long)]
    pub user_id: UserId,

    /// Message text.
    pub text: String,

    /// Keep listening for replies this many seconds after the ack.
    #[arg(long, default_value_t = 0)]
    pub wait: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct SendResult {
    pub ack: ChatAck,
    pub replies: Vec<Envelope>,
}

pub fn run(global: &GlobalArgs, args: SendArgs) -> anyhow::Result<()> {
    let format = OutputFormat::detect(global.json);
    let config = global.load_config()?;
    let result = super::block_on(send_one(config, args))??;
    output::print_output(format, &result, format_human)?;
    Ok(())
}

async fn send_one(config: ClientConfig, args: SendArgs) -> anyhow::Result<SendResult> {
    let (session, mut events) = super::connect_session(&config, args.user_id).await?;

    let reply = session.send_chat(args.text).context("failed to send chat message")?;
    let ack = reply.await.context("chat message was not acknowledged")?;

    let mut replies = Vec::new();
    let deadline = Instant::now() + Duration::from_secs(args.wait);
    while args.wait > 0 {
        match timeout_at(deadline, events.recv()).await {
            Err(_) => break,
            Ok(Ok(SessionEvent::Inbound(envelope))) => replies.push(envelope),
            Ok(Ok(_)) | Ok(Err(RecvError::Lagged(_))) => {}
            Ok(Err(RecvError::Closed)) => break,
        }
    }

    session.disconnect();
    Ok(SendResult { ack, replies })
}

fn format_human(result: &SendResult) -> String {
    let mut lines = vec![format!("sent {}", result.ack.message_id)];
    if let Some(message) = &result.ack.message {
        lines[0].push_str(&format!(" ({message})"));
    }
    for reply in &result.replies {
        lines.push(super::chat::render_envelope(reply));
    }
    lines.join("\n")
}
