// `supportchat chat`: interactive session on stdin/stdout.
//
// Each non-empty line is sent as a chat message. `/status` prints the
// connection state, `/announce` sends USER_CONNECT so the server assigns
// a session id, and `/quit` (or EOF) ends the session.

use anyhow::Context;
use clap::Args;
use serde::Serialize;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::broadcast::error::RecvError;
use tracing::warn;

use supportchat_common::protocol::envelope::{Envelope, Sender};
use supportchat_common::types::{ConnectionState, UserId};
use supportchat_session::config::ClientConfig;
use supportchat_session::SessionEvent;

use super::GlobalArgs;
use crate::exit_code::ServerUnreachable;
use crate::output::{self, OutputFormat};

#[derive(Debug, Args)]
pub struct ChatArgs {
    /// Numeric user id from the authentication flow.
    #[arg(long)]
    pub user_id: UserId,
}

/// One line of chat output.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum ChatLine {
    Message { envelope: Envelope },
    Ack { message_id: String, code: i64, message: Option<String> },
    State { state: ConnectionState },
    Session { session_id: String },
}

pub fn run(global: &GlobalArgs, args: ChatArgs) -> anyhow::Result<()> {
    let format = OutputFormat::detect(global.json);
    let config = global.load_config()?;
    super::block_on(chat_loop(config, args.user_id, format))?
}

async fn chat_loop(config: ClientConfig, user_id: UserId, format: OutputFormat) -> anyhow::Result<()> {
    let (session, mut events) = super::connect_session(&config, user_id).await?;
    emit(format, &ChatLine::State { state: session.status() });

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let result = loop {
        tokio::select! {
            line = lines.next_line() => {
                let Some(line) = line.context("failed to read stdin")? else { break Ok(()) };
                match ChatInput::parse(&line) {
                    ChatInput::Empty => {}
                    ChatInput::Quit => break Ok(()),
                    ChatInput::Status => emit(format, &ChatLine::State { state: session.status() }),
                    ChatInput::Announce => {
                        if let Err(error) = session.send_user_connect() {
                            output::print_error(format, error.code(), &error.to_string());
                        }
                    }
                    ChatInput::Message(text) => match session.send_chat(text) {
                        Ok(reply) => {
                            tokio::spawn(async move {
                                match reply.await {
                                    Ok(ack) => emit(format, &ChatLine::Ack {
                                        message_id: ack.message_id,
                                        code: ack.code,
                                        message: ack.message,
                                    }),
                                    Err(error) => output::print_error(format, error.code(), &error.to_string()),
                                }
                            });
                        }
                        Err(error) => output::print_error(format, error.code(), &error.to_string()),
                    },
                }
            }
            event = events.recv() => match event {
                Ok(SessionEvent::Inbound(envelope)) => emit(format, &ChatLine::Message { envelope }),
                Ok(SessionEvent::StateChanged(state)) => emit(format, &ChatLine::State { state }),
                Ok(SessionEvent::SessionAssigned { session_id }) => {
                    emit(format, &ChatLine::Session { session_id });
                }
                Ok(SessionEvent::Failed { attempts }) => break Err(ServerUnreachable { attempts }.into()),
                Ok(SessionEvent::Disconnected { reason }) => {
                    output::print_warning(format, "DISCONNECTED", &reason);
                }
                Ok(SessionEvent::Connected { .. }) => {}
                Err(RecvError::Lagged(skipped)) => warn!(skipped, "dropped session events"),
                Err(RecvError::Closed) => break Ok(()),
            },
        }
    };

    session.disconnect();
    result
}

/// One line of user input.
#[derive(Debug, PartialEq, Eq)]
enum ChatInput<'a> {
    Empty,
    Quit,
    Status,
    Announce,
    Message(&'a str),
}

impl<'a> ChatInput<'a> {
    fn parse(line: &'a str) -> Self {
        match line.trim() {
            "" => Self::Empty,
            "/quit" => Self::Quit,
            "/status" => Self::Status,
            "/announce" => Self::Announce,
            text => Self::Message(text),
        }
    }
}

fn emit(format: OutputFormat, line: &ChatLine) {
    if let Err(error) = output::print_output(format, line, render_line) {
        warn!(%error, "failed to write to stdout");
    }
}

fn render_line(line: &ChatLine) -> String {
    match line {
        ChatLine::Message { envelope } => render_envelope(envelope),
        ChatLine::Ack { message_id, message, .. } => match message {
            Some(message) => format!("  ✓ {message_id} ({message})"),
            None => format!("  ✓ {message_id}"),
        },
        ChatLine::State { state } => format!("[{state}]"),
        ChatLine::Session { session_id } => format!("[session {session_id}]"),
    }
}

/// `name: content`, falling back to the sender id or envelope type.
pub(crate) fn render_envelope(envelope: &Envelope) -> String {
    let who = match (&envelope.sender_name, &envelope.sender) {
        (Some(name), _) => name.clone(),
        (None, Some(sender)) if sender.is_system() => "support".to_string(),
        (None, Some(Sender::Id(id))) => id.to_string(),
        (None, Some(Sender::Tag(tag))) => tag.clone(),
        (None, None) => envelope.kind.to_string(),
    };
    format!("{who}: {}", envelope.content.as_deref().unwrap_or(""))
}
