//! Interactive terminal loop
//!
//! Lines starting with `/` are commands; anything else is sent as a chat
//! message. Ctrl-C stops a reply that is being generated, and quits when
//! nothing is running.

use crate::chat::{AggregatorEvent, TurnOutcome};
use crate::integration::ChatSession;
use crate::storage::ExportFormat;
use crate::ui::render::{
    format_conversation, format_conversation_list, format_model_list, LiveReply,
};
use crate::Result;
use crossbeam_channel::Receiver;
use std::io::{self, Write};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{debug, info, warn};

const HELP: &str = "\
/new              start a new conversation
/list             list conversations
/switch <id>      switch to a conversation
/model <name>     select a model
/models           list the backend's models
/clear            remove all messages of this conversation
/export <json|md> print this conversation
/speak [text]     speak text, or the last reply
/stop             stop speaking
/help             show this help
/quit             leave";

/// How often streamed updates are flushed to the terminal
const REFRESH_INTERVAL: Duration = Duration::from_millis(30);

#[derive(Debug, Clone, PartialEq)]
pub enum ReplCommand {
    Send(String),
    New,
    List,
    Switch(String),
    Model(String),
    Models,
    Clear,
    Export(ExportFormat),
    Speak(Option<String>),
    Stop,
    Help,
    Quit,
}

#[derive(Debug, Error, PartialEq)]
pub enum CommandError {
    #[error("unknown command /{0}, try /help")]
    Unknown(String),

    #[error("/{command} needs {argument}")]
    MissingArgument {
        command: &'static str,
        argument: &'static str,
    },

    #[error("{0}")]
    InvalidArgument(String),
}

impl ReplCommand {
    /// Parse one input line. Blank lines give `None`.
    pub fn parse(line: &str) -> std::result::Result<Option<Self>, CommandError> {
        let line = line.trim();
        if line.is_empty() {
            return Ok(None);
        }

        let Some(body) = line.strip_prefix('/') else {
            return Ok(Some(ReplCommand::Send(line.to_string())));
        };

        let (name, arg) = match body.split_once(char::is_whitespace) {
            Some((name, arg)) => (name, arg.trim()),
            None => (body, ""),
        };
        let arg = (!arg.is_empty()).then(|| arg.to_string());

        let command = match name {
            "new" => ReplCommand::New,
            "list" => ReplCommand::List,
            "switch" => ReplCommand::Switch(arg.ok_or(CommandError::MissingArgument {
                command: "switch",
                argument: "a conversation id",
            })?),
            "model" => ReplCommand::Model(arg.ok_or(CommandError::MissingArgument {
                command: "model",
                argument: "a model name",
            })?),
            "models" => ReplCommand::Models,
            "clear" => ReplCommand::Clear,
            "export" => {
                let format = arg.as_deref().unwrap_or("md");
                let format = format
                    .parse::<ExportFormat>()
                    .map_err(|e| CommandError::InvalidArgument(e.to_string()))?;
                ReplCommand::Export(format)
            }
            "speak" => ReplCommand::Speak(arg),
            "stop" => ReplCommand::Stop,
            "help" | "?" => ReplCommand::Help,
            "quit" | "exit" | "q" => ReplCommand::Quit,
            other => return Err(CommandError::Unknown(other.to_string())),
        };
        Ok(Some(command))
    }
}

/// What the loop does after a command
#[derive(Debug, PartialEq)]
pub enum Step {
    Continue(Option<String>),
    Quit,
}

pub struct Repl {
    session: Arc<ChatSession>,
    events: Receiver<AggregatorEvent>,
}

impl Repl {
    /// `events` must be the receiver of the channel the session publishes on
    pub fn new(session: Arc<ChatSession>, events: Receiver<AggregatorEvent>) -> Self {
        Self { session, events }
    }

    pub fn session(&self) -> &Arc<ChatSession> {
        &self.session
    }

    /// Run until `/quit`, end of input, or Ctrl-C at the prompt
    pub async fn run(&self) -> Result<()> {
        let settings = self.session.settings().snapshot();
        let conversation = self.session.conversation();
        println!("voxchat ({}), /help for commands", settings.model);
        if !conversation.messages.is_empty() {
            println!("{}", format_conversation(&conversation, settings.show_timestamps));
        }
        if let Some(draft) = self.session.draft()? {
            println!("(unsent draft: {})", draft);
        }

        let mut lines = BufReader::new(tokio::io::stdin()).lines();
        loop {
            print!("> ");
            io::stdout().flush()?;

            let line = tokio::select! {
                line = lines.next_line() => line?,
                _ = tokio::signal::ctrl_c() => {
                    println!();
                    None
                }
            };
            let Some(line) = line else {
                break;
            };

            let command = match ReplCommand::parse(&line) {
                Ok(Some(command)) => command,
                Ok(None) => continue,
                Err(e) => {
                    println!("{}", e);
                    continue;
                }
            };

            let step = match command {
                ReplCommand::Send(text) => self.send_interactive(&text).await,
                command => self.execute(command).await,
            };

            match step {
                Ok(Step::Continue(Some(output))) => println!("{}", output),
                Ok(Step::Continue(None)) => {}
                Ok(Step::Quit) => break,
                Err(e) => {
                    warn!("Command failed: {}", e);
                    println!("error: {}", e.user_message());
                }
            }
        }

        self.session.cancel();
        info!("Leaving chat");
        Ok(())
    }

    /// Send while echoing the reply and listening for Ctrl-C
    async fn send_interactive(&self, text: &str) -> Result<Step> {
        // Kept until the turn is persisted
        self.session.set_draft(text)?;

        let mut live = LiveReply::stdout(self.session.settings().snapshot().show_timestamps);
        let send = self.session.send(text);
        tokio::pin!(send);
        let mut refresh = tokio::time::interval(REFRESH_INTERVAL);

        let outcome = loop {
            tokio::select! {
                outcome = &mut send => {
                    self.drain(&mut live)?;
                    break outcome?;
                }
                _ = refresh.tick() => self.drain(&mut live)?,
                _ = tokio::signal::ctrl_c() => {
                    debug!("Interrupt, cancelling generation");
                    self.session.cancel();
                }
            }
        };

        Ok(match outcome {
            TurnOutcome::Ignored => Step::Continue(Some("A reply is still being generated.".into())),
            _ => Step::Continue(None),
        })
    }

    fn drain<W: Write>(&self, live: &mut LiveReply<W>) -> Result<()> {
        for event in self.events.try_iter() {
            live.handle(&event)?;
        }
        Ok(())
    }

    /// Execute a command. `Send` runs without echo or interrupt handling.
    pub async fn execute(&self, command: ReplCommand) -> Result<Step> {
        let session = &self.session;
        let show_timestamps = session.settings().snapshot().show_timestamps;

        let output = match command {
            ReplCommand::Send(text) => {
                session.send(&text).await?;
                None
            }
            ReplCommand::New => {
                let conversation = session.new_conversation()?;
                Some(format!("Started conversation {}", conversation.id))
            }
            ReplCommand::List => {
                let conversations = session.history().list()?;
                let active = session.conversation_id();
                Some(format_conversation_list(&conversations, Some(&active)))
            }
            ReplCommand::Switch(id) => {
                let conversation = session.switch(&id)?;
                Some(format_conversation(&conversation, show_timestamps))
            }
            ReplCommand::Model(name) => {
                session.set_model(&name)?;
                Some(format!("Model: {}", name))
            }
            ReplCommand::Models => {
                let models = session.refresh_models().await?;
                Some(format_model_list(&models, &session.settings().snapshot().model))
            }
            ReplCommand::Clear => {
                session.clear_conversation()?;
                Some("Conversation cleared.".into())
            }
            ReplCommand::Export(format) => {
                Some(session.history().export(&session.conversation_id(), format)?)
            }
            ReplCommand::Speak(text) => {
                session.speak(text.as_deref()).await?;
                None
            }
            ReplCommand::Stop => {
                session.stop_speaking()?;
                None
            }
            ReplCommand::Help => Some(HELP.to_string()),
            ReplCommand::Quit => return Ok(Step::Quit),
        };
        Ok(Step::Continue(output))
    }
}
