//! Plain-text rendering of messages, conversation lists and live replies

use crate::chat::{AggregatorEvent, ModelInfo};
use crate::messages::{ChatMessage, Conversation, Role};
use chrono::Local;
use std::io::{self, Write};

fn speaker_label(role: Role) -> &'static str {
    match role {
        Role::User => "you",
        Role::Assistant => "assistant",
        Role::System => "system",
    }
}

/// Header line for a message: `[12:04] assistant:`
fn header(message: &ChatMessage, show_timestamps: bool) -> String {
    if show_timestamps {
        let local = message.timestamp.with_timezone(&Local);
        format!("[{}] {}:", local.format("%H:%M"), speaker_label(message.role))
    } else {
        format!("{}:", speaker_label(message.role))
    }
}

/// One finished message, with its error line when generation failed
pub fn format_message(message: &ChatMessage, show_timestamps: bool) -> String {
    let mut out = header(message, show_timestamps);
    if !message.content.is_empty() {
        out.push(' ');
        out.push_str(&message.content);
    }
    if let Some(error) = &message.error {
        out.push_str(&format!(
            "\n  ! {} ({})",
            error.user_message(),
            error.kind.code()
        ));
    }
    out
}

pub fn format_conversation(conversation: &Conversation, show_timestamps: bool) -> String {
    if conversation.messages.is_empty() {
        return format!("-- {} (empty) --", conversation.title);
    }

    let mut lines = vec![format!("-- {} --", conversation.title)];
    lines.extend(
        conversation
            .messages
            .iter()
            .filter(|m| m.role != Role::System)
            .map(|m| format_message(m, show_timestamps)),
    );
    lines.join("\n")
}

/// Conversation list, most recent first, marking the active one with `*`
pub fn format_conversation_list(conversations: &[Conversation], active: Option<&str>) -> String {
    if conversations.is_empty() {
        return "No conversations yet.".to_string();
    }

    conversations
        .iter()
        .map(|c| {
            let marker = if Some(c.id.as_str()) == active { '*' } else { ' ' };
            format!(
                "{} {}  {}  ({} messages, {})",
                marker,
                c.id,
                c.title,
                c.messages.len(),
                c.updated_at.with_timezone(&Local).format("%Y-%m-%d %H:%M")
            )
        })
        .collect::<Vec<_>>()
        .join("\n")
}

pub fn format_model_list(models: &[ModelInfo], current: &str) -> String {
    if models.is_empty() {
        return "The backend offers no models.".to_string();
    }

    models
        .iter()
        .map(|m| {
            let marker = if m.name == current { '*' } else { ' ' };
            match m.size {
                Some(size) => format!("{} {} ({:.1} GB)", marker, m.name, size as f64 / 1e9),
                None => format!("{} {}", marker, m.name),
            }
        })
        .collect::<Vec<_>>()
        .join("\n")
}

/// Prints a reply as it streams.
///
/// Updates carry the full content so far; only the part not yet on screen is
/// written. When the content is rewritten rather than extended the line is
/// started over.
pub struct LiveReply<W: Write> {
    out: W,
    printed: String,
    show_timestamps: bool,
}

impl LiveReply<io::Stdout> {
    pub fn stdout(show_timestamps: bool) -> Self {
        Self::new(io::stdout(), show_timestamps)
    }
}

impl<W: Write> LiveReply<W> {
    pub fn new(out: W, show_timestamps: bool) -> Self {
        Self {
            out,
            printed: String::new(),
            show_timestamps,
        }
    }

    pub fn into_inner(self) -> W {
        self.out
    }

    pub fn handle(&mut self, event: &AggregatorEvent) -> io::Result<()> {
        match event {
            AggregatorEvent::Started { .. } => {
                self.printed.clear();
                write!(self.out, "{}", header(&ChatMessage::assistant(""), self.show_timestamps))?;
                write!(self.out, " ")?;
            }
            AggregatorEvent::Updated { content, .. } => self.extend(content)?,
            AggregatorEvent::Completed { message, .. } => {
                self.extend(&message.content)?;
                writeln!(self.out)?;
            }
            AggregatorEvent::Failed { message, .. } => {
                if self.printed.is_empty() {
                    write!(self.out, "{}", message.content)?;
                }
                writeln!(self.out)?;
                if let Some(error) = &message.error {
                    writeln!(self.out, "  ! {} ({})", error.user_message(), error.kind.code())?;
                }
            }
            AggregatorEvent::Cancelled { .. } => {
                writeln!(self.out, " [stopped]")?;
            }
        }
        self.out.flush()
    }

    fn extend(&mut self, content: &str) -> io::Result<()> {
        match content.strip_prefix(self.printed.as_str()) {
            Some(rest) => write!(self.out, "{}", rest)?,
            None => write!(self.out, "\n{}", content)?,
        }
        self.printed = content.to_string();
        Ok(())
    }
}
