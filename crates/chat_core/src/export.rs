//! Markdown and JSON renderings of a chat.

use anyhow::Result;
use chrono::Local;
use serde::Serialize;
use shared::{Attachment, Chat, Message, Role};
use std::fmt::Write as _;

fn role_heading(message: &Message) -> String {
    let role = match message.role {
        Role::User => "User",
        Role::System => "System",
        Role::Tool => "Tool",
        Role::Assistant => "Assistant",
    };
    match (&message.role, &message.model_name) {
        (Role::Assistant, Some(model)) => {
            format!("**{}** ({})", role, providers::display_name(model))
        }
        _ => format!("**{}**", role),
    }
}

fn attachment_body(attachment: &Attachment) -> &str {
    if attachment.kind.is_image() {
        "(image)"
    } else {
        attachment.content.trim_end()
    }
}

fn write_attachment(out: &mut String, attachment: &Attachment, obsidian: bool) {
    if obsidian {
        let _ = writeln!(out, "> [!note]- {} ({})", attachment.name, attachment.kind);
        for line in attachment_body(attachment).lines() {
            let _ = writeln!(out, "> {}", line);
        }
        out.push('\n');
    } else {
        let _ = writeln!(out, "**Attachment:** {} ({})\n", attachment.name, attachment.kind);
        let _ = writeln!(out, "```\n{}\n```\n", attachment_body(attachment));
    }
}

/// One heading per message, then its text and attachments.
pub fn export_markdown(chat: &Chat, messages: &[Message], obsidian: bool) -> String {
    let mut out = format!("# {}\n\n", chat.name);
    for message in messages {
        let when = message.timestamp.with_timezone(&Local).format("%Y/%m/%d %H:%M");
        let _ = writeln!(out, "---\n\n### {} | {}\n", role_heading(message), when);
        if !message.text.is_empty() {
            let _ = writeln!(out, "{}\n", message.text.trim_end());
        }
        for attachment in &message.attachments {
            write_attachment(&mut out, attachment, obsidian);
        }
    }
    out
}

#[derive(Serialize)]
struct BareMessage<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Serialize)]
struct FullExport<'a> {
    chat: &'a Chat,
    messages: &'a [Message],
}

/// `[{role, content}]` in the shape chat APIs accept, or the full records
/// with ids, timestamps, models and attachments.
pub fn export_json(chat: &Chat, messages: &[Message], include_metadata: bool) -> Result<String> {
    if include_metadata {
        return Ok(serde_json::to_string_pretty(&FullExport { chat, messages })?);
    }
    let bare: Vec<BareMessage> = messages
        .iter()
        .map(|m| BareMessage {
            role: m.role.as_str(),
            content: &m.text,
        })
        .collect();
    Ok(serde_json::to_string_pretty(&bare)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use shared::AttachmentType;

    fn sample() -> (Chat, Vec<Message>) {
        let chat = Chat::new("Groceries");
        let mut question = Message::new(Role::User, "What should I buy?");
        question.attachments.push(Attachment::new(
            "list.txt",
            AttachmentType::PlainText,
            "milk\neggs",
            None,
        ));
        let mut answer = Message::placeholder("llama3.2:3b");
        answer.text = "Bread.".into();
        (chat, vec![question, answer])
    }

    #[test]
    fn test_markdown_headings_and_attachments() {
        let (chat, messages) = sample();
        let md = export_markdown(&chat, &messages, false);
        assert!(md.starts_with("# Groceries\n\n---\n\n### **User** | "));
        assert!(md.contains("### **Assistant** (Llama3.2 (3B)) | "));
        assert!(md.contains("**Attachment:** list.txt (plain_text)\n\n```\nmilk\neggs\n```"));
        assert!(md.contains("Bread."));
    }

    #[test]
    fn test_obsidian_uses_callouts() {
        let (chat, messages) = sample();
        let md = export_markdown(&chat, &messages, true);
        assert!(md.contains("> [!note]- list.txt (plain_text)\n> milk\n> eggs\n"));
        assert!(!md.contains("```"));
    }

    #[test]
    fn test_json_bare_and_full() {
        let (chat, messages) = sample();
        let bare: serde_json::Value =
            serde_json::from_str(&export_json(&chat, &messages, false).unwrap()).unwrap();
        assert_eq!(
            bare,
            serde_json::json!([
                {"role": "user", "content": "What should I buy?"},
                {"role": "assistant", "content": "Bread."}
            ])
        );

        let full: serde_json::Value =
            serde_json::from_str(&export_json(&chat, &messages, true).unwrap()).unwrap();
        assert_eq!(full["chat"]["name"], "Groceries");
        assert_eq!(full["messages"][1]["model_name"], "llama3.2:3b");
        assert_eq!(full["messages"][0]["attachments"][0]["name"], "list.txt");
    }
}
