//! Console input: plain lines are messages, `/` lines are commands.

use std::path::PathBuf;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExportFormat {
    Markdown,
    Obsidian,
    Json,
    JsonFull,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Send(String),
    System(String),
    Tool(String),
    Stop,
    NewChat(Option<String>),
    Chats,
    Select(usize),
    Rename(String),
    Duplicate,
    Delete,
    History,
    Search(String),
    Attach(PathBuf),
    Drop(Vec<PathBuf>),
    Detach(String),
    Paste,
    /// Answer a pending yes/no question
    Confirm(bool),
    /// Pick a transcript track by its 1-based number
    Track(usize),
    Models,
    Model(String),
    Tools,
    EnableTool(String, bool),
    Mic(bool),
    Export(ExportFormat, Option<PathBuf>),
    Quick(String),
    QuickSave,
    Help,
    Quit,
}

pub const HELP: &str = "\
  <text>                 send a message
  /system <text>         add a system message
  /tool <text>           send with tools enabled
  /stop                  stop the current response
  /new [name]            start a chat
  /chats                 list chats
  /select <n>            switch chat
  /rename <name>         rename the current chat
  /dup                   duplicate the current chat
  /delete                delete the current chat
  /history               print the current chat
  /search <term>         find messages
  /attach <path>         attach a file
  /drop <path>...        drop several files
  /detach <name>         remove a pending attachment
  /paste                 paste from the clipboard
  /yes, /no              answer a pending question
  /track <n>             choose a transcript
  /models, /model <name> list or select models
  /tools, /enable <tool>, /disable <tool>
  /mic, /mic off         start or stop speech input
  /export md|obsidian|json|json-full [path]
  /quick <text>, /quick-save
  /quit";

fn number(arg: &str) -> Result<usize, String> {
    arg.trim()
        .parse::<usize>()
        .map_err(|_| format!("expected a number, got '{}'", arg.trim()))
}

fn required(command: &str, arg: &str) -> Result<String, String> {
    let arg = arg.trim();
    if arg.is_empty() {
        Err(format!("/{} needs an argument", command))
    } else {
        Ok(arg.to_string())
    }
}

/// Parse one input line. `None` means there was nothing to do.
pub fn parse(line: &str) -> Option<Result<Command, String>> {
    let line = line.trim_end_matches(['\r', '\n']);
    if line.trim().is_empty() {
        return None;
    }
    let Some(rest) = line.strip_prefix('/') else {
        return Some(Ok(Command::Send(line.to_string())));
    };
    let (name, arg) = rest.split_once(' ').unwrap_or((rest, ""));

    let parsed = match name {
        "system" => required(name, arg).map(Command::System),
        "tool" => required(name, arg).map(Command::Tool),
        "stop" => Ok(Command::Stop),
        "new" => Ok(Command::NewChat(
            Some(arg.trim().to_string()).filter(|a| !a.is_empty()),
        )),
        "chats" => Ok(Command::Chats),
        "select" => number(arg).map(Command::Select),
        "rename" => required(name, arg).map(Command::Rename),
        "dup" => Ok(Command::Duplicate),
        "delete" => Ok(Command::Delete),
        "history" => Ok(Command::History),
        "search" => Ok(Command::Search(arg.trim().to_string())),
        "attach" => required(name, arg).map(|a| Command::Attach(PathBuf::from(a))),
        "drop" => required(name, arg)
            .map(|a| Command::Drop(a.split_whitespace().map(PathBuf::from).collect())),
        "detach" => required(name, arg).map(Command::Detach),
        "paste" => Ok(Command::Paste),
        "yes" => Ok(Command::Confirm(true)),
        "no" => Ok(Command::Confirm(false)),
        "track" => number(arg).map(Command::Track),
        "models" => Ok(Command::Models),
        "model" => required(name, arg).map(Command::Model),
        "tools" => Ok(Command::Tools),
        "enable" => required(name, arg).map(|t| Command::EnableTool(t, true)),
        "disable" => required(name, arg).map(|t| Command::EnableTool(t, false)),
        "mic" => Ok(Command::Mic(arg.trim() != "off")),
        "export" => {
            let mut parts = arg.split_whitespace();
            let format = match parts.next() {
                Some("md") | None => Ok(ExportFormat::Markdown),
                Some("obsidian") => Ok(ExportFormat::Obsidian),
                Some("json") => Ok(ExportFormat::Json),
                Some("json-full") => Ok(ExportFormat::JsonFull),
                Some(other) => Err(format!("unknown export format '{}'", other)),
            };
            format.map(|f| Command::Export(f, parts.next().map(PathBuf::from)))
        }
        "quick" => required(name, arg).map(Command::Quick),
        "quick-save" => Ok(Command::QuickSave),
        "help" => Ok(Command::Help),
        "quit" | "exit" => Ok(Command::Quit),
        other => Err(format!("unknown command /{}", other)),
    };
    Some(parsed)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_plain_text_is_a_message() {
        assert_eq!(parse("hello there"), Some(Ok(Command::Send("hello there".into()))));
        assert_eq!(parse("   "), None);
    }

    #[test]
    fn test_commands_with_arguments() {
        assert_eq!(parse("/system Be brief"), Some(Ok(Command::System("Be brief".into()))));
        assert_eq!(parse("/select 2"), Some(Ok(Command::Select(2))));
        assert_eq!(parse("/new"), Some(Ok(Command::NewChat(None))));
        assert_eq!(
            parse("/drop a.txt b.md"),
            Some(Ok(Command::Drop(vec!["a.txt".into(), "b.md".into()])))
        );
        assert_eq!(
            parse("/export json-full out.json"),
            Some(Ok(Command::Export(ExportFormat::JsonFull, Some("out.json".into()))))
        );
        assert_eq!(parse("/mic off"), Some(Ok(Command::Mic(false))));
    }

    #[test]
    fn test_bad_input_is_reported() {
        assert!(matches!(parse("/select two"), Some(Err(_))));
        assert!(matches!(parse("/rename"), Some(Err(_))));
        assert!(matches!(parse("/frobnicate"), Some(Err(_))));
    }
}
