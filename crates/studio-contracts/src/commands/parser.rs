use std::collections::BTreeMap;

use serde_json::Value;

use super::registry::{CommandSpec, NO_ARG_COMMANDS, RAW_ARG_COMMANDS, SINGLE_PATH_COMMANDS};

/// One line of panel input resolved to an action and its arguments.
#[derive(Debug, Clone, PartialEq)]
pub struct PanelCommand {
    pub action: String,
    pub raw: String,
    pub command_args: BTreeMap<String, Value>,
}

impl PanelCommand {
    fn new(action: &str, raw: &str) -> Self {
        Self {
            action: action.to_string(),
            raw: raw.to_string(),
            command_args: BTreeMap::new(),
        }
    }

    fn with_arg(mut self, key: &str, value: impl Into<String>) -> Self {
        self.command_args
            .insert(key.to_string(), Value::String(value.into()));
        self
    }

    pub fn arg(&self, key: &str) -> Option<&str> {
        self.command_args
            .get(key)
            .and_then(Value::as_str)
            .map(str::trim)
            .filter(|value| !value.is_empty())
    }
}

fn find_spec(command: &str, specs: &[CommandSpec]) -> Option<CommandSpec> {
    specs.iter().find(|spec| spec.command == command).copied()
}

fn parse_single_path_arg(arg: &str) -> String {
    if arg.trim().is_empty() {
        return String::new();
    }
    match shell_words::split(arg) {
        Ok(parts) => parts
            .into_iter()
            .filter(|value| !value.is_empty())
            .collect::<Vec<String>>()
            .join(" "),
        Err(_) => arg.trim().to_string(),
    }
}

/// Plain text is an artwork prompt; `/name rest` is a command.
pub fn parse_command(text: &str) -> PanelCommand {
    let trimmed = text.trim();
    if trimmed.is_empty() {
        return PanelCommand::new("noop", text);
    }

    let Some(slash_tail) = trimmed.strip_prefix('/') else {
        return PanelCommand::new("generate_artwork", text).with_arg("prompt", trimmed);
    };
    let command_len = slash_tail
        .chars()
        .take_while(|ch| ch.is_ascii_alphanumeric() || *ch == '_')
        .count();
    if command_len == 0 {
        return PanelCommand::new("generate_artwork", text).with_arg("prompt", trimmed);
    }

    let command = slash_tail[..command_len].to_ascii_lowercase();
    let arg = slash_tail[command_len..].trim();

    if let Some(spec) = find_spec(&command, RAW_ARG_COMMANDS) {
        return PanelCommand::new(spec.action, text).with_arg(spec.arg, arg);
    }
    if let Some(spec) = find_spec(&command, SINGLE_PATH_COMMANDS) {
        return PanelCommand::new(spec.action, text).with_arg(spec.arg, parse_single_path_arg(arg));
    }
    if let Some(spec) = find_spec(&command, NO_ARG_COMMANDS) {
        return PanelCommand::new(spec.action, text);
    }

    PanelCommand::new("unknown", text)
        .with_arg("command", command)
        .with_arg("arg", arg)
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::parse_command;

    #[test]
    fn plain_text_generates_artwork() {
        let command = parse_command("  red circle on white  ");
        assert_eq!(command.action, "generate_artwork");
        assert_eq!(command.arg("prompt"), Some("red circle on white"));
    }

    #[test]
    fn blank_line_is_noop() {
        assert_eq!(parse_command("   ").action, "noop");
    }

    #[test]
    fn raw_arg_commands_keep_remainder() {
        let ratio = parse_command("/ratio 16:9");
        assert_eq!(ratio.action, "set_ratio");
        assert_eq!(ratio.arg("ratio"), Some("16:9"));

        let prompt = parse_command("/mockup_prompt mug on a desk, soft light");
        assert_eq!(prompt.action, "add_mockup_prompt");
        assert_eq!(prompt.arg("prompt"), Some("mug on a desk, soft light"));

        let cancel = parse_command("/CANCEL mockup");
        assert_eq!(cancel.action, "cancel");
        assert_eq!(cancel.arg("kind"), Some("mockup"));

        let artwork = parse_command("/artwork");
        assert_eq!(artwork.action, "generate_artwork");
        assert_eq!(artwork.arg("prompt"), None);
    }

    #[test]
    fn path_commands_unquote() {
        let reference = parse_command("/ref \"/tmp/floral a.png\"");
        assert_eq!(reference.action, "add_reference");
        assert_eq!(reference.command_args["path"], json!("/tmp/floral a.png"));

        let sample = parse_command("/sample towel.png");
        assert_eq!(sample.action, "add_sample");
        assert_eq!(sample.arg("path"), Some("towel.png"));

        let artwork = parse_command("/use 'art.png");
        assert_eq!(artwork.action, "use_artwork_file");
        assert_eq!(artwork.arg("path"), Some("'art.png"));
    }

    #[test]
    fn no_arg_commands() {
        assert_eq!(parse_command("/mockup").action, "generate_mockup");
        assert_eq!(parse_command("/apply").action, "apply_artwork");
        assert_eq!(parse_command("/exit").action, "quit");
    }

    #[test]
    fn unknown_command_is_reported() {
        let command = parse_command("/magic foo bar");
        assert_eq!(command.action, "unknown");
        assert_eq!(command.command_args["command"], json!("magic"));
        assert_eq!(command.command_args["arg"], json!("foo bar"));
    }
}
