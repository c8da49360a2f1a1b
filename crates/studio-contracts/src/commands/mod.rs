mod parser;
mod registry;

pub use parser::{parse_command, PanelCommand};
pub use registry::PANEL_HELP_COMMANDS;
