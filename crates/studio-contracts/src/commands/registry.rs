#[derive(Clone, Copy, Debug)]
pub(crate) struct CommandSpec {
    pub command: &'static str,
    pub action: &'static str,
    pub arg: &'static str,
}

const fn spec(command: &'static str, action: &'static str, arg: &'static str) -> CommandSpec {
    CommandSpec {
        command,
        action,
        arg,
    }
}

/// Commands whose whole remainder is one free-form argument.
pub(crate) const RAW_ARG_COMMANDS: &[CommandSpec] = &[
    spec("artwork", "generate_artwork", "prompt"),
    spec("prompt", "set_artwork_prompt", "prompt"),
    spec("count", "set_count", "count"),
    spec("ratio", "set_ratio", "ratio"),
    spec("model", "set_model", "model"),
    spec("mockup_prompt", "add_mockup_prompt", "prompt"),
    spec("template", "use_template", "template"),
    spec("repeat", "set_repeat", "repeat"),
    spec("cancel", "cancel", "kind"),
    spec("save", "save_image", "index"),
    spec("save_all", "save_all", "sku"),
    spec("sku", "set_sku", "sku"),
    spec("upscale", "set_upscale", "value"),
    spec("view", "open_viewer", "index"),
];

pub(crate) const SINGLE_PATH_COMMANDS: &[CommandSpec] = &[
    spec("ref", "add_reference", "path"),
    spec("sample", "add_sample", "path"),
    spec("use", "use_artwork_file", "path"),
];

pub(crate) const NO_ARG_COMMANDS: &[CommandSpec] = &[
    spec("mockup", "generate_mockup", ""),
    spec("apply", "apply_artwork", ""),
    spec("next", "next_preview", ""),
    spec("prev", "prev_preview", ""),
    spec("clear_prompts", "clear_mockup_prompts", ""),
    spec("templates", "list_templates", ""),
    spec("status", "status", ""),
    spec("wait", "wait", ""),
    spec("help", "help", ""),
    spec("quit", "quit", ""),
    spec("exit", "quit", ""),
];

pub const PANEL_HELP_COMMANDS: &[&str] = &[
    "/artwork",
    "/prompt",
    "/count",
    "/ratio",
    "/model",
    "/ref",
    "/next",
    "/prev",
    "/apply",
    "/use",
    "/sample",
    "/mockup_prompt",
    "/template",
    "/templates",
    "/clear_prompts",
    "/repeat",
    "/mockup",
    "/cancel",
    "/wait",
    "/view",
    "/save",
    "/sku",
    "/save_all",
    "/upscale",
    "/status",
    "/quit",
];
