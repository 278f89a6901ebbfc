//! Slash-command registry.
//!
//! A static table with exact-match-then-prefix dispatch. Prefix entries
//! match `name` followed by a space and arguments (`/model sonnet`).
//! Unknown commands fall through to free-text routing.

/// Parsed command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Help,
    Status,
    New,
    /// `None` opens the model wizard; `Some` switches directly.
    Model(Option<String>),
    Memory,
    CronList,
    Diagnose,
    /// `None` lists output files; `Some` fetches one by name.
    Files(Option<String>),
}

struct CommandSpec {
    name: &'static str,
    /// Allows `<name> <args>` in addition to the exact form.
    prefix: bool,
    /// Bypasses the per-chat lane in the pipeline.
    quick: bool,
    build: fn(Option<&str>) -> Command,
}

static COMMANDS: &[CommandSpec] = &[
    CommandSpec {
        name: "/help",
        prefix: false,
        quick: false,
        build: |_| Command::Help,
    },
    CommandSpec {
        name: "/status",
        prefix: false,
        quick: true,
        build: |_| Command::Status,
    },
    CommandSpec {
        name: "/new",
        prefix: false,
        quick: false,
        build: |_| Command::New,
    },
    CommandSpec {
        name: "/model",
        prefix: true,
        quick: true,
        build: |args| Command::Model(args.map(str::to_string)),
    },
    CommandSpec {
        name: "/memory",
        prefix: false,
        quick: true,
        build: |_| Command::Memory,
    },
    CommandSpec {
        name: "/cron",
        prefix: false,
        quick: true,
        build: |_| Command::CronList,
    },
    CommandSpec {
        name: "/diagnose",
        prefix: false,
        quick: true,
        build: |_| Command::Diagnose,
    },
    CommandSpec {
        name: "/files",
        prefix: true,
        quick: true,
        build: |args| Command::Files(args.map(str::to_string)),
    },
];

/// Exact match first, then prefix-with-trailing-space.
pub fn dispatch(text: &str) -> Option<Command> {
    let text = text.trim();
    for spec in COMMANDS {
        if text == spec.name {
            return Some((spec.build)(None));
        }
    }
    for spec in COMMANDS.iter().filter(|s| s.prefix) {
        if let Some(rest) = text.strip_prefix(spec.name) {
            if let Some(args) = rest.strip_prefix(' ') {
                let args = args.trim();
                if !args.is_empty() {
                    return Some((spec.build)(Some(args)));
                }
            }
        }
    }
    None
}

/// Whether this text is a read-only command that may bypass the per-chat
/// lane. The bare model wizard is quick (the pipeline adds a busy check);
/// `/model <name>` mutates the session and is not.
pub fn is_quick_command(text: &str) -> bool {
    let text = text.trim();
    for spec in COMMANDS {
        if text == spec.name {
            return spec.quick;
        }
    }
    // Prefix forms: only the file browser fetch stays read-only.
    text.strip_prefix("/files ")
        .map(|rest| !rest.trim().is_empty())
        .unwrap_or(false)
}
