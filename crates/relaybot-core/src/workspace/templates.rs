//! Embedded workspace templates.
//!
//! Seeded into the workspace by `init`. Zone-always files track the package
//! and are overwritten on every init; zone-once files belong to the user
//! after first seeding.

/// Seeding policy for one template.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Zone {
    /// Always overwrite the target.
    Always,
    /// Create only when the target is missing.
    Once,
}

pub struct Template {
    /// Path relative to the workspace directory.
    pub rel_path: &'static str,
    pub zone: Zone,
    pub content: &'static str,
}

/// The two agent-rule file names the synced CLIs read.
pub const RULE_FILE_A: &str = "CLAUDE.md";
pub const RULE_FILE_B: &str = "AGENTS.md";

const RULES: &str = "\
# Workspace rules

You are a personal agent operating from this workspace over a chat bridge.

- Keep replies chat-sized; long output goes into `output_to_user/` as a file.
- Persistent notes live in `memory_system/MAINMEMORY.md`; read it when asked
  about earlier context and update it when something is worth keeping.
- Scheduled work lives under `cron_tasks/<name>/`; each task folder has its
  own `TASK_DESCRIPTION.md` and `<name>_MEMORY.md`.
- Helper scripts for managing schedules and webhooks are in `tools/`.
- Files the user sends arrive under `telegram_files/<date>/`.
";

const MAIN_MEMORY: &str = "\
# Main memory

Long-term notes the agent keeps across sessions. Append dated entries;
prune freely.
";

const CRON_ADD: &str = "\
#!/usr/bin/env sh
# Add a cron job. Usage: cron_add.sh <id> '<5-field schedule>' <task-folder> '<instruction>'
set -eu
ROOT=\"${RELAYBOT_HOME:-$HOME/.relaybot}\"
FILE=\"$ROOT/cron_jobs.json\"
TMP=$(mktemp \"$ROOT/.cron.XXXXXX\")
[ -f \"$FILE\" ] || printf '{\"jobs\": []}' > \"$FILE\"
jq --arg id \"$1\" --arg schedule \"$2\" --arg folder \"$3\" --arg instruction \"$4\" \\
  '.jobs += [{id: $id, title: $id, schedule: $schedule, taskFolder: $folder, instruction: $instruction, enabled: true}]' \\
  \"$FILE\" > \"$TMP\" && mv \"$TMP\" \"$FILE\"
echo \"added $1\"
";

const CRON_LIST: &str = "\
#!/usr/bin/env sh
# List cron jobs.
set -eu
ROOT=\"${RELAYBOT_HOME:-$HOME/.relaybot}\"
jq -r '.jobs[] | \"\\(.id)\\t\\(.schedule)\\t\\(if .enabled then \"on\" else \"off\" end)\"' \\
  \"$ROOT/cron_jobs.json\" 2>/dev/null || echo \"no jobs\"
";

const CRON_REMOVE: &str = "\
#!/usr/bin/env sh
# Remove a cron job by id. Usage: cron_remove.sh <id>
set -eu
ROOT=\"${RELAYBOT_HOME:-$HOME/.relaybot}\"
FILE=\"$ROOT/cron_jobs.json\"
TMP=$(mktemp \"$ROOT/.cron.XXXXXX\")
jq --arg id \"$1\" '.jobs |= map(select(.id != $id))' \"$FILE\" > \"$TMP\" && mv \"$TMP\" \"$FILE\"
echo \"removed $1\"
";

const WEBHOOK_ADD: &str = "\
#!/usr/bin/env sh
# Add a bearer-auth webhook. Usage: webhook_add.sh <id> <wake|task> '<template>' [token]
set -eu
ROOT=\"${RELAYBOT_HOME:-$HOME/.relaybot}\"
FILE=\"$ROOT/webhooks.json\"
TMP=$(mktemp \"$ROOT/.hooks.XXXXXX\")
[ -f \"$FILE\" ] || printf '{\"hooks\": []}' > \"$FILE\"
TOKEN=\"${4:-}\"
jq --arg id \"$1\" --arg mode \"$2\" --arg template \"$3\" --arg token \"$TOKEN\" \\
  '.hooks += [{id: $id, title: $id, mode: $mode, template: $template, enabled: true, auth: {mode: \"bearer\", token: $token}}]' \\
  \"$FILE\" > \"$TMP\" && mv \"$TMP\" \"$FILE\"
echo \"added $1\"
";

const WEBHOOK_LIST: &str = "\
#!/usr/bin/env sh
# List webhooks with trigger stats.
set -eu
ROOT=\"${RELAYBOT_HOME:-$HOME/.relaybot}\"
jq -r '.hooks[] | \"\\(.id)\\t\\(.mode)\\t\\(.triggerCount // 0) triggers\\t\\(.lastError // \"ok\")\"' \\
  \"$ROOT/webhooks.json\" 2>/dev/null || echo \"no hooks\"
";

const SEND_FILE: &str = "\
#!/usr/bin/env sh
# Stage a file for the user: copies it into output_to_user/ where the bot
# picks it up via /files.
set -eu
ROOT=\"${RELAYBOT_HOME:-$HOME/.relaybot}\"
cp \"$1\" \"$ROOT/workspace/output_to_user/\"
echo \"staged $(basename \"$1\")\"
";

const USER_TOOLS_README: &str = "\
# User tools

Drop your own scripts here; the agent can run them from any session.
";

const SKILLS_README: &str = "\
# Skills

One directory per skill, each with a `SKILL.md`. Skills placed here are
mirrored into the agent CLIs' own skill directories automatically.
";

const OUTPUT_README: &str = "\
# Output to user

Files written here are offered to the user in chat via /files and cleaned
up by the retention sweeper.
";

pub static TEMPLATES: &[Template] = &[
    // Rule files and the framework tool scripts track the package.
    Template {
        rel_path: "CLAUDE.md",
        zone: Zone::Always,
        content: RULES,
    },
    Template {
        rel_path: "AGENTS.md",
        zone: Zone::Always,
        content: RULES,
    },
    Template {
        rel_path: "tools/cron_tools/cron_add.sh",
        zone: Zone::Always,
        content: CRON_ADD,
    },
    Template {
        rel_path: "tools/cron_tools/cron_list.sh",
        zone: Zone::Always,
        content: CRON_LIST,
    },
    Template {
        rel_path: "tools/cron_tools/cron_remove.sh",
        zone: Zone::Always,
        content: CRON_REMOVE,
    },
    Template {
        rel_path: "tools/webhook_tools/webhook_add.sh",
        zone: Zone::Always,
        content: WEBHOOK_ADD,
    },
    Template {
        rel_path: "tools/webhook_tools/webhook_list.sh",
        zone: Zone::Always,
        content: WEBHOOK_LIST,
    },
    // Everything else belongs to the user once seeded.
    Template {
        rel_path: "memory_system/MAINMEMORY.md",
        zone: Zone::Once,
        content: MAIN_MEMORY,
    },
    Template {
        rel_path: "tools/telegram_tools/send_file.sh",
        zone: Zone::Once,
        content: SEND_FILE,
    },
    Template {
        rel_path: "tools/user_tools/README.md",
        zone: Zone::Once,
        content: USER_TOOLS_README,
    },
    Template {
        rel_path: "skills/README.md",
        zone: Zone::Once,
        content: SKILLS_README,
    },
    Template {
        rel_path: "output_to_user/README.md",
        zone: Zone::Once,
        content: OUTPUT_README,
    },
];
