//! Prompt hooks applied before each outgoing call.
//!
//! A hook can contribute text to the appended-system section of the
//! request. The only built-in hook nudges the agent to re-read its memory
//! file every sixth message of a session.

/// Context a hook sees for one outgoing call.
pub struct HookContext {
    pub chat_id: i64,
    /// 1-based number of the message about to be sent in this session.
    pub message_number: u64,
    pub is_new_session: bool,
}

pub trait PromptHook: Send + Sync {
    /// Extra appended-system text, if the hook wants to contribute.
    fn before_send(&self, ctx: &HookContext) -> Option<String>;
}

/// Every 6th outgoing message, remind the agent to consult its memory file.
pub struct MemoryReminderHook;

const REMINDER_INTERVAL: u64 = 6;

impl PromptHook for MemoryReminderHook {
    fn before_send(&self, ctx: &HookContext) -> Option<String> {
        if ctx.message_number > 0 && ctx.message_number % REMINDER_INTERVAL == 0 {
            Some(
                "Before answering, check your memory file for relevant notes, \
                 and record anything from this conversation worth keeping: \
                 preferences, decisions, open threads. Keep it brief."
                    .to_string(),
            )
        } else {
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx(message_number: u64) -> HookContext {
        HookContext {
            chat_id: 1,
            message_number,
            is_new_session: false,
        }
    }

    #[test]
    fn test_fires_every_sixth_message() {
        let hook = MemoryReminderHook;
        for n in [1, 2, 3, 4, 5, 7, 11] {
            assert!(hook.before_send(&ctx(n)).is_none(), "message {n}");
        }
        for n in [6, 12, 18] {
            assert!(hook.before_send(&ctx(n)).is_some(), "message {n}");
        }
    }
}
