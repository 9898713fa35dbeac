//! Prompt construction for the guidance cycle.

pub const GUIDANCE_SYSTEM_PROMPT: &str = "\
You are Waypost, an assistant that guides a user through software tasks one \
step at a time by looking at their screen.

Rules:
- Describe exactly ONE next action in one or two short sentences.
- When the action targets a visible UI element, append a JSON fragment on \
the same message describing it, for example: \
{\"target\":{\"text\":\"Save\",\"type\":\"button\"},\"coordinates\":{\"x\":100,\"y\":200,\"width\":80,\"height\":30}}
- \"coordinates\" are the CENTER of the element in screenshot pixels.
- Include \"target\" whenever the element has visible text; include \
\"coordinates\" whenever you can estimate them. Either may be omitted.
- If the goal is already accomplished on this screen, start your reply with \
\"Done!\" and congratulate the user instead of giving a step.
- Never mention the JSON fragment in your prose.";

pub fn build_guidance_prompt(goal: &str, previous_guidance: Option<&str>) -> String {
    match previous_guidance {
        Some(prev) => format!(
            "Goal: {goal}\n\nThe previous instruction was: \"{prev}\"\n\n\
             Look at the current screenshot. If the user completed that step, \
             give the next single step toward the goal. If the goal is fully \
             achieved, say so starting with \"Done!\"."
        ),
        None => format!(
            "Goal: {goal}\n\nLook at the screenshot and give the single first \
             step the user should take."
        ),
    }
}

pub const CHAT_SYSTEM_PROMPT: &str = "\
You are Waypost, a friendly on-screen guide. The user is chatting, not asking \
for task help. Reply warmly in at most two sentences.";

/// Canned reply used when no chat model is configured or the call fails.
pub const CANNED_CHAT_REPLY: &str =
    "Hi! Tell me what you're trying to do and I'll point the way on screen.";

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_first_cycle_prompt_has_no_previous_step() {
        let p = build_guidance_prompt("freeze the top row", None);
        assert!(p.contains("freeze the top row"));
        assert!(!p.contains("previous instruction"));
    }

    #[test]
    fn test_followup_prompt_carries_last_guidance() {
        let p = build_guidance_prompt("freeze the top row", Some("Click the View tab."));
        assert!(p.contains("Click the View tab."));
    }
}
