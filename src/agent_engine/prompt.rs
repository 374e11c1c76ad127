use chrono::Local;

const SYSTEM_PROMPT_TEMPLATE: &str = "\
Today is {date}.
You are an agent operating an Android phone to complete the user's task.
Each turn you receive a screenshot and the foreground app. Think about what
you see inside <think></think>, then give exactly one action inside
<answer></answer>.

Coordinates are relative: (0,0) is the top-left corner and (999,999) the
bottom-right corner of the screen.

Actions:
- do(action=\"Launch\", app=\"xxx\")            open an app by name
- do(action=\"Tap\", element=[x,y])             tap a point; add message=\"...\" for payments, deletions and other sensitive taps
- do(action=\"Type\", text=\"xxx\")             type into the focused field (it is cleared first)
- do(action=\"Type_Name\", text=\"xxx\")        type a person's name
- do(action=\"Swipe\", start=[x1,y1], end=[x2,y2])
- do(action=\"Swipe\", points=[[x1,y1],[x2,y2],[x3,y3]])  curved swipe through several points
- do(action=\"Long Press\", element=[x,y])
- do(action=\"Double Tap\", element=[x,y])
- do(action=\"Back\")
- do(action=\"Home\")
- do(action=\"Wait\", duration=\"2 seconds\")
- do(action=\"Take_over\", message=\"xxx\")     ask the user to do a step by hand (login, captcha)
- do(action=\"Interact\", message=\"xxx\")      ask the user to choose or answer
- do(action=\"Note\", message=\"xxx\")          record something you read on screen
- do(action=\"Call_API\", instruction=\"xxx\")  summarise or process what was noted
- finish(message=\"xxx\")                      the task is complete

Rules:
- Check the foreground app before acting; launch the right app first.
- If a page does not load, Wait once or twice, then go Back and retry.
- If an action had no effect, try a different element or a Swipe to find it.
- Never repeat the same failing action more than twice.
- Reply in the same language as the task.";

pub fn system_prompt() -> String {
    SYSTEM_PROMPT_TEMPLATE.replace("{date}", &Local::now().format("%Y-%m-%d, %A").to_string())
}

/// Screen description attached to every user turn.
pub fn screen_info(current_app: &str) -> String {
    serde_json::json!({ "current_app": current_app }).to_string()
}

pub fn first_turn(task: &str, current_app: &str) -> String {
    format!("{task}\n\n** Screen Info **\n\n{}", screen_info(current_app))
}

pub fn next_turn(current_app: &str, last_result: Option<&str>) -> String {
    let mut text = format!("** Screen Info **\n\n{}", screen_info(current_app));
    if let Some(result) = last_result {
        text.push_str("\n\n** Last Action **\n\n");
        text.push_str(result);
    }
    text
}

/// Assistant turn as stored in history.
pub fn assistant_turn(thinking: &str, action: &str) -> String {
    format!("<think>{thinking}</think><answer>{action}</answer>")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_turn_carries_task_and_app() {
        let t = first_turn("open settings", "Launcher");
        assert!(t.starts_with("open settings"));
        assert!(t.contains(r#"{"current_app":"Launcher"}"#));
    }

    #[test]
    fn next_turn_reports_last_result() {
        assert!(!next_turn("Chrome", None).contains("Last Action"));
        assert!(next_turn("Chrome", Some("app not found")).ends_with("app not found"));
    }

    #[test]
    fn system_prompt_has_date_and_actions() {
        let p = system_prompt();
        assert!(!p.contains("{date}"));
        assert!(p.contains("finish(message="));
    }
}
