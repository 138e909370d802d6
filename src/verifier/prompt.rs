//! Prompt rendering for the screenshot verifier.
//!
//! Both prompts are pure functions of `(task, controlled_os)`. Identical inputs
//! always render byte-identical text.

/// Renders the system and user prompts for one verification call.
#[derive(Debug, Clone)]
pub struct PromptBuilder {
    controlled_os: String,
}

impl PromptBuilder {
    pub fn new(controlled_os: impl Into<String>) -> Self {
        Self {
            controlled_os: controlled_os.into(),
        }
    }

    /// System prompt: role, output contract, extraction policy, worked example.
    pub fn system_prompt(&self) -> String {
        format!(
            r#"You are a verifier.
You help me operate a {os} system.
Based on the screenshot of the current desktop, decide whether the task below has been completed, and report your reasoning and result in the JSON format specified.
You only need to determine whether the web page or software has been opened, or whether the target content has been found.
If the task is to extract text and the result cannot be judged from the screenshot, set "is_completed" to true.

## Output format:
```json
{{
    "thinking": "Describe your thoughts.",
    "is_completed": true or false
}}
```
"thinking" must be a string and "is_completed" must be a JSON boolean.

## Output example:
```json
{{
    "thinking": "The current page shows that GitHub has been opened successfully.",
    "is_completed": true
}}
```
"#,
            os = self.controlled_os
        )
    }

    /// User prompt with the task embedded verbatim.
    pub fn user_prompt(&self, task: &str) -> String {
        format!(
            "\nPlease determine whether the current task has been completed.\n## task:\n{}\n",
            task
        )
    }
}
