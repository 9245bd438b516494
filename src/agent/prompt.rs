//! System prompts and message builders for agents.
//!
//! Prompts are the core instructions that define each agent's behavior.
//! Builders assemble the system prompt (template + tool signatures +
//! language context) and the user messages of the task pipeline.

use std::fmt::Write;
use std::path::{Path, PathBuf};

use super::tool::ToolDefinition;

/// System prompt for the main (planning) agent.
pub const MAIN_SYSTEM_PROMPT: &str = r"You are a deep research agent. You answer hard questions by planning, gathering evidence with tools, delegating focused subtasks to sub-agents, and reasoning carefully over what you find.

## Instructions

1. Break the task into concrete sub-questions before acting.
2. Use tools to gather evidence. Prefer primary sources and verify key facts from more than one source when possible.
3. Delegate self-contained subtasks (for example a focused literature search or a calculation) to sub-agents through the `agent_*` tools. Give each sub-agent a complete, standalone task description; it sees nothing else from this conversation.
4. When a tool or sub-agent reports an error, adapt: rephrase, try another tool, or continue without that information.
5. Keep going until you are confident, then stop calling tools.

## Final Answer

When you are done, reply without tool calls and put the final answer inside \boxed{}, for example \boxed{42}. The boxed content must be the bare answer: a number, a name, a short phrase, or a comma-separated list, with no explanation.";

/// System prompt for sub-agents whose template defines none.
pub const SUB_AGENT_SYSTEM_PROMPT: &str = r"You are a focused research sub-agent. You receive one self-contained subtask from a coordinating agent and complete it using the tools available to you.

## Instructions

1. Work only on the subtask you were given.
2. Use tools to find evidence; do not guess facts you can look up.
3. If a tool fails, try an alternative before giving up.
4. When finished, reply without tool calls. Report the answer together with the key evidence and sources the coordinating agent needs. State clearly what you could not determine.";

/// System prompt for the input augmentation call.
pub const AUGMENTATION_SYSTEM_PROMPT: &str = r"You prepare research tasks for an agent. Read the task and write short hints that will help solve it: what kind of answer is expected (unit, format, precision), ambiguities to resolve, and promising places to look.

Do not answer the task. Return only a bullet list of at most five hints.";

/// System prompt for the answer extraction call.
pub const EXTRACTION_SYSTEM_PROMPT: &str = r"You extract final answers. Given a task and an agent's final response, return the single canonical answer the response commits to, inside \boxed{}.

Rules:
- Copy the answer; do not solve the task yourself.
- Use the format the task asks for (units, rounding, list separators).
- If the response contains no answer, return \boxed{} with nothing inside.";

/// User prompt appended when the main agent stops without a boxed answer.
pub const FINAL_SUMMARY_PROMPT: &str = r"You stopped without a final answer. Summarize what you found and give your best final answer now, inside \boxed{}. Do not call any more tools.";

/// Default prompt directory under user config.
const DEFAULT_PROMPT_DIR: &str = ".config/delve/prompts";

/// Filename for the main agent prompt template.
const MAIN_FILENAME: &str = "main.md";
/// Filename for the sub-agent prompt template.
const SUB_AGENT_FILENAME: &str = "sub_agent.md";
/// Filename for the augmentation prompt template.
const AUGMENTATION_FILENAME: &str = "augmentation.md";
/// Filename for the extraction prompt template.
const EXTRACTION_FILENAME: &str = "extraction.md";
/// Filename for the final-summary prompt template.
const FINAL_SUMMARY_FILENAME: &str = "final_summary.md";

/// A set of prompts for all agents and auxiliary calls.
///
/// Loaded from external template files when available, falling back to
/// compiled-in defaults. Agent profiles may override the main and
/// sub-agent prompts per template.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PromptSet {
    /// System prompt for the main agent.
    pub main: String,
    /// Default system prompt for sub-agents.
    pub sub_agent: String,
    /// System prompt for input augmentation.
    pub augmentation: String,
    /// System prompt for answer extraction.
    pub extraction: String,
    /// Follow-up prompt requesting a boxed answer.
    pub final_summary: String,
}

impl PromptSet {
    /// Loads prompts from the given directory, falling back to compiled-in defaults.
    ///
    /// Resolution order for `prompt_dir`:
    /// 1. Explicit `prompt_dir` argument (from `--prompt-dir` or
    ///    `DELVE_PROMPT_DIR`, both resolved by the config builder)
    /// 2. `~/.config/delve/prompts/`
    ///
    /// Each file is loaded independently — a missing file uses its default.
    #[must_use]
    pub fn load(prompt_dir: Option<&Path>) -> Self {
        let resolved_dir = prompt_dir.map(PathBuf::from).or_else(Self::default_dir);

        let load_file = |filename: &str, default: &str| -> String {
            resolved_dir
                .as_ref()
                .map(|dir| dir.join(filename))
                .and_then(|path| std::fs::read_to_string(&path).ok())
                .filter(|s| !s.trim().is_empty())
                .unwrap_or_else(|| default.to_string())
        };

        Self {
            main: load_file(MAIN_FILENAME, MAIN_SYSTEM_PROMPT),
            sub_agent: load_file(SUB_AGENT_FILENAME, SUB_AGENT_SYSTEM_PROMPT),
            augmentation: load_file(AUGMENTATION_FILENAME, AUGMENTATION_SYSTEM_PROMPT),
            extraction: load_file(EXTRACTION_FILENAME, EXTRACTION_SYSTEM_PROMPT),
            final_summary: load_file(FINAL_SUMMARY_FILENAME, FINAL_SUMMARY_PROMPT),
        }
    }

    /// Returns compiled-in defaults without checking the filesystem.
    #[must_use]
    pub fn defaults() -> Self {
        Self {
            main: MAIN_SYSTEM_PROMPT.to_string(),
            sub_agent: SUB_AGENT_SYSTEM_PROMPT.to_string(),
            augmentation: AUGMENTATION_SYSTEM_PROMPT.to_string(),
            extraction: EXTRACTION_SYSTEM_PROMPT.to_string(),
            final_summary: FINAL_SUMMARY_PROMPT.to_string(),
        }
    }

    /// Prompts keyed by template name (the file stem).
    #[must_use]
    pub fn entries(&self) -> [(&'static str, &str); 5] {
        [
            ("main", &self.main),
            ("sub_agent", &self.sub_agent),
            ("augmentation", &self.augmentation),
            ("extraction", &self.extraction),
            ("final_summary", &self.final_summary),
        ]
    }

    /// Writes the compiled-in default prompts to the given directory.
    ///
    /// Creates the directory if it does not exist. Existing files are
    /// **not** overwritten.
    ///
    /// # Errors
    ///
    /// Returns an I/O error if directory creation or file writing fails.
    pub fn write_defaults(dir: &Path) -> std::io::Result<Vec<PathBuf>> {
        std::fs::create_dir_all(dir)?;

        let templates = [
            (MAIN_FILENAME, MAIN_SYSTEM_PROMPT),
            (SUB_AGENT_FILENAME, SUB_AGENT_SYSTEM_PROMPT),
            (AUGMENTATION_FILENAME, AUGMENTATION_SYSTEM_PROMPT),
            (EXTRACTION_FILENAME, EXTRACTION_SYSTEM_PROMPT),
            (FINAL_SUMMARY_FILENAME, FINAL_SUMMARY_PROMPT),
        ];

        let mut written = Vec::new();
        for (filename, content) in &templates {
            let path = dir.join(filename);
            if !path.exists() {
                std::fs::write(&path, content)?;
                written.push(path);
            }
        }

        Ok(written)
    }

    /// Returns the default prompt directory under the user's home.
    ///
    /// Returns `None` if the home directory cannot be determined.
    #[must_use]
    pub fn default_dir() -> Option<PathBuf> {
        dirs::home_dir().map(|h| h.join(DEFAULT_PROMPT_DIR))
    }
}

/// Builds an agent's system prompt.
///
/// Appends a short signature list of the agent's tools and, when a working
/// language is configured, instructions to use it.
#[must_use]
pub fn build_system_prompt(
    template_prompt: &str,
    tools: &[ToolDefinition],
    language: Option<&str>,
) -> String {
    let mut prompt = template_prompt.trim_end().to_string();

    if !tools.is_empty() {
        prompt.push_str("\n\n## Available Tools\n\n");
        for tool in tools {
            let summary = tool.description.lines().next().unwrap_or_default();
            let _ = writeln!(prompt, "- **{}**: {summary}", tool.name);
        }
    }

    if let Some(language) = language.map(str::trim).filter(|l| !l.is_empty()) {
        let _ = write!(
            prompt,
            "\n\n## Language\n\nWork and write in {language}. Search queries may use any \
             language that finds better sources, but every message you write, including the \
             final answer, must be in {language}."
        );
    }

    prompt
}

/// Builds the first user message of the main agent.
#[must_use]
pub fn build_task_prompt(
    instruction: &str,
    attached_file: Option<&str>,
    hints: Option<&str>,
) -> String {
    let mut prompt = instruction.trim().to_string();

    if let Some(file) = attached_file {
        let _ = write!(
            prompt,
            "\n\nAn attached file is available for this task at: {file}\n\
             Use your tools to read it; it is not included in this message."
        );
    }

    if let Some(hints) = hints.map(str::trim).filter(|h| !h.is_empty()) {
        let _ = write!(prompt, "\n\n<hints>\n{hints}\n</hints>");
    }

    prompt
}

/// Builds the user message for the augmentation call.
#[must_use]
pub fn build_augmentation_prompt(instruction: &str) -> String {
    format!("<task>\n{}\n</task>\n\nWrite the hints.", instruction.trim())
}

/// Builds the user message for the extraction call.
#[must_use]
pub fn build_extraction_prompt(instruction: &str, raw_answer: &str) -> String {
    format!(
        "<task>\n{}\n</task>\n\n<response>\n{}\n</response>\n\nExtract the final answer.",
        instruction.trim(),
        raw_answer.trim()
    )
}
