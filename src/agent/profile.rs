//! Agent profiles: the main template, sub-agent templates and tool servers.
//!
//! Profiles are TOML documents:
//!
//! ```toml
//! [main]
//! max_turns = 40
//! answer_format = "boxed"
//!
//! [sub_agents.browser]
//! description = "Searches the web and reads pages."
//! tools = ["search", "fetch"]
//! max_turns = "unlimited"
//!
//! [[tool_servers]]
//! name = "web"
//! command = "uvx"
//! args = ["web-tools-mcp"]
//! env = { SEARCH_API_KEY = "..." }
//! ```

use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Deserializer, Serialize};

use super::message::SamplingConfig;
use super::tool::DELEGATION_PREFIX;
use crate::error::AgentError;

/// Reference value selecting the built-in profile.
pub const BUILTIN_PROFILE: &str = "default";

/// How an agent signals that it is done.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AnswerFormat {
    /// The answer must be wrapped in `\boxed{...}`.
    Boxed,
    /// Any tool-free response is the answer.
    #[default]
    FreeText,
}

/// Configuration of one agent role.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AgentTemplate {
    /// Template name; filled from the table key for sub-agents.
    #[serde(default)]
    pub name: String,
    /// Shown to the parent in the delegation tool description.
    #[serde(default)]
    pub description: String,
    /// System prompt override; the prompt set is used when absent.
    #[serde(default)]
    pub prompt: Option<String>,
    /// Model override.
    #[serde(default)]
    pub model: Option<String>,
    /// Turn cap: unset uses the configured default, `Some(None)` is unlimited.
    #[serde(
        default,
        deserialize_with = "deserialize_max_turns",
        skip_serializing_if = "Option::is_none"
    )]
    pub max_turns: Option<Option<usize>>,
    /// Backend tools this agent may call; `None` allows all.
    #[serde(default)]
    pub tools: Option<Vec<String>>,
    /// Sub-agent templates this agent may delegate to; `None` allows all.
    #[serde(default)]
    pub sub_agents: Option<Vec<String>>,
    /// Completion signal.
    #[serde(default)]
    pub answer_format: Option<AnswerFormat>,
    /// Sampling overrides.
    #[serde(default)]
    pub sampling: SamplingConfig,
}

impl AgentTemplate {
    /// Resolved answer format for the given role.
    #[must_use]
    pub fn answer_format(&self, is_main: bool) -> AnswerFormat {
        self.answer_format.unwrap_or(if is_main {
            AnswerFormat::Boxed
        } else {
            AnswerFormat::FreeText
        })
    }
}

fn deserialize_max_turns<'de, D>(deserializer: D) -> Result<Option<Option<usize>>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Int(i64),
        Text(String),
    }

    match Raw::deserialize(deserializer)? {
        Raw::Int(-1) => Ok(Some(None)),
        Raw::Int(n) => usize::try_from(n)
            .map(|n| Some(Some(n)))
            .map_err(|_| serde::de::Error::custom(format!("invalid max_turns: {n}"))),
        Raw::Text(s) => super::config::parse_max_turns(&s)
            .map(Some)
            .map_err(serde::de::Error::custom),
    }
}

/// A tool backend started as a child process speaking MCP over stdio.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ToolServerConfig {
    /// Server name, used in logs.
    pub name: String,
    /// Executable.
    pub command: String,
    /// Arguments.
    #[serde(default)]
    pub args: Vec<String>,
    /// Extra environment variables.
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    /// Working directory.
    #[serde(default)]
    pub cwd: Option<PathBuf>,
}

/// A complete agent profile.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Profile {
    /// Main agent template.
    #[serde(default)]
    pub main: AgentTemplate,
    /// Sub-agent templates keyed by name.
    #[serde(default)]
    pub sub_agents: BTreeMap<String, AgentTemplate>,
    /// Tool backends opened for every task.
    #[serde(default)]
    pub tool_servers: Vec<ToolServerConfig>,
}

impl Profile {
    /// Built-in profile: a boxed-answer main agent and one general
    /// research sub-agent, no tool servers.
    #[must_use]
    pub fn builtin() -> Self {
        let researcher = AgentTemplate {
            name: "researcher".to_string(),
            description: "General research assistant for focused lookups and reasoning."
                .to_string(),
            ..AgentTemplate::default()
        };
        Self {
            main: AgentTemplate {
                name: "main".to_string(),
                answer_format: Some(AnswerFormat::Boxed),
                ..AgentTemplate::default()
            },
            sub_agents: BTreeMap::from([(researcher.name.clone(), researcher)]),
            tool_servers: Vec::new(),
        }
    }

    /// Parses and validates a TOML profile.
    ///
    /// # Errors
    ///
    /// Returns [`AgentError::Profile`] on syntax or consistency errors.
    pub fn parse(text: &str) -> Result<Self, AgentError> {
        let mut profile: Self = toml::from_str(text).map_err(|e| AgentError::Profile {
            message: e.to_string(),
        })?;
        if profile.main.name.is_empty() {
            profile.main.name = "main".to_string();
        }
        for (key, template) in &mut profile.sub_agents {
            template.name.clone_from(key);
        }
        profile.validate()?;
        Ok(profile)
    }

    /// Loads a profile file.
    ///
    /// # Errors
    ///
    /// Returns [`AgentError::Profile`] if the file cannot be read or parsed.
    pub fn load(path: &Path) -> Result<Self, AgentError> {
        let text = std::fs::read_to_string(path).map_err(|e| AgentError::Profile {
            message: format!("cannot read {}: {e}", path.display()),
        })?;
        Self::parse(&text).map_err(|e| AgentError::Profile {
            message: format!("{}: {e}", path.display()),
        })
    }

    /// Resolves a task's profile reference: `None` or `"default"` selects
    /// the built-in profile, anything else is a path.
    ///
    /// # Errors
    ///
    /// Returns [`AgentError::Profile`] if the referenced file is invalid.
    pub fn resolve(reference: Option<&str>) -> Result<Self, AgentError> {
        match reference.map(str::trim) {
            None | Some("" | BUILTIN_PROFILE) => Ok(Self::builtin()),
            Some(path) => Self::load(Path::new(path)),
        }
    }

    /// Looks up a sub-agent template.
    #[must_use]
    pub fn sub_agent(&self, name: &str) -> Option<&AgentTemplate> {
        self.sub_agents.get(name)
    }

    /// Templates the given agent may delegate to, in name order.
    #[must_use]
    pub fn delegates_of<'a>(&'a self, template: &AgentTemplate) -> Vec<&'a AgentTemplate> {
        match &template.sub_agents {
            None => self.sub_agents.values().collect(),
            Some(names) => self
                .sub_agents
                .values()
                .filter(|t| names.contains(&t.name))
                .collect(),
        }
    }

    /// Checks names and cross-references.
    ///
    /// # Errors
    ///
    /// Returns [`AgentError::Profile`] describing the first problem.
    pub fn validate(&self) -> Result<(), AgentError> {
        let err = |message: String| Err(AgentError::Profile { message });

        for name in self.sub_agents.keys() {
            if name.is_empty()
                || !name
                    .chars()
                    .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
            {
                return err(format!(
                    "sub-agent name {name:?} must be non-empty ASCII letters, digits, '_' or '-'"
                ));
            }
        }

        let templates = std::iter::once(&self.main).chain(self.sub_agents.values());
        for template in templates {
            for target in template.sub_agents.iter().flatten() {
                if !self.sub_agents.contains_key(target) {
                    return err(format!(
                        "template {:?} delegates to unknown sub-agent {target:?}",
                        template.name
                    ));
                }
            }
            for tool in template.tools.iter().flatten() {
                if tool.starts_with(DELEGATION_PREFIX) {
                    return err(format!(
                        "template {:?} lists {tool:?}; names starting with {DELEGATION_PREFIX:?} \
                         are reserved for delegation",
                        template.name
                    ));
                }
            }
        }

        let mut servers = HashSet::new();
        for server in &self.tool_servers {
            if server.command.trim().is_empty() {
                return err(format!("tool server {:?} has an empty command", server.name));
            }
            if !servers.insert(server.name.as_str()) {
                return err(format!("duplicate tool server name {:?}", server.name));
            }
        }
        Ok(())
    }
}
