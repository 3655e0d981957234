//! [`WorkSpec`] — the polymorphic description of one unit of work.
//!
//! Modeled as a tagged variant rather than a trait-object hierarchy: the
//! executor dispatches on `kind` and every variant shares the same
//! logging/cancellation wrapper in [`crate::executor`].

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// The shell to invoke a [`WorkSpec::Shell`] command with.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Shell {
    Cmd,
    Powershell,
    Pwsh,
    Bash,
    Sh,
}

impl Shell {
    /// The platform default: `cmd` on Windows, `sh` elsewhere.
    #[must_use]
    pub const fn platform_default() -> Self {
        if cfg!(windows) { Self::Cmd } else { Self::Sh }
    }

    /// The executable name to spawn for this shell.
    #[must_use]
    pub const fn program(self) -> &'static str {
        match self {
            Self::Cmd => "cmd",
            Self::Powershell => "powershell",
            Self::Pwsh => "pwsh",
            Self::Bash => "bash",
            Self::Sh => "sh",
        }
    }

    /// The flag this shell uses to run a single inline script.
    #[must_use]
    pub const fn script_flag(self) -> &'static str {
        match self {
            Self::Cmd => "/C",
            Self::Powershell | Self::Pwsh => "-Command",
            Self::Bash | Self::Sh => "-c",
        }
    }
}

/// What phase a failed attempt should be resumed from on auto-heal/retry.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResumePhase {
    Prechecks,
    Work,
    Postchecks,
}

/// Per-work-spec failure handling policy.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OnFailure {
    /// If `true`, the pipeline never auto-heals this work's failures.
    #[serde(default)]
    pub no_auto_heal: bool,
    /// A message surfaced alongside the failure (e.g. troubleshooting hint).
    #[serde(default)]
    pub message: Option<String>,
    /// Which phase a retry should resume from.
    #[serde(default)]
    pub resume_from_phase: Option<ResumePhase>,
}

/// A process invocation: executable plus argv, no shell involved.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessSpec {
    pub executable: String,
    #[serde(default)]
    pub args: Vec<String>,
}

/// A shell command run via a named shell.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShellSpec {
    pub command: String,
    #[serde(default = "Shell::platform_default")]
    pub shell: Shell,
}

/// An AI-agent invocation.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentSpec {
    /// Markdown instructions handed to the agent verbatim.
    pub instructions: String,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub max_turns: Option<u32>,
    #[serde(default)]
    pub context_files: Vec<String>,
    /// Whether a retry should resume the previous session. Defaults to
    /// `true` — only an explicit `false` disables resumption.
    #[serde(default)]
    pub resume_session: Option<bool>,
}

impl AgentSpec {
    /// Effective resume policy: resume unless explicitly disabled.
    #[must_use]
    pub fn should_resume(&self) -> bool {
        self.resume_session.unwrap_or(true)
    }
}

/// The work a node's pipeline executes in the `work` step (and, when
/// reused for prechecks/postchecks, in those steps too).
///
/// A bare string is normalized at construction time via
/// [`WorkSpec::from_string`] into either [`WorkSpec::Agent`] (prefixed with
/// `"@agent "`) or [`WorkSpec::Shell`] (the platform default shell).
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum WorkSpec {
    Process {
        #[serde(flatten)]
        spec: ProcessSpec,
        #[serde(default)]
        on_failure: Option<OnFailure>,
    },
    Shell {
        #[serde(flatten)]
        spec: ShellSpec,
        #[serde(default)]
        on_failure: Option<OnFailure>,
    },
    Agent {
        #[serde(flatten)]
        spec: AgentSpec,
        #[serde(default)]
        on_failure: Option<OnFailure>,
    },
}

const AGENT_PREFIX: &str = "@agent ";

impl WorkSpec {
    /// Normalize a raw string into a [`WorkSpec::Agent`] or [`WorkSpec::Shell`].
    #[must_use]
    pub fn from_string(raw: &str) -> Self {
        if let Some(rest) = raw.strip_prefix(AGENT_PREFIX) {
            Self::Agent {
                spec: AgentSpec {
                    instructions: rest.trim().to_owned(),
                    model: None,
                    max_turns: None,
                    context_files: Vec::new(),
                    resume_session: None,
                },
                on_failure: None,
            }
        } else {
            Self::Shell {
                spec: ShellSpec { command: raw.to_owned(), shell: Shell::platform_default() },
                on_failure: None,
            }
        }
    }

    /// The failure policy attached to this work spec, if any.
    #[must_use]
    pub const fn on_failure(&self) -> Option<&OnFailure> {
        match self {
            Self::Process { on_failure, .. }
            | Self::Shell { on_failure, .. }
            | Self::Agent { on_failure, .. } => on_failure.as_ref(),
        }
    }

    /// Whether this work spec is eligible for auto-heal on failure.
    #[must_use]
    pub fn auto_healable(&self) -> bool {
        !self.on_failure().is_some_and(|f| f.no_auto_heal)
    }
}

/// Environment overrides for a single work execution; plan-wide values are
/// merged first, node-level values win.
pub type EnvMap = BTreeMap<String, String>;
