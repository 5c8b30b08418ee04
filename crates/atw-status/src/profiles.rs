use atw_core::thread_contracts::AgentFlavor;
use regex::Regex;

/// Pattern tables for one agent flavor. Profiles are plain data so a host can
/// swap the whole table for a custom agent.
#[derive(Debug, Clone)]
pub struct FlavorProfile {
    pub flavor: AgentFlavor,
    /// Phrases that identify this flavor in raw output.
    pub signature_patterns: Vec<Regex>,
    /// Prompt shapes that mean the agent is idle and ready for input.
    pub idle_patterns: Vec<Regex>,
    /// Permission or confirmation prompts that need a human.
    pub waiting_patterns: Vec<Regex>,
    /// Markers that a tool invocation has started.
    pub tool_patterns: Vec<Regex>,
}

impl FlavorProfile {
    pub fn claude() -> Self {
        Self {
            flavor: AgentFlavor::Claude,
            signature_patterns: compile(&[r"Claude Code", r"\bAnthropic\b", r"claude-\d"]),
            idle_patterns: compile(&[r"^>\s*$", r"\? for shortcuts"]),
            waiting_patterns: compile(&[
                r"Do you want",
                r"(?i)\(y/n\)",
                r"❯\s*1\. Yes",
                r"(?i)grant permission",
            ]),
            tool_patterns: compile(&[r"^⏺", r"^\s*Bash\(", r"(?i)^running…?"]),
        }
    }

    pub fn codex() -> Self {
        Self {
            flavor: AgentFlavor::Codex,
            signature_patterns: compile(&[r"OpenAI Codex", r"Codex CLI", r"\bcodex exec\b"]),
            idle_patterns: compile(&[r"^▌\s*$", r"Ctrl\+C to quit"]),
            waiting_patterns: compile(&[
                r"(?i)allow command\?",
                r"(?i)approve this",
                r"\[y/N\]",
            ]),
            tool_patterns: compile(&[r"^exec\b", r"^\s*\$\s"]),
        }
    }

    pub fn gemini() -> Self {
        Self {
            flavor: AgentFlavor::Gemini,
            signature_patterns: compile(&[r"Gemini CLI", r"gemini-\d"]),
            idle_patterns: compile(&[r"Type your message", r"^>\s*$"]),
            waiting_patterns: compile(&[r"(?i)apply this change\?", r"(?i)\(y/n\)"]),
            tool_patterns: compile(&[r"^✦\s", r"(?i)^shell\b"]),
        }
    }

    pub fn opencode() -> Self {
        Self {
            flavor: AgentFlavor::Opencode,
            signature_patterns: compile(&[r"(?i)\bopencode\b"]),
            idle_patterns: compile(&[r"^❯\s*$"]),
            waiting_patterns: compile(&[r"(?i)permission required", r"(?i)\byes/no\b"]),
            tool_patterns: compile(&[r"(?i)^running tool\b"]),
        }
    }
}

/// Detection order matters: the first profile whose signature matches wins.
pub fn default_profiles() -> Vec<FlavorProfile> {
    vec![
        FlavorProfile::claude(),
        FlavorProfile::codex(),
        FlavorProfile::gemini(),
        FlavorProfile::opencode(),
    ]
}

fn compile(patterns: &[&str]) -> Vec<Regex> {
    patterns
        .iter()
        .map(|pattern| Regex::new(pattern).expect("valid regex"))
        .collect()
}
