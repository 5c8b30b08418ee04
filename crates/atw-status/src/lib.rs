use atw_core::thread_contracts::{AgentFlavor, AgentStatus};
use chrono::{DateTime, Duration, Utc};
use regex::Regex;
use std::collections::{BTreeMap, VecDeque};
use tracing::debug;

pub mod profiles;

pub use profiles::{default_profiles, FlavorProfile};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StatusDetectorConfig {
    /// Silence window after the last output chunk before patterns are
    /// re-evaluated.
    pub debounce_ms: u64,
    pub recent_lines_cap: usize,
    /// Flavor whose tables apply before any signature has been seen.
    pub default_flavor: AgentFlavor,
}

impl Default for StatusDetectorConfig {
    fn default() -> Self {
        Self {
            debounce_ms: 500,
            recent_lines_cap: 10,
            default_flavor: AgentFlavor::Claude,
        }
    }
}

#[derive(Debug)]
struct TerminalStatusState {
    status: AgentStatus,
    recent_lines: VecDeque<String>,
    ai_type: Option<AgentFlavor>,
    tool_in_progress: bool,
    last_update: DateTime<Utc>,
    pending_eval_at: Option<DateTime<Utc>>,
}

impl TerminalStatusState {
    fn new(now: DateTime<Utc>) -> Self {
        Self {
            status: AgentStatus::Inactive,
            recent_lines: VecDeque::new(),
            ai_type: None,
            tool_in_progress: false,
            last_update: now,
            pending_eval_at: None,
        }
    }
}

enum Evaluation {
    Idle,
    Waiting,
    StillWorking,
}

type StatusListener = Box<dyn FnMut(&str, AgentStatus)>;
type FlavorListener = Box<dyn FnMut(&str, AgentFlavor)>;

/// Per-terminal status classifier. One entry per terminal id, created on
/// first output and destroyed by `clear`. The debounce is an explicit
/// deadline driven by the caller's clock: feed output with `process_output`
/// and pump expirations with `poll_due`.
pub struct StatusDetector {
    config: StatusDetectorConfig,
    profiles: Vec<FlavorProfile>,
    terminals: BTreeMap<String, TerminalStatusState>,
    status_listeners: Vec<StatusListener>,
    flavor_listeners: Vec<FlavorListener>,
}

impl StatusDetector {
    pub fn new(config: StatusDetectorConfig) -> Self {
        Self::with_profiles(config, profiles::default_profiles())
    }

    pub fn with_profiles(config: StatusDetectorConfig, profiles: Vec<FlavorProfile>) -> Self {
        Self {
            config,
            profiles,
            terminals: BTreeMap::new(),
            status_listeners: Vec::new(),
            flavor_listeners: Vec::new(),
        }
    }

    pub fn on_status_change(&mut self, listener: impl FnMut(&str, AgentStatus) + 'static) {
        self.status_listeners.push(Box::new(listener));
    }

    pub fn on_ai_type_change(&mut self, listener: impl FnMut(&str, AgentFlavor) + 'static) {
        self.flavor_listeners.push(Box::new(listener));
    }

    pub fn process_output(
        &mut self,
        terminal_id: &str,
        hint: Option<AgentFlavor>,
        chunk: &str,
        now: DateTime<Utc>,
    ) {
        let debounce = Duration::milliseconds(self.config.debounce_ms.min(i64::MAX as u64) as i64);
        let detected = detect_flavor(&self.profiles, chunk);

        let chunk_lines: Vec<String> = chunk
            .lines()
            .map(|line| line.trim_end_matches('\r'))
            .filter(|line| !line.trim().is_empty())
            .map(str::to_string)
            .collect();

        let mut status_event = None;
        let mut flavor_event = None;
        {
            let entry = self
                .terminals
                .entry(terminal_id.to_string())
                .or_insert_with(|| TerminalStatusState::new(now));

            for line in &chunk_lines {
                if entry.recent_lines.len() == self.config.recent_lines_cap {
                    entry.recent_lines.pop_front();
                }
                entry.recent_lines.push_back(line.clone());
            }

            // The hint seeds an unknown type silently; a signature match
            // replaces the type wholesale and is the one that notifies.
            if entry.ai_type.is_none() {
                entry.ai_type = hint;
            }
            if let Some(detected) = detected {
                if entry.ai_type != Some(detected) {
                    entry.ai_type = Some(detected);
                    flavor_event = Some(detected);
                }
            }

            let profile = profile_for(
                &self.profiles,
                entry.ai_type.unwrap_or(self.config.default_flavor),
            );
            if let Some(profile) = profile {
                // Tool markers are a property of the chunk itself, never of
                // older buffered lines.
                if chunk_lines
                    .iter()
                    .any(|line| profile.tool_patterns.iter().any(|p| p.is_match(line)))
                {
                    entry.tool_in_progress = true;
                }
            }

            // A chunk ending in an unambiguous idle prompt settles the
            // status in the same call; anything else is proof of activity
            // and arms the debounce window.
            let ends_in_idle_prompt = profile.is_some_and(|profile| {
                chunk_lines
                    .last()
                    .is_some_and(|line| profile.idle_patterns.iter().any(|p| p.is_match(line)))
            });
            if ends_in_idle_prompt {
                entry.tool_in_progress = false;
                entry.pending_eval_at = None;
                if entry.status != AgentStatus::Idle {
                    entry.status = AgentStatus::Idle;
                    status_event = Some(AgentStatus::Idle);
                }
            } else {
                if entry.status != AgentStatus::Working {
                    entry.status = AgentStatus::Working;
                    status_event = Some(AgentStatus::Working);
                }
                entry.pending_eval_at = Some(now + debounce);
            }

            entry.last_update = now;
        }

        if let Some(status) = status_event {
            debug!(event = "status_change", terminal_id, status = %status);
            self.emit_status(terminal_id, status);
        }
        if let Some(flavor) = flavor_event {
            debug!(event = "ai_type_change", terminal_id, flavor = %flavor);
            self.emit_flavor(terminal_id, flavor);
        }
    }

    /// Runs the debounced evaluation for every terminal whose silence window
    /// has elapsed.
    pub fn poll_due(&mut self, now: DateTime<Utc>) {
        let due: Vec<String> = self
            .terminals
            .iter()
            .filter(|(_, entry)| {
                entry
                    .pending_eval_at
                    .is_some_and(|deadline| deadline <= now)
            })
            .map(|(terminal_id, _)| terminal_id.clone())
            .collect();

        for terminal_id in due {
            let mut status_event = None;
            {
                let Some(entry) = self.terminals.get_mut(&terminal_id) else {
                    continue;
                };
                entry.pending_eval_at = None;

                let profile = profile_for(
                    &self.profiles,
                    entry.ai_type.unwrap_or(self.config.default_flavor),
                );
                let Some(profile) = profile else {
                    continue;
                };

                match evaluate(profile, &entry.recent_lines, entry.tool_in_progress) {
                    Evaluation::Idle => {
                        entry.tool_in_progress = false;
                        if entry.status != AgentStatus::Idle {
                            entry.status = AgentStatus::Idle;
                            status_event = Some(AgentStatus::Idle);
                        }
                    }
                    Evaluation::Waiting => {
                        if entry.status != AgentStatus::Waiting {
                            entry.status = AgentStatus::Waiting;
                            status_event = Some(AgentStatus::Waiting);
                        }
                    }
                    // Silence without a recognizable prompt is a slow
                    // in-flight response, not idleness.
                    Evaluation::StillWorking => {}
                }
            }

            if let Some(status) = status_event {
                debug!(event = "status_change", terminal_id = %terminal_id, status = %status);
                self.emit_status(&terminal_id, status);
            }
        }
    }

    /// Earliest outstanding debounce deadline, so a host can schedule its
    /// next `poll_due` wakeup.
    pub fn next_deadline(&self) -> Option<DateTime<Utc>> {
        self.terminals
            .values()
            .filter_map(|entry| entry.pending_eval_at)
            .min()
    }

    pub fn get_status(&self, terminal_id: &str) -> AgentStatus {
        self.terminals
            .get(terminal_id)
            .map(|entry| entry.status)
            .unwrap_or_default()
    }

    pub fn get_ai_type(&self, terminal_id: &str) -> Option<AgentFlavor> {
        self.terminals
            .get(terminal_id)
            .and_then(|entry| entry.ai_type)
    }

    pub fn last_update(&self, terminal_id: &str) -> Option<DateTime<Utc>> {
        self.terminals
            .get(terminal_id)
            .map(|entry| entry.last_update)
    }

    /// Drops all state for the terminal, including any pending deadline, so a
    /// late evaluation cannot resurrect it. No-op for unknown terminals.
    pub fn clear(&mut self, terminal_id: &str) {
        self.terminals.remove(terminal_id);
    }

    fn emit_status(&mut self, terminal_id: &str, status: AgentStatus) {
        for listener in &mut self.status_listeners {
            listener(terminal_id, status);
        }
    }

    fn emit_flavor(&mut self, terminal_id: &str, flavor: AgentFlavor) {
        for listener in &mut self.flavor_listeners {
            listener(terminal_id, flavor);
        }
    }
}

impl Default for StatusDetector {
    fn default() -> Self {
        Self::new(StatusDetectorConfig::default())
    }
}

fn detect_flavor(profiles: &[FlavorProfile], chunk: &str) -> Option<AgentFlavor> {
    profiles
        .iter()
        .find(|profile| {
            profile
                .signature_patterns
                .iter()
                .any(|pattern| pattern.is_match(chunk))
        })
        .map(|profile| profile.flavor)
}

fn profile_for(profiles: &[FlavorProfile], flavor: AgentFlavor) -> Option<&FlavorProfile> {
    profiles.iter().find(|profile| profile.flavor == flavor)
}

fn any_line_matches(patterns: &[Regex], lines: &VecDeque<String>) -> bool {
    lines
        .iter()
        .any(|line| patterns.iter().any(|pattern| pattern.is_match(line)))
}

fn evaluate(
    profile: &FlavorProfile,
    lines: &VecDeque<String>,
    tool_in_progress: bool,
) -> Evaluation {
    if any_line_matches(&profile.idle_patterns, lines) {
        return Evaluation::Idle;
    }
    if any_line_matches(&profile.waiting_patterns, lines) {
        return Evaluation::Waiting;
    }
    if tool_in_progress {
        // A tool invocation with no visible completion marker needs a human.
        return Evaluation::Waiting;
    }
    Evaluation::StillWorking
}
