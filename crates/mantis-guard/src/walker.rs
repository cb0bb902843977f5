// SPDX-FileCopyrightText: 2026 Mantis Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Static validation of a shell command against a merged guard profile.
//!
//! The command is parsed into a bash-family AST and walked node by node:
//! pipes, redirects, command substitution and backgrounding each require a
//! capability; every simple command's argv must match a command rule. Inline
//! code (`bash -c CODE`) is re-parsed recursively up to a fixed depth so
//! nested shells cannot evade the checks.

use conch_parser::ast;
use conch_parser::lexer::Lexer;
use conch_parser::parse::DefaultParser;

use mantis_core::types::{CommandRule, GuardCapabilities};

use crate::Violation;

/// Nested `bash -c "bash -c ..."` beyond this depth is rejected outright.
const MAX_RECURSION_DEPTH: usize = 3;

/// How many whitelist entries a block message lists before truncating.
const MAX_LISTED: usize = 20;

/// Shells whose `-c` payload is itself shell and gets re-checked.
const SHELLS: &[&str] = &["bash", "sh", "zsh", "dash", "ksh"];

/// Interpreters that turn a pipe or a `-c` flag into arbitrary code execution.
const INTERPRETERS: &[&str] = &[
    "bash", "sh", "zsh", "dash", "ksh", "fish", "python", "python3", "perl", "ruby", "node",
];

const DOWNLOAD_COMMANDS: &[&str] = &["curl", "wget", "aria2c"];
const INSTALL_COMMANDS: &[&str] = &[
    "apt", "apt-get", "yum", "dnf", "apk", "pacman", "snap", "brew", "pip", "pip3", "npm", "gem",
];
// Deletion (rm, shred) is deliberately absent: it is never implied by the
// write-fs capability and must be whitelisted per command.
const WRITE_FS_COMMANDS: &[&str] = &[
    "cp", "mv", "mkdir", "rmdir", "touch", "chmod", "chown", "ln", "dd", "truncate", "tee",
];
const NETWORK_COMMANDS: &[&str] = &[
    "ssh", "scp", "nc", "ncat", "telnet", "traceroute", "dig", "nslookup", "host", "ping",
];
const CRON_COMMANDS: &[&str] = &["crontab", "at", "batch"];

// Concrete instantiations of the parser's default AST.
type Cmd = ast::TopLevelCommand<String>;
type Wrd = ast::TopLevelWord<String>;
type Pipeable = ast::ShellPipeableCommand<String, Wrd, Cmd>;
type Simple = ast::DefaultSimpleCommand;
type Compound = ast::ShellCompoundCommand<String, Wrd, Cmd>;

/// The effective policy after OR-merging capabilities and unioning command
/// rules across profiles.
#[derive(Debug, Clone, Default)]
pub struct MergedProfile {
    pub capabilities: GuardCapabilities,
    pub commands: Vec<CommandRule>,
}

impl MergedProfile {
    fn rules_for(&self, head: &str) -> Vec<&CommandRule> {
        self.commands
            .iter()
            .filter(|r| r.command == head)
            .collect()
    }

    fn allowed_commands(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.commands.iter().map(|r| r.command.as_str()).collect();
        names.sort_unstable();
        names.dedup();
        names
    }
}

/// Validates one shell command against the merged profile. `None` permits.
pub fn check_command(profile: &MergedProfile, command: &str) -> Option<Violation> {
    if profile.capabilities.unrestricted {
        return None;
    }
    check_with_depth(profile, command, 0)
}

fn check_with_depth(profile: &MergedProfile, command: &str, depth: usize) -> Option<Violation> {
    if depth > MAX_RECURSION_DEPTH {
        return Some(Violation::new(
            "recursion-limit",
            format!("nested shell invocations exceed depth {MAX_RECURSION_DEPTH}"),
        ));
    }

    let lex = Lexer::new(command.chars());
    let parser = DefaultParser::new(lex);
    let mut commands: Vec<Cmd> = Vec::new();
    for parsed in parser {
        match parsed {
            Ok(cmd) => commands.push(cmd),
            Err(err) => {
                return Some(Violation::new(
                    "parse-error",
                    format!("cannot parse command: {err}"),
                ))
            }
        }
    }

    let checker = Checker { profile, depth };
    for cmd in &commands {
        if let Some(v) = checker.check_top_level(cmd) {
            return Some(v);
        }
    }
    None
}

struct Checker<'a> {
    profile: &'a MergedProfile,
    depth: usize,
}

impl<'a> Checker<'a> {
    fn caps(&self) -> &GuardCapabilities {
        &self.profile.capabilities
    }

    fn check_top_level(&self, cmd: &Cmd) -> Option<Violation> {
        let (background, list) = match &cmd.0 {
            ast::Command::Job(list) => (true, list),
            ast::Command::List(list) => (false, list),
        };
        if background && !self.caps().background {
            return Some(Violation::new(
                "background-disabled",
                "background execution (&) is not permitted by the active profiles",
            ));
        }

        if let Some(v) = self.check_listable(&list.first) {
            return Some(v);
        }
        for and_or in &list.rest {
            let next = match and_or {
                ast::AndOr::And(c) | ast::AndOr::Or(c) => c,
            };
            if let Some(v) = self.check_listable(next) {
                return Some(v);
            }
        }
        None
    }

    fn check_listable(&self, listable: &ast::ListableCommand<Pipeable>) -> Option<Violation> {
        match listable {
            ast::ListableCommand::Pipe(_, stages) => {
                if !self.caps().pipes {
                    return Some(Violation::new(
                        "pipes-disabled",
                        "pipes (|) are not permitted by the active profiles",
                    ));
                }
                for stage in stages.iter().skip(1) {
                    if let Some(head) = self.pipeable_head(stage) {
                        if INTERPRETERS.contains(&head.as_str()) && !self.caps().code_exec {
                            return Some(Violation::new(
                                "pipe-to-shell",
                                format!("piping into {head} executes arbitrary code and is not permitted"),
                            ));
                        }
                    }
                }
                for stage in stages {
                    if let Some(v) = self.check_pipeable(stage) {
                        return Some(v);
                    }
                }
                None
            }
            ast::ListableCommand::Single(pipeable) => self.check_pipeable(pipeable),
        }
    }

    fn check_pipeable(&self, pipeable: &Pipeable) -> Option<Violation> {
        match pipeable {
            ast::PipeableCommand::Simple(simple) => self.check_simple(simple),
            ast::PipeableCommand::Compound(compound) => self.check_compound(compound),
            ast::PipeableCommand::FunctionDef(_, body) => self.check_compound(body),
        }
    }

    fn check_compound(&self, compound: &Compound) -> Option<Violation> {
        if !compound.io.is_empty() && !self.caps().redirects {
            return Some(self.redirect_violation());
        }
        let each = |cmds: &[Cmd]| -> Option<Violation> {
            for cmd in cmds {
                if let Some(v) = self.check_top_level(cmd) {
                    return Some(v);
                }
            }
            None
        };
        match &compound.kind {
            ast::CompoundCommandKind::Brace(cmds) | ast::CompoundCommandKind::Subshell(cmds) => {
                each(cmds)
            }
            ast::CompoundCommandKind::While(pair) | ast::CompoundCommandKind::Until(pair) => {
                each(&pair.guard).or_else(|| each(&pair.body))
            }
            ast::CompoundCommandKind::If {
                conditionals,
                else_branch,
            } => {
                for pair in conditionals {
                    if let Some(v) = each(&pair.guard).or_else(|| each(&pair.body)) {
                        return Some(v);
                    }
                }
                else_branch.as_ref().and_then(|cmds| each(cmds))
            }
            ast::CompoundCommandKind::For { body, words, .. } => {
                if let Some(words) = words {
                    for word in words {
                        if let Some(v) = self.scan_word(word) {
                            return Some(v);
                        }
                    }
                }
                each(body)
            }
            ast::CompoundCommandKind::Case { word, arms } => {
                if let Some(v) = self.scan_word(word) {
                    return Some(v);
                }
                for arm in arms {
                    if let Some(v) = each(&arm.body) {
                        return Some(v);
                    }
                }
                None
            }
        }
    }

    fn check_simple(&self, simple: &Simple) -> Option<Violation> {
        for item in &simple.redirects_or_env_vars {
            match item {
                ast::RedirectOrEnvVar::Redirect(_) => {
                    if !self.caps().redirects {
                        return Some(self.redirect_violation());
                    }
                }
                ast::RedirectOrEnvVar::EnvVar(_, Some(word)) => {
                    if let Some(v) = self.scan_word(word) {
                        return Some(v);
                    }
                }
                ast::RedirectOrEnvVar::EnvVar(_, None) => {}
            }
        }

        let mut argv: Vec<String> = Vec::new();
        for item in &simple.redirects_or_cmd_words {
            match item {
                ast::RedirectOrCmdWord::Redirect(_) => {
                    if !self.caps().redirects {
                        return Some(self.redirect_violation());
                    }
                }
                ast::RedirectOrCmdWord::CmdWord(word) => {
                    if let Some(v) = self.scan_word(word) {
                        return Some(v);
                    }
                    argv.push(word_literal(word));
                }
            }
        }
        self.check_argv(argv)
    }

    fn pipeable_head(&self, pipeable: &Pipeable) -> Option<String> {
        if let ast::PipeableCommand::Simple(simple) = pipeable {
            for item in &simple.redirects_or_cmd_words {
                if let ast::RedirectOrCmdWord::CmdWord(word) = item {
                    return Some(base_name(&word_literal(word)).to_string());
                }
            }
        }
        None
    }

    /// Checks a word for command substitution and walks any embedded commands.
    fn scan_word(&self, word: &Wrd) -> Option<Violation> {
        let fragments: Vec<_> = match &word.0 {
            ast::ComplexWord::Single(fragment) => vec![fragment],
            ast::ComplexWord::Concat(fragments) => fragments.iter().collect(),
        };
        for fragment in fragments {
            let simple_words: Vec<_> = match fragment {
                ast::Word::Simple(sw) => vec![sw],
                ast::Word::DoubleQuoted(sws) => sws.iter().collect(),
                ast::Word::SingleQuoted(_) => vec![],
            };
            for sw in simple_words {
                if let ast::SimpleWord::Subst(subst) = sw {
                    if let Some(v) = self.check_substitution(subst) {
                        return Some(v);
                    }
                }
            }
        }
        None
    }

    fn check_substitution(
        &self,
        subst: &ast::ParameterSubstitution<
            ast::Parameter<String>,
            Wrd,
            Cmd,
            ast::Arithmetic<String>,
        >,
    ) -> Option<Violation> {
        use ast::ParameterSubstitution::*;
        match subst {
            Command(cmds) => {
                if !self.caps().cmd_subst {
                    return Some(Violation::new(
                        "cmd-subst-disabled",
                        "command substitution ($(...)) is not permitted by the active profiles",
                    ));
                }
                let nested = Checker {
                    profile: self.profile,
                    depth: self.depth + 1,
                };
                if nested.depth > MAX_RECURSION_DEPTH {
                    return Some(Violation::new(
                        "recursion-limit",
                        format!("nested substitutions exceed depth {MAX_RECURSION_DEPTH}"),
                    ));
                }
                for cmd in cmds {
                    if let Some(v) = nested.check_top_level(cmd) {
                        return Some(v);
                    }
                }
                None
            }
            Default(_, _, Some(word))
            | Assign(_, _, Some(word))
            | Error(_, _, Some(word))
            | Alternative(_, _, Some(word))
            | RemoveSmallestSuffix(_, Some(word))
            | RemoveLargestSuffix(_, Some(word))
            | RemoveSmallestPrefix(_, Some(word))
            | RemoveLargestPrefix(_, Some(word)) => self.scan_word(word),
            _ => None,
        }
    }

    fn check_argv(&self, mut argv: Vec<String>) -> Option<Violation> {
        if argv.is_empty() {
            return None;
        }

        if base_name(&argv[0]) == "sudo" {
            if !self.caps().sudo {
                return Some(Violation::new(
                    "sudo-disabled",
                    "sudo is not permitted by the active profiles",
                ));
            }
            argv.remove(0);
        }
        if !argv.is_empty() && base_name(&argv[0]) == "nohup" {
            if !self.caps().background {
                return Some(Violation::new(
                    "background-disabled",
                    "nohup is not permitted by the active profiles",
                ));
            }
            argv.remove(0);
        }
        if argv.is_empty() {
            return None;
        }

        let head = base_name(&argv[0]).to_string();

        // Inline code: `bash -c CODE`, `python -c CODE`, ...
        if INTERPRETERS.contains(&head.as_str()) {
            if let Some(code) = flag_value(&argv, "-c") {
                if !self.caps().code_exec {
                    return Some(Violation::new(
                        "code-exec-disabled",
                        format!("{head} -c executes arbitrary code and is not permitted"),
                    ));
                }
                if let Some(v) = self.require_rule(&head) {
                    return Some(v);
                }
                if SHELLS.contains(&head.as_str()) {
                    return check_with_depth(self.profile, &code, self.depth + 1);
                }
                return None;
            }
        }

        // Capability categories are checked before the whitelist: a disabled
        // capability blocks the whole category regardless of command rules.
        if let Some(v) = self.check_category(&head) {
            return Some(v);
        }

        if let Some(v) = self.require_rule(&head) {
            return Some(v);
        }

        let rules = self.profile.rules_for(&head);

        // SQL clients validate the leading keyword of the query instead of
        // plain arguments.
        if matches!(head.as_str(), "psql" | "mysql" | "sqlite3") {
            return match sql_query(&head, &argv) {
                Some(query) => self.check_sql(&head, &query, &rules),
                // An interactive session can run anything, so a query-
                // restricted rule does not permit one.
                None if rules.iter().all(|r| !r.allowed_sql.is_empty()) => Some(Violation::new(
                    "sql-not-allowed",
                    format!("interactive {head} sessions are not allowed; pass the query inline"),
                )),
                None => None,
            };
        }

        let constrained: Vec<&&CommandRule> =
            rules.iter().filter(|r| !r.allowed_args.is_empty()).collect();
        if !constrained.is_empty() && constrained.len() == rules.len() {
            let first_arg = argv.get(1).cloned().unwrap_or_default();
            let permitted = constrained
                .iter()
                .any(|r| r.allowed_args.iter().any(|a| *a == first_arg));
            if !permitted {
                let mut allowed: Vec<&str> = constrained
                    .iter()
                    .flat_map(|r| r.allowed_args.iter().map(String::as_str))
                    .collect();
                allowed.sort_unstable();
                allowed.dedup();
                return Some(Violation::new(
                    "arg-not-allowed",
                    format!(
                        "argument {first_arg:?} is not allowed for {head}; allowed: {}",
                        truncate_list(&allowed)
                    ),
                ));
            }
        }

        None
    }

    fn require_rule(&self, head: &str) -> Option<Violation> {
        if self.profile.rules_for(head).is_empty() {
            let allowed = self.profile.allowed_commands();
            return Some(Violation::new(
                "command-not-allowed",
                format!(
                    "command {head:?} is not in the whitelist; allowed: {}",
                    truncate_list(&allowed)
                ),
            ));
        }
        None
    }

    fn check_category(&self, head: &str) -> Option<Violation> {
        let caps = self.caps();
        let blocked = if DOWNLOAD_COMMANDS.contains(&head) && !caps.download {
            Some(("download-disabled", "downloading"))
        } else if INSTALL_COMMANDS.contains(&head) && !caps.install {
            Some(("install-disabled", "package installation"))
        } else if WRITE_FS_COMMANDS.contains(&head) && !caps.write_fs {
            Some(("write-fs-disabled", "filesystem writes"))
        } else if NETWORK_COMMANDS.contains(&head) && !caps.network_out {
            Some(("network-out-disabled", "outbound network access"))
        } else if CRON_COMMANDS.contains(&head) && !caps.cron {
            Some(("cron-disabled", "cron manipulation"))
        } else {
            None
        };
        blocked.map(|(rule, what)| {
            Violation::new(
                rule,
                format!("{head} requires the {what} capability, which is disabled"),
            )
        })
    }

    fn check_sql(&self, head: &str, query: &str, rules: &[&CommandRule]) -> Option<Violation> {
        if rules.iter().any(|r| r.allowed_sql.is_empty()) {
            return None;
        }
        let mut allowed: Vec<&str> = rules
            .iter()
            .flat_map(|r| r.allowed_sql.iter().map(String::as_str))
            .collect();
        allowed.sort_unstable();
        allowed.dedup();

        let keyword = leading_sql_keyword(query);
        let permitted = allowed
            .iter()
            .any(|a| a.eq_ignore_ascii_case(&keyword));
        if permitted {
            None
        } else {
            Some(Violation::new(
                "sql-not-allowed",
                format!(
                    "{head} query starting with {keyword:?} is not allowed; allowed: {}",
                    truncate_list(&allowed)
                ),
            ))
        }
    }

    fn redirect_violation(&self) -> Violation {
        Violation::new(
            "redirects-disabled",
            "redirects (>, >>, <) are not permitted by the active profiles",
        )
    }
}

/// Literal text of a word: single-quoted verbatim, double-quoted literal
/// parts only, parameters and substitutions contribute nothing.
fn word_literal(word: &Wrd) -> String {
    let mut out = String::new();
    let fragments: Vec<_> = match &word.0 {
        ast::ComplexWord::Single(fragment) => vec![fragment],
        ast::ComplexWord::Concat(fragments) => fragments.iter().collect(),
    };
    for fragment in fragments {
        match fragment {
            ast::Word::SingleQuoted(lit) => out.push_str(lit),
            ast::Word::Simple(sw) => out.push_str(&simple_word_literal(sw)),
            ast::Word::DoubleQuoted(sws) => {
                for sw in sws {
                    out.push_str(&simple_word_literal(sw));
                }
            }
        }
    }
    out
}

fn simple_word_literal(
    sw: &ast::SimpleWord<
        String,
        ast::Parameter<String>,
        Box<
            ast::ParameterSubstitution<
                ast::Parameter<String>,
                Wrd,
                Cmd,
                ast::Arithmetic<String>,
            >,
        >,
    >,
) -> String {
    use ast::SimpleWord::*;
    match sw {
        Literal(s) | Escaped(s) => s.clone(),
        Star => "*".into(),
        Question => "?".into(),
        SquareOpen => "[".into(),
        SquareClose => "]".into(),
        Tilde => "~".into(),
        Colon => ":".into(),
        Param(_) | Subst(_) => String::new(),
    }
}

fn base_name(token: &str) -> &str {
    token.rsplit('/').next().unwrap_or(token)
}

/// The value following a flag, e.g. the CODE in `bash -c CODE`.
fn flag_value(argv: &[String], flag: &str) -> Option<String> {
    let pos = argv.iter().position(|a| a == flag)?;
    argv.get(pos + 1).cloned()
}

/// Extracts the query text of a SQL client invocation, if any.
fn sql_query(head: &str, argv: &[String]) -> Option<String> {
    match head {
        "psql" => flag_value(argv, "-c"),
        "mysql" => flag_value(argv, "-e"),
        "sqlite3" => {
            if argv.len() >= 3 {
                argv.last().cloned()
            } else {
                None
            }
        }
        _ => None,
    }
}

fn leading_sql_keyword(query: &str) -> String {
    let trimmed = query.trim_start();
    if trimmed.starts_with('\\') {
        // psql meta-command like \dt.
        trimmed
            .split_whitespace()
            .next()
            .unwrap_or(trimmed)
            .to_string()
    } else {
        trimmed
            .split_whitespace()
            .next()
            .unwrap_or("")
            .to_uppercase()
    }
}

fn truncate_list(items: &[&str]) -> String {
    if items.is_empty() {
        return "(none)".to_string();
    }
    if items.len() <= MAX_LISTED {
        items.join(", ")
    } else {
        format!(
            "{} ... and {} more",
            items[..MAX_LISTED].join(", "),
            items.len() - MAX_LISTED
        )
    }
}
