//! Allowlist pattern suggestions for shell commands.
//!
//! A permission request for `git status && npm test | tee out.log` gets the
//! suggestions `git status *`, `npm test *` and `tee *`, so a decider can
//! approve something narrower than the whole tool.

use std::collections::HashSet;
use std::sync::LazyLock;

use regex::Regex;

/// Single-letter flags like -c, -v, -x, whose next word is usually a value.
static SINGLE_LETTER_FLAG: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^-[a-zA-Z]$").expect("valid flag regex"));

/// Commands whose first argument is an operand rather than a subcommand.
///
/// Tools with subcommands (git, npm, cargo, docker, ...) are deliberately
/// absent: their rules are scoped to the subcommand.
static SINGLE_WORD_COMMANDS: LazyLock<HashSet<&'static str>> = LazyLock::new(|| {
    [
        "cd", "ls", "cat", "head", "tail", "less", "echo", "printf", "test", "export", "which",
        "env", "source", "bash", "sh", "zsh", "find", "grep", "rg", "fd", "sed", "awk", "sort",
        "uniq", "wc", "cut", "tr", "diff", "tee", "xargs", "touch", "mkdir", "rm", "rmdir", "cp",
        "mv", "ln", "chmod", "chown", "pwd", "date", "sleep", "ps", "kill", "curl", "wget", "tar",
        "zip", "unzip", "python", "python3", "node", "deno", "ruby", "perl", "make", "jq",
    ]
    .into_iter()
    .collect()
});

/// Suggested allowlist patterns for a shell command, in order, deduplicated.
pub fn suggest_patterns(command: &str) -> Vec<String> {
    let mut seen = HashSet::new();
    split_on_separators(command)
        .into_iter()
        .filter_map(command_prefix)
        .map(|prefix| format!("{prefix} *"))
        .filter(|pattern| seen.insert(pattern.clone()))
        .collect()
}

/// Split on `&&`, `||`, `;` and `|`.
fn split_on_separators(command: &str) -> Vec<&str> {
    let bytes = command.as_bytes();
    let mut parts = Vec::new();
    let mut start = 0;
    let mut i = 0;

    while i < bytes.len() {
        let width = match (bytes[i], bytes.get(i + 1)) {
            (b'&', Some(b'&')) | (b'|', Some(b'|')) => 2,
            (b';', _) | (b'|', _) => 1,
            _ => {
                i += 1;
                continue;
            }
        };
        parts.push(&command[start..i]);
        i += width;
        start = i;
    }
    parts.push(&command[start..]);

    parts.into_iter().filter(|p| !p.trim().is_empty()).collect()
}

/// `ls -la /tmp` → `ls`; `git -C repo commit -m x` → `git commit`.
fn command_prefix(part: &str) -> Option<String> {
    let words: Vec<&str> = part.split_whitespace().collect();
    let first = *words.first()?;

    if SINGLE_WORD_COMMANDS.contains(first) {
        return Some(first.to_string());
    }

    let mut i = 1;
    while i < words.len() {
        let word = words[i];
        if word.starts_with('-') {
            if SINGLE_LETTER_FLAG.is_match(word)
                && words.get(i + 1).is_some_and(|next| !next.starts_with('-'))
            {
                i += 1;
            }
            i += 1;
            continue;
        }
        return Some(format!("{first} {word}"));
    }

    Some(first.to_string())
}
