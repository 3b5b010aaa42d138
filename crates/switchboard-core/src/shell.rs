//! Login-shell command building for the agent binary.
//!
//! The agent runs inside the user's login shell so it sees the same PATH
//! and environment as an interactive terminal. Non-POSIX login shells
//! (fish, nushell, ...) do not accept `-l -c`, so those fall back to bash
//! or sh.

use std::path::Path;
use std::process::Command;

const NON_POSIX_SHELLS: [&str; 6] = ["fish", "nu", "nushell", "elvish", "xonsh", "ion"];

/// Quote a program and its arguments into one shell command line.
pub fn command_line(program: &str, args: &[String]) -> Result<String, String> {
    std::iter::once(program)
        .chain(args.iter().map(String::as_str))
        .map(|part| {
            shlex::try_quote(part)
                .map(|quoted| quoted.into_owned())
                .map_err(|_| format!("Cannot quote argument: {part:?}"))
        })
        .collect::<Result<Vec<_>, _>>()
        .map(|parts| parts.join(" "))
}

/// Build `<shell prefix> '<program args...>'`, run in `working_dir`.
///
/// `shell_prefix` overrides the default `$SHELL -l -c`.
#[cfg(unix)]
pub fn login_shell_command(
    program: &str,
    args: &[String],
    working_dir: Option<&str>,
    shell_prefix: Option<&str>,
) -> Result<Command, String> {
    let prefix = shell_prefix_or_default(shell_prefix);
    let mut prefix_parts = prefix.split_whitespace();
    let shell = prefix_parts
        .next()
        .ok_or_else(|| "Empty shell prefix".to_string())?;

    let mut cmd = Command::new(shell);
    cmd.args(prefix_parts).arg(command_line(program, args)?);
    if let Some(dir) = working_dir {
        cmd.current_dir(dir);
    }
    prepend_program_dir(&mut cmd, program);
    Ok(cmd)
}

#[cfg(windows)]
pub fn login_shell_command(
    program: &str,
    args: &[String],
    working_dir: Option<&str>,
    _shell_prefix: Option<&str>,
) -> Result<Command, String> {
    let mut cmd = Command::new(program);
    cmd.args(args);
    if let Some(dir) = working_dir {
        cmd.current_dir(dir);
    }
    prepend_program_dir(&mut cmd, program);
    Ok(cmd)
}

#[cfg(unix)]
fn shell_prefix_or_default(custom: Option<&str>) -> String {
    if let Some(prefix) = custom.filter(|p| !p.trim().is_empty()) {
        return prefix.to_string();
    }

    let shell = std::env::var("SHELL").unwrap_or_else(|_| "/bin/sh".to_string());
    let name = Path::new(&shell)
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or_default();

    let shell = if NON_POSIX_SHELLS.contains(&name) {
        if Path::new("/bin/bash").exists() {
            "/bin/bash".to_string()
        } else {
            "/bin/sh".to_string()
        }
    } else {
        shell
    };
    format!("{shell} -l -c")
}

/// Put an absolute program's directory first on PATH so interpreters
/// installed next to it (node for a npm-installed CLI) are found.
fn prepend_program_dir(cmd: &mut Command, program: &str) {
    if !program.contains('/') {
        return;
    }
    let Some(dir) = Path::new(program).parent().and_then(|d| d.to_str()) else {
        return;
    };
    let path = match std::env::var("PATH") {
        Ok(existing) if !existing.is_empty() => format!("{dir}:{existing}"),
        _ => dir.to_string(),
    };
    cmd.env("PATH", path);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn command_line_quotes_spaces() {
        let line = command_line(
            "/opt/my tools/claude",
            &["-p".to_string(), "fix the bug".to_string()],
        )
        .unwrap();
        assert_eq!(line, "'/opt/my tools/claude' -p 'fix the bug'");
    }

    #[test]
    fn command_line_leaves_plain_words() {
        let line = command_line("claude", &["--verbose".to_string()]).unwrap();
        assert_eq!(line, "claude --verbose");
    }

    #[test]
    fn command_line_rejects_nul() {
        assert!(command_line("claude", &["a\0b".to_string()]).is_err());
    }

    #[test]
    #[cfg(unix)]
    fn custom_prefix_is_used_verbatim() {
        assert_eq!(shell_prefix_or_default(Some("/bin/zsh -l -c")), "/bin/zsh -l -c");
    }

    #[test]
    #[cfg(unix)]
    fn blank_prefix_falls_back_to_login_shell() {
        assert!(shell_prefix_or_default(Some("  ")).ends_with(" -l -c"));
        assert!(shell_prefix_or_default(None).ends_with(" -l -c"));
    }

    #[test]
    #[cfg(unix)]
    fn login_shell_command_wraps_program() {
        let cmd = login_shell_command(
            "claude",
            &["-p".to_string(), "hello world".to_string()],
            Some("/tmp"),
            Some("/bin/sh -c"),
        )
        .unwrap();

        assert_eq!(cmd.get_program(), "/bin/sh");
        let args: Vec<_> = cmd.get_args().map(|a| a.to_str().unwrap()).collect();
        assert_eq!(args, vec!["-c", "claude -p 'hello world'"]);
        assert_eq!(cmd.get_current_dir(), Some(Path::new("/tmp")));
    }

    #[test]
    #[cfg(unix)]
    fn absolute_program_dir_goes_on_path() {
        let cmd = login_shell_command("/opt/bin/claude", &[], None, Some("/bin/sh -c")).unwrap();
        let path = cmd
            .get_envs()
            .find(|(k, _)| *k == "PATH")
            .and_then(|(_, v)| v)
            .unwrap();
        assert!(path.to_str().unwrap().starts_with("/opt/bin"));
    }
}
