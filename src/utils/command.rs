use std::process::{Command, Stdio};

#[derive(Debug, Clone)]
pub struct CommandResult {
    pub success: bool,
    pub stdout: String,
    pub stderr: String,
    pub exit_code: Option<i32>,
}

/// Thin typed wrapper around the handful of external binaries the agent
/// drives (`ip`, `iptables-restore`, `iptables-save`, `iptables`). Programs
/// are executed directly, never through a shell, so arguments containing
/// addresses or chain names need no quoting.
pub struct CommandExecutor;

impl CommandExecutor {
    /// Execute a program with arguments and capture the result.
    pub fn execute(program: &str, args: &[&str]) -> Result<CommandResult, String> {
        let output = Command::new(program)
            .args(args)
            .output()
            .map_err(|e| format!("failed to execute '{} {}': {}", program, args.join(" "), e))?;

        Ok(CommandResult {
            success: output.status.success(),
            stdout: String::from_utf8_lossy(&output.stdout).to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).to_string(),
            exit_code: output.status.code(),
        })
    }

    /// Execute a program feeding `input` on stdin. Used for the
    /// iptables-restore batch path where the whole ruleset is one write.
    pub fn execute_with_stdin(
        program: &str,
        args: &[&str],
        input: &str,
    ) -> Result<CommandResult, String> {
        use std::io::Write;

        let mut child = Command::new(program)
            .args(args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| format!("failed to spawn '{}': {}", program, e))?;

        if let Some(stdin) = child.stdin.as_mut() {
            stdin
                .write_all(input.as_bytes())
                .map_err(|e| format!("failed to write stdin to '{}': {}", program, e))?;
        }

        let output = child
            .wait_with_output()
            .map_err(|e| format!("failed to wait for '{}': {}", program, e))?;

        Ok(CommandResult {
            success: output.status.success(),
            stdout: String::from_utf8_lossy(&output.stdout).to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).to_string(),
            exit_code: output.status.code(),
        })
    }

    /// Check if a command is available in the system PATH.
    #[allow(dead_code)]
    pub fn is_command_available(command: &str) -> bool {
        Command::new("which")
            .arg(command)
            .stdout(Stdio::null())
            .status()
            .map(|status| status.success())
            .unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn execute_captures_stdout() {
        let result = CommandExecutor::execute("echo", &["hello"]).unwrap();
        assert!(result.success);
        assert_eq!(result.stdout.trim(), "hello");
    }

    #[test]
    fn execute_reports_failure() {
        let result = CommandExecutor::execute("false", &[]).unwrap();
        assert!(!result.success);
        assert_eq!(result.exit_code, Some(1));
    }

    #[test]
    fn execute_with_stdin_round_trips() {
        let result = CommandExecutor::execute_with_stdin("cat", &[], "line1\nline2\n").unwrap();
        assert!(result.success);
        assert_eq!(result.stdout, "line1\nline2\n");
    }

    #[test]
    fn missing_program_is_an_error() {
        assert!(CommandExecutor::execute("definitely-not-a-real-binary", &[]).is_err());
    }
}
