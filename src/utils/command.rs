use std::process::Stdio;
use tokio::process::Command;

#[derive(Debug, Clone)]
pub struct CommandResult {
    pub success: bool,
    pub stdout: String,
    pub stderr: String,
    pub exit_code: Option<i32>,
}

pub struct CommandExecutor;

impl CommandExecutor {
    /// Execute a program with explicit arguments (no shell) and capture its output.
    pub async fn execute<S: AsRef<str>>(program: &str, args: &[S]) -> std::io::Result<CommandResult> {
        let output = Command::new(program)
            .args(args.iter().map(|a| a.as_ref()))
            .stdin(Stdio::null())
            .output()
            .await?;

        Ok(CommandResult {
            success: output.status.success(),
            stdout: String::from_utf8_lossy(&output.stdout).to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).to_string(),
            exit_code: output.status.code(),
        })
    }

    /// Execute a program inside the network namespace of `pid`.
    ///
    /// Only the network namespace is entered; the program binary and its
    /// filesystem view stay the bridger's own.
    pub async fn execute_in_netns<S: AsRef<str>>(
        pid: u32,
        program: &str,
        args: &[S],
    ) -> std::io::Result<CommandResult> {
        let mut full: Vec<String> = vec![
            "-t".to_string(),
            pid.to_string(),
            "-n".to_string(),
            "--".to_string(),
            program.to_string(),
        ];
        full.extend(args.iter().map(|a| a.as_ref().to_string()));
        Self::execute("nsenter", &full).await
    }

    /// Render an invocation for logs and error context
    pub fn render<S: AsRef<str>>(program: &str, args: &[S]) -> String {
        let mut rendered = program.to_string();
        for arg in args {
            rendered.push(' ');
            rendered.push_str(arg.as_ref());
        }
        rendered
    }

    /// Check if a command is available in the system PATH
    pub fn is_command_available(command: &str) -> bool {
        std::env::var_os("PATH")
            .map(|paths| {
                std::env::split_paths(&paths).any(|dir| dir.join(command).is_file())
            })
            .unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn render_joins_arguments() {
        let rendered = CommandExecutor::render("iptables", &["-t", "nat", "-A", "OUTPUT"]);
        assert_eq!(rendered, "iptables -t nat -A OUTPUT");
    }

    #[tokio::test]
    async fn execute_captures_output_and_status() {
        let ok = CommandExecutor::execute("sh", &["-c", "echo hello"]).await.unwrap();
        assert!(ok.success);
        assert_eq!(ok.stdout.trim(), "hello");

        let failed = CommandExecutor::execute("sh", &["-c", "echo oops >&2; exit 3"])
            .await
            .unwrap();
        assert!(!failed.success);
        assert_eq!(failed.exit_code, Some(3));
        assert_eq!(failed.stderr.trim(), "oops");
    }

    #[test]
    fn missing_command_is_not_available() {
        assert!(!CommandExecutor::is_command_available("definitely-not-a-real-binary-xyz"));
    }
}
