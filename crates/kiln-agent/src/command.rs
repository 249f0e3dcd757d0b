use std::time::Duration;

use tokio::{io::AsyncWriteExt, process::ChildStdin};

use crate::error::{Result, SupervisorError};

const COMMAND_WRITE_TIMEOUT: Duration = Duration::from_secs(5);
const MAX_COMMAND_BYTES: usize = 4096;

/// Normalise console input into a single command line.
pub(crate) fn validate_command(text: &str) -> Result<&str> {
    let cmd = text.strip_suffix('\n').unwrap_or(text);
    let cmd = cmd.strip_suffix('\r').unwrap_or(cmd);
    if cmd.trim().is_empty() {
        return Err(SupervisorError::InvalidCommand("command is empty"));
    }
    if cmd.contains(['\n', '\r']) {
        return Err(SupervisorError::InvalidCommand(
            "command must be a single line",
        ));
    }
    if cmd.len() > MAX_COMMAND_BYTES {
        return Err(SupervisorError::InvalidCommand("command is too long"));
    }
    Ok(cmd)
}

/// Write `cmd` plus a newline to the server console.
pub(crate) async fn write_line(stdin: &mut ChildStdin, cmd: &str) -> std::io::Result<()> {
    let mut buf = Vec::with_capacity(cmd.len() + 1);
    buf.extend_from_slice(cmd.as_bytes());
    buf.push(b'\n');

    let write = async {
        stdin.write_all(&buf).await?;
        stdin.flush().await
    };
    match tokio::time::timeout(COMMAND_WRITE_TIMEOUT, write).await {
        Ok(res) => res,
        Err(_) => Err(std::io::Error::new(
            std::io::ErrorKind::TimedOut,
            "server console is not reading input",
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strips_one_trailing_terminator() {
        assert_eq!(validate_command("say hi\n").unwrap(), "say hi");
        assert_eq!(validate_command("say hi\r\n").unwrap(), "say hi");
        assert_eq!(validate_command("list").unwrap(), "list");
    }

    #[test]
    fn rejects_empty_and_multiline() {
        assert!(matches!(
            validate_command("  \n"),
            Err(SupervisorError::InvalidCommand(_))
        ));
        assert!(matches!(
            validate_command("op me\nstop"),
            Err(SupervisorError::InvalidCommand(_))
        ));
        assert!(matches!(
            validate_command(&"x".repeat(MAX_COMMAND_BYTES + 1)),
            Err(SupervisorError::InvalidCommand(_))
        ));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn writes_newline_terminated_command() {
        use std::process::Stdio;
        use tokio::io::AsyncBufReadExt;

        let mut child = tokio::process::Command::new("/bin/sh")
            .args(["-c", "read line; echo \"got:$line\""])
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .spawn()
            .unwrap();
        let mut stdin = child.stdin.take().unwrap();
        write_line(&mut stdin, "say hello").await.unwrap();

        let out = child.stdout.take().unwrap();
        let mut lines = tokio::io::BufReader::new(out).lines();
        assert_eq!(lines.next_line().await.unwrap().unwrap(), "got:say hello");
        child.wait().await.unwrap();
    }
}
