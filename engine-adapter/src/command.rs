use tokio::process::Command;

/// Captured result of a short-lived CLI invocation.
#[derive(Debug)]
pub(crate) struct CommandOutput {
    pub success: bool,
    pub stdout: String,
    pub stderr: String,
}

/// Run `program args...` to completion and capture its output.
pub(crate) async fn run_captured(program: &str, args: &[String]) -> std::io::Result<CommandOutput> {
    let output = Command::new(program).args(args).output().await?;
    Ok(CommandOutput {
        success: output.status.success(),
        stdout: String::from_utf8_lossy(&output.stdout).trim().to_string(),
        stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
    })
}

pub(crate) fn local_ip() -> Option<String> {
    hostname::get()
        .ok()
        .and_then(|h| h.into_string().ok())
}
