//! The guest-side script that starts, stops and reports on the IDE service

use super::guest::{stderr_tail, Guest};
use crate::errors::OrchestratorError;
use std::{fmt, process::Output};

/// What the control script says about the service
#[derive(Clone, Debug, Eq, PartialEq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ServiceStatus {
    Running,
    Stopped,
    Unknown(String),
}

impl ServiceStatus {
    /// Interpret the script's `status` output
    pub fn parse(output: &str) -> ServiceStatus {
        let word = output.trim();
        match word.to_ascii_lowercase().as_str() {
            "running" => ServiceStatus::Running,
            "stopped" => ServiceStatus::Stopped,
            _ => ServiceStatus::Unknown(word.to_string()),
        }
    }
}

impl fmt::Display for ServiceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ServiceStatus::Running => f.write_str("running"),
            ServiceStatus::Stopped => f.write_str("stopped"),
            ServiceStatus::Unknown(text) => write!(f, "unknown ({:?})", text),
        }
    }
}

/// The control script text, wrapping `service_command`
///
/// Keeps a pid file next to itself, so `start` is idempotent and `stop`
/// only signals a process it started.
pub fn script(service_command: &str) -> String {
    format!(
        r#"#!/bin/sh
# written by {name}, changes will be overwritten
DIR=$(cd "$(dirname "$0")" && pwd)
PIDFILE="$DIR/service.pid"
LOGFILE="$DIR/service.log"

running() {{
    [ -f "$PIDFILE" ] && kill -0 "$(cat "$PIDFILE")" 2>/dev/null
}}

case "$1" in
    start)
        if running; then
            echo running
            exit 0
        fi
        nohup {command} >"$LOGFILE" 2>&1 </dev/null &
        echo $! >"$PIDFILE"
        echo started
        ;;
    stop)
        if running; then
            kill "$(cat "$PIDFILE")"
        fi
        rm -f "$PIDFILE"
        echo stopped
        ;;
    status)
        if running; then
            echo running
        else
            echo stopped
        fi
        ;;
    *)
        echo "usage: $0 start|stop|status" >&2
        exit 2
        ;;
esac
"#,
        name = env!("CARGO_PKG_NAME"),
        command = service_command,
    )
}

/// Directory part of a guest path
fn guest_dir(path: &str) -> &str {
    match path.rfind('/') {
        Some(0) => "/",
        Some(index) => &path[..index],
        None => ".",
    }
}

/// Write the control script into the guest
pub async fn install(
    guest: &Guest,
    path: &str,
    service_command: &str,
) -> Result<(), OrchestratorError> {
    let text = script(service_command);
    let shell = format!(
        "mkdir -p '{dir}' && cat > '{path}' && chmod 755 '{path}'",
        dir = guest_dir(path),
        path = path
    );
    let output = guest.run(&["sh", "-c", shell.as_str()], Some(text.as_bytes())).await?;
    check("install", output).map(|_| ())
}

/// Run one verb of the control script
pub async fn invoke(guest: &Guest, path: &str, verb: &str) -> Result<String, OrchestratorError> {
    let output = guest.run(&["sh", path, verb], None).await?;
    check(verb, output)
}

fn check(verb: &str, output: Output) -> Result<String, OrchestratorError> {
    if output.status.success() {
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    } else {
        Err(OrchestratorError::ControlScript {
            verb: verb.to_string(),
            code: output.status.code(),
            stderr: stderr_tail(&output),
        })
    }
}
