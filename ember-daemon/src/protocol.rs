//! Newline-delimited JSON protocol between clients and the daemon.

use std::io::{BufRead, BufReader, Write};
use std::net::TcpStream;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use ember_core::{AuthToken, DaemonRegistryEntry};

use crate::error::{io_err, DaemonError};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(2);

/// One request line.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DaemonRequest {
    pub token: AuthToken,
    #[serde(flatten)]
    pub command: Command,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "cmd", rename_all = "snake_case")]
pub enum Command {
    Status,
    Stop,
    Build {
        program: String,
        #[serde(default)]
        args: Vec<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        cwd: Option<PathBuf>,
    },
}

impl Command {
    pub fn name(&self) -> &'static str {
        match self {
            Command::Status => "status",
            Command::Stop => "stop",
            Command::Build { .. } => "build",
        }
    }
}

/// One response line.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DaemonResponse {
    pub ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl DaemonResponse {
    pub fn ok(data: Value) -> Self {
        Self {
            ok: true,
            data: Some(data),
            error: None,
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            ok: false,
            data: None,
            error: Some(message.into()),
        }
    }
}

/// Send one request to the daemon advertised by `entry` and return one
/// response.
pub fn send_request(entry: &DaemonRegistryEntry, command: Command) -> Result<DaemonResponse, DaemonError> {
    let label = entry.address.to_string();
    let mut stream = TcpStream::connect_timeout(&entry.address, CONNECT_TIMEOUT).map_err(|err| {
        if matches!(
            err.kind(),
            std::io::ErrorKind::ConnectionRefused
                | std::io::ErrorKind::ConnectionReset
                | std::io::ErrorKind::TimedOut
        ) {
            DaemonError::DaemonNotRunning {
                registry_dir: entry.registry_dir.clone(),
            }
        } else {
            io_err(&label, err)
        }
    })?;

    let request = DaemonRequest {
        token: entry.token.clone(),
        command,
    };
    let payload = serde_json::to_string(&request)?;
    stream
        .write_all(payload.as_bytes())
        .map_err(|e| io_err(&label, e))?;
    stream.write_all(b"\n").map_err(|e| io_err(&label, e))?;
    stream.flush().map_err(|e| io_err(&label, e))?;

    let mut reader = BufReader::new(stream);
    let mut line = String::new();
    let read = reader.read_line(&mut line).map_err(|e| io_err(&label, e))?;
    if read == 0 {
        return Err(DaemonError::Protocol(
            "daemon closed connection before responding".to_string(),
        ));
    }

    let response: DaemonResponse = serde_json::from_str(line.trim_end())?;
    Ok(response)
}

pub fn request_status(entry: &DaemonRegistryEntry) -> Result<Value, DaemonError> {
    response_into_data(send_request(entry, Command::Status)?)
}

pub fn request_stop(entry: &DaemonRegistryEntry) -> Result<(), DaemonError> {
    response_into_data(send_request(entry, Command::Stop)?).map(|_| ())
}

pub fn request_build(
    entry: &DaemonRegistryEntry,
    program: impl Into<String>,
    args: Vec<String>,
    cwd: Option<PathBuf>,
) -> Result<Value, DaemonError> {
    let command = Command::Build {
        program: program.into(),
        args,
        cwd,
    };
    response_into_data(send_request(entry, command)?)
}

fn response_into_data(response: DaemonResponse) -> Result<Value, DaemonError> {
    if response.ok {
        Ok(response.data.unwrap_or(Value::Null))
    } else {
        Err(DaemonError::Protocol(
            response
                .error
                .unwrap_or_else(|| "unknown daemon error".to_string()),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn request_wire_format_is_flat() {
        let request = DaemonRequest {
            token: AuthToken::from("t0k"),
            command: Command::Build {
                program: "make".to_string(),
                args: vec!["all".to_string()],
                cwd: None,
            },
        };
        let value = serde_json::to_value(&request).unwrap();
        assert_eq!(
            value,
            json!({"token": "t0k", "cmd": "build", "program": "make", "args": ["all"]})
        );
    }

    #[test]
    fn build_args_default_to_empty() {
        let request: DaemonRequest =
            serde_json::from_str(r#"{"token":"x","cmd":"build","program":"true"}"#).unwrap();
        assert_eq!(
            request.command,
            Command::Build {
                program: "true".to_string(),
                args: vec![],
                cwd: None
            }
        );
    }

    #[test]
    fn unknown_command_is_rejected() {
        let parsed = serde_json::from_str::<DaemonRequest>(r#"{"token":"x","cmd":"explode"}"#);
        assert!(parsed.is_err());
    }

    #[test]
    fn error_response_omits_data() {
        let encoded = serde_json::to_string(&DaemonResponse::error("nope")).unwrap();
        assert_eq!(encoded, r#"{"ok":false,"error":"nope"}"#);
    }
}
