#![forbid(unsafe_code)]

//! `agent-overseer-ctl`: local CLI companion for `agent-overseer`.
//!
//! Connects to the IPC socket and sends JSON commands to the server.

use std::io::{BufRead, BufReader, Write};
use std::path::PathBuf;

use clap::{Parser, Subcommand};
use interprocess::local_socket::{traits::Stream as _, GenericNamespaced, Stream, ToNsName};

/// File inside the data directory holding the server's IPC token.
const TOKEN_FILE: &str = "ipc.token";

#[derive(Debug, Parser)]
#[command(
    name = "agent-overseer-ctl",
    about = "Local CLI for the agent-overseer server",
    version,
    long_about = None
)]
struct Cli {
    /// IPC socket name (must match the server's `ipc_name` config).
    #[arg(long, default_value = "agent-overseer")]
    ipc_name: String,

    /// Shared-secret token. Takes precedence over `--data-dir`.
    #[arg(long)]
    token: Option<String>,

    /// Server data directory; the token is read from `ipc.token` inside it.
    #[arg(long)]
    data_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// List sessions with state and health.
    List,

    /// Show running/pending counts per session.
    Slots,

    /// Force-reclaim a running work item.
    Reclaim {
        /// Work item ID.
        id: String,
    },

    /// Start the queue monitor loop.
    MonitorStart,

    /// Stop the queue monitor loop.
    MonitorStop,

    /// Show monitor state, or one session in detail.
    Status {
        /// Session ID.
        session_id: Option<String>,
    },

    /// Archive finished work items of a session.
    Cleanup {
        /// Session ID.
        session_id: String,
    },

    /// Queue a job. The payload is JSON, e.g. `{"type":"verify","url":"https://example.com"}`.
    Enqueue {
        /// Session ID.
        session_id: String,
        /// Job payload as JSON.
        payload: String,
    },

    /// Stop a session's worker and mark it terminated.
    Terminate {
        /// Session ID.
        session_id: String,
    },

    /// Change the terminal size of a session's worker.
    Resize {
        /// Session ID.
        session_id: String,
        /// Terminal rows.
        rows: u16,
        /// Terminal columns.
        cols: u16,
    },
}

impl Cli {
    fn resolve_token(&self) -> Option<String> {
        if let Some(ref token) = self.token {
            return Some(token.clone());
        }
        let path = self.data_dir.as_ref()?.join(TOKEN_FILE);
        std::fs::read_to_string(path)
            .ok()
            .map(|raw| raw.trim().to_owned())
    }
}

fn build_request(command: &Command) -> Result<serde_json::Value, serde_json::Error> {
    let request = match command {
        Command::List => serde_json::json!({ "command": "list" }),
        Command::Slots => serde_json::json!({ "command": "slots" }),
        Command::Reclaim { id } => serde_json::json!({ "command": "reclaim", "id": id }),
        Command::MonitorStart => serde_json::json!({ "command": "monitor_start" }),
        Command::MonitorStop => serde_json::json!({ "command": "monitor_stop" }),
        Command::Status { session_id } => {
            let mut req = serde_json::json!({ "command": "status" });
            if let Some(id) = session_id {
                req["id"] = serde_json::Value::String(id.clone());
            }
            req
        }
        Command::Cleanup { session_id } => {
            serde_json::json!({ "command": "cleanup", "id": session_id })
        }
        Command::Enqueue {
            session_id,
            payload,
        } => {
            let payload: serde_json::Value = serde_json::from_str(payload)?;
            serde_json::json!({ "command": "enqueue", "id": session_id, "payload": payload })
        }
        Command::Terminate { session_id } => {
            serde_json::json!({ "command": "terminate", "id": session_id })
        }
        Command::Resize {
            session_id,
            rows,
            cols,
        } => {
            serde_json::json!({ "command": "resize", "id": session_id, "rows": rows, "cols": cols })
        }
    };
    Ok(request)
}

fn main() {
    let args = Cli::parse();

    let mut request_json = match build_request(&args.command) {
        Ok(request) => request,
        Err(err) => {
            eprintln!("Invalid payload: {err}");
            std::process::exit(2);
        }
    };
    if let Some(token) = args.resolve_token() {
        request_json["auth_token"] = serde_json::Value::String(token);
    }

    match send_ipc_command(&args.ipc_name, &request_json) {
        Ok(response) => {
            if let Some(obj) = response.as_object() {
                let ok = obj
                    .get("ok")
                    .and_then(serde_json::Value::as_bool)
                    .unwrap_or(false);
                if ok {
                    if let Some(data) = obj.get("data") {
                        println!("{}", serde_json::to_string_pretty(data).unwrap_or_default());
                    } else {
                        println!("OK");
                    }
                } else {
                    let err_msg = obj
                        .get("error")
                        .and_then(|v| v.as_str())
                        .unwrap_or("unknown error");
                    eprintln!("Error: {err_msg}");
                    std::process::exit(1);
                }
            } else {
                println!("{response}");
            }
        }
        Err(err) => {
            eprintln!("Failed to connect to server: {err}");
            eprintln!("Is agent-overseer running with ipc_name '{}'?", args.ipc_name);
            std::process::exit(1);
        }
    }
}

/// Connect to the IPC socket, send a JSON command, and read the response.
fn send_ipc_command(
    ipc_name: &str,
    request: &serde_json::Value,
) -> std::result::Result<serde_json::Value, Box<dyn std::error::Error>> {
    let name = ipc_name.to_ns_name::<GenericNamespaced>()?;
    let mut stream = Stream::connect(name)?;

    let mut request_line = serde_json::to_string(request)?;
    request_line.push('\n');
    stream.write_all(request_line.as_bytes())?;
    stream.flush()?;

    let mut reader = BufReader::new(&stream);
    let mut response_line = String::new();
    reader.read_line(&mut response_line)?;

    let response: serde_json::Value = serde_json::from_str(response_line.trim())?;
    Ok(response)
}
