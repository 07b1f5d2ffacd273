//! Unix-socket bridge between the single-shot CLI and the control plane.
//!
//! One request line per connection, one human-readable response. Each
//! request becomes a control message to the best session; the matching
//! response is awaited on that kind's channel for up to five seconds.
//! Responses are matched next-available rather than by correlation id:
//! CLI latency is small and the client is single-shot.

use std::path::Path;
use std::sync::Arc;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::mpsc;
use tracing::{error, info};

use common::Result;
use protocol::{ControlMsg, ForwardEntry};

use crate::Agent;

/// How long a CLI request waits for the master's response.
pub const RESPONSE_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(5);

/// A parsed CLI request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    List,
    Sessions,
    Stop,
    Forward { slave_port: u16, master_port: u16 },
    Close { port: u16 },
}

/// Parse one request line. The error string is returned to the client
/// behind an `ERROR: ` prefix.
pub fn parse_command(line: &str) -> std::result::Result<Command, String> {
    let line = line.trim();
    match line {
        "LIST" => return Ok(Command::List),
        "SESSIONS" => return Ok(Command::Sessions),
        "STOP" => return Ok(Command::Stop),
        _ => {}
    }

    if let Some(arg) = line.strip_prefix("FORWARD:") {
        let (slave, master) = match arg.split_once(':') {
            Some((slave, master)) => (slave, master),
            None => (arg, arg),
        };
        let slave_port: u16 = slave.parse().map_err(|_| "Invalid port mapping".to_string())?;
        let master_port: u16 = master
            .parse()
            .map_err(|_| "Invalid port mapping".to_string())?;
        if slave_port == 0 || master_port == 0 {
            return Err("Invalid port mapping".into());
        }
        return Ok(Command::Forward {
            slave_port,
            master_port,
        });
    }

    if let Some(arg) = line.strip_prefix("CLOSE:") {
        let port: u16 = arg.parse().map_err(|_| "Invalid port".to_string())?;
        return Ok(Command::Close { port });
    }

    Err(format!("Unknown command '{line}'"))
}

/// Serve CLI requests at the default socket path until accept fails.
pub async fn run(agent: Arc<Agent>) -> Result<()> {
    run_at(&protocol::control_socket_path(), agent).await
}

/// Serve CLI requests at an explicit socket path.
pub async fn run_at(path: &Path, agent: Arc<Agent>) -> Result<()> {
    // A stale socket file from a crashed agent would fail the bind.
    let _ = std::fs::remove_file(path);

    let listener = UnixListener::bind(path)?;
    info!(path = %path.display(), "listening for CLI requests");

    loop {
        match listener.accept().await {
            Ok((conn, _)) => {
                tokio::spawn(handle_conn(agent.clone(), conn));
            }
            Err(e) => {
                error!(%e, "unix socket accept failed");
                return Ok(());
            }
        }
    }
}

async fn handle_conn(agent: Arc<Agent>, mut conn: UnixStream) {
    let mut buf = vec![0u8; 1024];
    let n = match conn.read(&mut buf).await {
        Ok(n) if n > 0 => n,
        _ => return,
    };
    let line = String::from_utf8_lossy(&buf[..n]).trim().to_string();

    match parse_command(&line) {
        Ok(Command::Stop) => {
            info!("stop command received, shutting down");
            let _ = conn.write_all(b"Stopping agent...").await;
            std::process::exit(0);
        }
        Ok(command) => {
            let response = run_command(&agent, command).await;
            let _ = conn.write_all(response.as_bytes()).await;
        }
        Err(msg) => {
            let _ = conn.write_all(format!("ERROR: {msg}").as_bytes()).await;
        }
    }
}

async fn run_command(agent: &Agent, command: Command) -> String {
    match command {
        Command::Sessions => agent.sessions().count().to_string(),

        Command::List => {
            let Some(session) = agent.best_session() else {
                return "ERROR: No active session".into();
            };
            if let Err(e) = session.send(&ControlMsg::ListRequest).await {
                error!(%e, "failed to send ListRequest");
                return "ERROR: Failed to send ListRequest".into();
            }
            match wait_response(&agent.list_rx).await {
                Some(ControlMsg::ListResponse { entries, master_ip }) => {
                    format_list(&entries, &master_ip)
                }
                _ => "ERROR: Timeout waiting for list response".into(),
            }
        }

        Command::Close { port } => {
            let Some(session) = agent.best_session() else {
                return "ERROR: No active session".into();
            };
            if session.send(&ControlMsg::CloseRequest { port }).await.is_err() {
                return "ERROR: Failed to send CloseRequest".into();
            }
            match wait_response(&agent.close_rx).await {
                Some(ControlMsg::CloseResponse {
                    port,
                    success: true,
                    ..
                }) => format!("Closed port {port}"),
                Some(ControlMsg::CloseResponse {
                    port,
                    success: false,
                    reason,
                }) => format!("ERROR: Failed to close port {port}: {reason}"),
                _ => "ERROR: Timeout waiting for close response".into(),
            }
        }

        Command::Forward {
            slave_port,
            master_port,
        } => {
            let Some(session) = agent.best_session() else {
                return "ERROR: No active session".into();
            };
            info!(slave = slave_port, master = master_port, "requesting listen from master");
            let request = ControlMsg::ListenRequest {
                local_addr: format!(":{master_port}"),
                remote_host: "localhost".into(),
                remote_port: slave_port,
                is_auto: false,
            };
            if let Err(e) = session.send(&request).await {
                error!(%e, "failed to send ListenRequest");
                return "ERROR: Failed to send ListenRequest".into();
            }
            match wait_response(&agent.listen_rx).await {
                Some(ControlMsg::ListenResponse { success: true, .. }) => {
                    format!("Forwarding started: slave {slave_port} -> master {master_port}")
                }
                Some(ControlMsg::ListenResponse { reason, .. }) => {
                    format!("ERROR: Failed to start forwarding: {reason}")
                }
                _ => "ERROR: Timeout waiting for listen response".into(),
            }
        }

        Command::Stop => unreachable!("handled by the connection handler"),
    }
}

/// Next response of this kind, or `None` on timeout. Holding the receiver
/// lock across the wait serializes concurrent requests of the same kind.
async fn wait_response(
    rx: &tokio::sync::Mutex<mpsc::Receiver<ControlMsg>>,
) -> Option<ControlMsg> {
    let mut rx = rx.lock().await;
    tokio::time::timeout(RESPONSE_TIMEOUT, rx.recv())
        .await
        .ok()
        .flatten()
}

/// Render the master's forward table for the terminal.
fn format_list(entries: &[ForwardEntry], master_ip: &str) -> String {
    let mut out = format!("Session: {master_ip} -> {}\n", protocol::local_ip());
    for entry in entries {
        let status = if entry.error.is_empty() {
            "OK".to_string()
        } else {
            format!("ERROR: {}", entry.error)
        };

        let local_addr = if entry.local_addr.starts_with(':') {
            format!("{master_ip}{}", entry.local_addr)
        } else {
            entry.local_addr.clone()
        };

        let auto = if entry.is_auto { "AUTO" } else { "MANUAL" };

        out.push_str(&format!(
            "  {} -> {} [{}] ({}) {}\n",
            entry.remote_port, local_addr, entry.transport, status, auto
        ));
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use tunnel::Session;

    #[test]
    fn parse_basic_commands() {
        assert_eq!(parse_command("LIST"), Ok(Command::List));
        assert_eq!(parse_command(" SESSIONS \n"), Ok(Command::Sessions));
        assert_eq!(parse_command("STOP"), Ok(Command::Stop));
    }

    #[test]
    fn parse_forward_variants() {
        assert_eq!(
            parse_command("FORWARD:5000"),
            Ok(Command::Forward {
                slave_port: 5000,
                master_port: 5000
            })
        );
        assert_eq!(
            parse_command("FORWARD:8080:9090"),
            Ok(Command::Forward {
                slave_port: 8080,
                master_port: 9090
            })
        );
    }

    #[test]
    fn parse_rejects_bad_input() {
        assert!(parse_command("FORWARD:0").is_err());
        assert!(parse_command("FORWARD:abc").is_err());
        assert!(parse_command("FORWARD:1:0").is_err());
        assert!(parse_command("CLOSE:notaport").is_err());
        assert!(parse_command("CLOSE:99999999").is_err());
        assert!(parse_command("DANCE").is_err());
        assert!(parse_command("").is_err());
    }

    #[test]
    fn parse_close() {
        assert_eq!(parse_command("CLOSE:8080"), Ok(Command::Close { port: 8080 }));
    }

    #[test]
    fn list_formatting() {
        let entries = vec![
            ForwardEntry {
                local_addr: ":5000".into(),
                remote_host: "localhost".into(),
                remote_port: 5000,
                is_auto: false,
                error: String::new(),
                transport: "SECONDARY".into(),
            },
            ForwardEntry {
                local_addr: "127.0.0.1:8080".into(),
                remote_host: "localhost".into(),
                remote_port: 8080,
                is_auto: true,
                error: "bind failed".into(),
                transport: "PRIMARY".into(),
            },
        ];

        let out = format_list(&entries, "10.1.2.3");
        assert!(out.starts_with("Session: 10.1.2.3 -> "));
        assert!(out.contains("5000 -> 10.1.2.3:5000 [SECONDARY] (OK) MANUAL"));
        assert!(out.contains("8080 -> 127.0.0.1:8080 [PRIMARY] (ERROR: bind failed) AUTO"));
    }

    /// A scripted master answering list/listen/close requests, plus the
    /// slave agent wired to it.
    async fn scripted_agent() -> Arc<Agent> {
        let (a, b) = tokio::io::duplex(64 * 1024);
        let master_task = tokio::spawn(Session::new_pipe(a, false));
        let slave = Arc::new(Session::new_pipe(b, true).await.unwrap());
        let master = master_task.await.unwrap().unwrap();

        let agent = Arc::new(Agent::new());
        agent.add_session(slave);

        tokio::spawn(async move {
            while let Ok(msg) = master.receive().await {
                let reply = match msg {
                    ControlMsg::ListRequest => ControlMsg::ListResponse {
                        entries: vec![ForwardEntry {
                            local_addr: ":5000".into(),
                            remote_host: "localhost".into(),
                            remote_port: 5000,
                            is_auto: false,
                            error: String::new(),
                            transport: "PRIMARY".into(),
                        }],
                        master_ip: "10.0.0.1".into(),
                    },
                    ControlMsg::ListenRequest { remote_port, .. } => {
                        ControlMsg::ListenResponse {
                            remote_port,
                            success: true,
                            reason: String::new(),
                        }
                    }
                    ControlMsg::CloseRequest { port } if port == 5000 => {
                        ControlMsg::CloseResponse {
                            port,
                            success: true,
                            reason: String::new(),
                        }
                    }
                    ControlMsg::CloseRequest { port } => ControlMsg::CloseResponse {
                        port,
                        success: false,
                        reason: "unknown port".into(),
                    },
                    _ => continue,
                };
                if master.send(&reply).await.is_err() {
                    break;
                }
            }
        });

        agent
    }

    async fn request(path: &Path, line: &str) -> String {
        let mut conn = UnixStream::connect(path).await.expect("connect failed");
        conn.write_all(line.as_bytes()).await.expect("write failed");
        let mut response = String::new();
        conn.read_to_string(&mut response).await.expect("read failed");
        response
    }

    #[tokio::test]
    async fn forward_list_close_over_the_socket() {
        let agent = scripted_agent().await;

        let dir = tempfile::tempdir().unwrap();
        let sock = dir.path().join("mpf-test.sock");
        {
            let agent = agent.clone();
            let sock = sock.clone();
            tokio::spawn(async move { control_socket_serve(&sock, agent).await });
        }
        // Wait for the socket file to appear.
        for _ in 0..100 {
            if sock.exists() {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }

        let response = request(&sock, "FORWARD:5000").await;
        assert_eq!(response, "Forwarding started: slave 5000 -> master 5000");

        let response = request(&sock, "LIST").await;
        assert!(response.contains("Session: 10.0.0.1 ->"));
        assert!(response.contains("5000 ->"));
        assert!(response.contains("[PRIMARY] (OK) MANUAL"));

        let response = request(&sock, "CLOSE:5000").await;
        assert_eq!(response, "Closed port 5000");

        // Unknown port: the master reports failure, state untouched.
        let response = request(&sock, "CLOSE:6000").await;
        assert_eq!(response, "ERROR: Failed to close port 6000: unknown port");

        let response = request(&sock, "SESSIONS").await;
        assert_eq!(response, "1");

        let response = request(&sock, "BOGUS").await;
        assert!(response.starts_with("ERROR: Unknown command"));
    }

    async fn control_socket_serve(path: &Path, agent: Arc<Agent>) {
        let _ = run_at(path, agent).await;
    }

    #[tokio::test]
    async fn commands_without_session_report_error() {
        let agent = Arc::new(Agent::new());
        assert_eq!(
            run_command(&agent, Command::List).await,
            "ERROR: No active session"
        );
        assert_eq!(
            run_command(&agent, Command::Close { port: 80 }).await,
            "ERROR: No active session"
        );
        assert_eq!(
            run_command(
                &agent,
                Command::Forward {
                    slave_port: 80,
                    master_port: 80
                }
            )
            .await,
            "ERROR: No active session"
        );
        assert_eq!(run_command(&agent, Command::Sessions).await, "0");
    }
}
