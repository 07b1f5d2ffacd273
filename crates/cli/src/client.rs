//! Single-shot client for the agent's local control socket.
//!
//! Runs on the remote host: a user inside a mosh session asks the local
//! agent to set up or tear down forwards on the master.

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::UnixStream;

use common::{Error, Result};

/// Send one request line to the agent and print its response.
pub async fn request(command: &str) -> Result<()> {
    let path = protocol::control_socket_path();
    let mut conn = UnixStream::connect(&path).await.map_err(|e| {
        Error::Protocol(format!(
            "could not connect to agent at {}: {e} (is an mpf session active?)",
            path.display()
        ))
    })?;

    conn.write_all(command.as_bytes()).await?;

    let mut response = String::new();
    conn.read_to_string(&mut response).await?;
    println!("{response}");

    if response.starts_with("ERROR") {
        return Err(Error::Protocol(response));
    }
    Ok(())
}
