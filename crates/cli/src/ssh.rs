//! Outer authenticated channel: SSH via russh.
//!
//! The master uses one SSH connection per tunnel generation: exec channels
//! for deployment commands, and a long-lived exec channel whose byte stream
//! becomes the primary transport. Host-key verification policy is out of
//! scope here; the tunnel pins its own secondary-transport certificate.

use std::sync::Arc;
use std::time::Duration;

use russh::keys::{PrivateKeyWithHashAlg, PublicKey};
use russh::{client, ChannelMsg};
use tokio::io::{AsyncRead, AsyncWrite};
use tracing::{debug, info, warn};

use common::{Error, Result};

/// Well-known private key files tried in order.
const IDENTITY_FILES: &[&str] = &["id_ed25519", "id_ecdsa", "id_rsa"];

/// A parsed `[user@]host[:port]` target.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Target {
    pub user: String,
    pub host: String,
    pub port: u16,
}

/// Parse `[user@]host[:port]`, defaulting the user to `$USER` and the port
/// to 22.
pub fn parse_target(target: &str) -> Target {
    let (user, rest) = match target.split_once('@') {
        Some((user, rest)) if !user.is_empty() => (user.to_string(), rest),
        _ => (
            std::env::var("USER").unwrap_or_else(|_| "root".into()),
            target,
        ),
    };

    let (host, port) = match rest.rsplit_once(':') {
        Some((host, port_str)) => match port_str.parse::<u16>() {
            Ok(port) => (host.to_string(), port),
            Err(_) => (rest.to_string(), 22),
        },
        None => (rest.to_string(), 22),
    };

    Target { user, host, port }
}

struct AcceptingHandler;

impl client::Handler for AcceptingHandler {
    type Error = russh::Error;

    async fn check_server_key(
        &mut self,
        _server_public_key: &PublicKey,
    ) -> std::result::Result<bool, Self::Error> {
        Ok(true)
    }
}

/// An authenticated SSH session.
pub struct SshSession {
    handle: client::Handle<AcceptingHandler>,
    target: Target,
}

impl SshSession {
    /// Connect and authenticate: well-known key files first, then an
    /// interactive password prompt.
    pub async fn connect(target: &str) -> Result<Self> {
        let target = parse_target(target);

        let config = Arc::new(client::Config {
            inactivity_timeout: None,
            ..Default::default()
        });

        let addr = (target.host.as_str(), target.port);
        let handle = client::connect(config, addr, AcceptingHandler)
            .await
            .map_err(|e| Error::Ssh(format!("connect to {}:{} failed: {e}", target.host, target.port)))?;

        info!(host = %target.host, port = target.port, user = %target.user, "SSH connection established");

        let mut session = Self { handle, target };
        session.authenticate().await?;
        Ok(session)
    }

    pub fn target(&self) -> &Target {
        &self.target
    }

    async fn authenticate(&mut self) -> Result<()> {
        let user = self.target.user.clone();

        let ssh_dir = dirs::home_dir().map(|home| home.join(".ssh"));
        if let Some(ssh_dir) = ssh_dir {
            for name in IDENTITY_FILES {
                let key_path = ssh_dir.join(name);
                if !key_path.exists() {
                    continue;
                }
                debug!(key = %key_path.display(), "trying SSH key");

                let key_pair = match russh::keys::load_secret_key(&key_path, None) {
                    Ok(key_pair) => key_pair,
                    Err(e) => {
                        debug!(key = %key_path.display(), %e, "failed to load key, trying next");
                        continue;
                    }
                };

                let key = PrivateKeyWithHashAlg::new(Arc::new(key_pair), None);
                match self.handle.authenticate_publickey(&user, key).await {
                    Ok(result) if result.success() => {
                        info!(user = %user, key = %key_path.display(), "SSH key authentication successful");
                        return Ok(());
                    }
                    Ok(_) => {
                        debug!(key = %key_path.display(), "key not accepted, trying next");
                    }
                    Err(e) => {
                        debug!(key = %key_path.display(), %e, "auth attempt failed, trying next");
                    }
                }
            }
        }

        // No key worked: fall back to an interactive password prompt.
        info!("no SSH key accepted, trying password authentication");
        let prompt_user = user.clone();
        let host = self.target.host.clone();
        let password = tokio::task::spawn_blocking(move || {
            dialoguer::Password::new()
                .with_prompt(format!("{prompt_user}@{host}'s password"))
                .interact()
        })
        .await
        .map_err(|e| Error::Ssh(format!("password prompt failed: {e}")))?
        .map_err(|e| Error::Ssh(format!("password prompt failed: {e}")))?;

        let result = self
            .handle
            .authenticate_password(&user, &password)
            .await
            .map_err(|e| Error::Ssh(format!("password auth failed: {e}")))?;

        if !result.success() {
            return Err(Error::Ssh("SSH authentication failed".into()));
        }
        info!(user = %user, "SSH password authentication successful");
        Ok(())
    }

    /// Run a command, returning (stdout, stderr, exit code).
    pub async fn exec(&self, command: &str) -> Result<(String, String, Option<u32>)> {
        let mut channel = self
            .handle
            .channel_open_session()
            .await
            .map_err(|e| Error::Ssh(format!("failed to open SSH channel: {e}")))?;

        channel
            .exec(true, command)
            .await
            .map_err(|e| Error::Ssh(format!("failed to exec command: {e}")))?;

        let mut stdout = Vec::new();
        let mut stderr = Vec::new();
        let mut exit_code = None;

        // ExitStatus often arrives after Eof, so only Close (or channel
        // teardown) ends the loop.
        loop {
            match tokio::time::timeout(Duration::from_secs(30), channel.wait()).await {
                Ok(Some(msg)) => match msg {
                    ChannelMsg::Data { data } => stdout.extend_from_slice(&data),
                    ChannelMsg::ExtendedData { data, ext } => {
                        if ext == 1 {
                            stderr.extend_from_slice(&data);
                        }
                    }
                    ChannelMsg::ExitStatus { exit_status } => exit_code = Some(exit_status),
                    ChannelMsg::Close => break,
                    _ => {}
                },
                Ok(None) => break,
                Err(_) => return Err(Error::Ssh("SSH command timed out".into())),
            }
        }

        let stdout = String::from_utf8_lossy(&stdout).into_owned();
        let stderr = String::from_utf8_lossy(&stderr).into_owned();
        debug!(command, exit_code, "SSH command completed");
        Ok((stdout, stderr, exit_code))
    }

    /// Run a command feeding `data` to its stdin (used to stream the agent
    /// binary). Returns the exit code.
    pub async fn exec_with_stdin(&self, command: &str, data: &[u8]) -> Result<Option<u32>> {
        let channel = self
            .handle
            .channel_open_session()
            .await
            .map_err(|e| Error::Ssh(format!("failed to open SSH channel: {e}")))?;

        channel
            .exec(true, command)
            .await
            .map_err(|e| Error::Ssh(format!("failed to exec command: {e}")))?;

        // Drain the read side concurrently with the write: without this the
        // session handler can deadlock on window updates for large uploads.
        let (mut read_half, write_half) = channel.split();
        let drain = tokio::spawn(async move {
            let mut exit_code = None;
            loop {
                match tokio::time::timeout(Duration::from_secs(120), read_half.wait()).await {
                    Ok(Some(ChannelMsg::ExitStatus { exit_status })) => {
                        exit_code = Some(exit_status);
                    }
                    Ok(Some(ChannelMsg::Close)) | Ok(None) | Err(_) => break,
                    Ok(Some(_)) => {}
                }
            }
            exit_code
        });

        // Write through the channel's AsyncWrite implementation, which
        // respects SSH window management between sends.
        let write_result: Result<()> = async {
            use tokio::io::AsyncWriteExt;
            let mut writer = write_half.make_writer();

            const CHUNK_SIZE: usize = 65_536;
            for chunk in data.chunks(CHUNK_SIZE) {
                writer
                    .write_all(chunk)
                    .await
                    .map_err(|e| Error::Ssh(format!("failed to write stdin: {e}")))?;
            }

            // Shutdown sends EOF to the remote stdin.
            writer
                .shutdown()
                .await
                .map_err(|e| Error::Ssh(format!("failed to send EOF: {e}")))?;
            Ok(())
        }
        .await;

        if let Err(e) = write_result {
            drain.abort();
            return Err(e);
        }

        let exit_code = drain
            .await
            .map_err(|e| Error::Ssh(format!("upload drain failed: {e}")))?;
        Ok(exit_code)
    }

    /// Start the remote agent and return its stdio as a byte stream, the
    /// primary transport.
    pub async fn start_agent(
        &self,
        remote_path: &str,
        dev: bool,
    ) -> Result<impl AsyncRead + AsyncWrite + Send + 'static> {
        let channel = self
            .handle
            .channel_open_session()
            .await
            .map_err(|e| Error::Ssh(format!("failed to open SSH channel: {e}")))?;

        if dev {
            if let Err(e) = channel.set_env(false, "APP_ENV", "dev").await {
                warn!(%e, "failed to set APP_ENV=dev on remote");
            }
        }

        let command = format!("./{remote_path} agent");
        channel
            .exec(true, command.as_str())
            .await
            .map_err(|e| Error::Ssh(format!("failed to start remote agent: {e}")))?;

        info!(%command, "remote agent started");
        Ok(channel.into_stream())
    }
}
