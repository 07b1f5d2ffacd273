//! Master-side orchestration: connect, deploy, tunnel, mosh, reconnect.
//!
//! The tunnel lives in a background task for the lifetime of the mosh
//! session. Losing every tunnel session triggers a reconnect with
//! exponential backoff: fresh SSH connection, redeploy if needed, new
//! handshake. The interactive terminal is never interrupted by tunnel
//! churn.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use common::{Error, Result};
use forward::{BindPolicy, Forwarder};
use protocol::{ControlMsg, PROTOCOL_VERSION};
use tunnel::{quic, Session, SessionManager};

use crate::ssh::{self, SshSession};
use crate::{deploy, mosh, sysctl, TransportMode};

/// Reconnect backoff: start and cap.
const BACKOFF_START: Duration = Duration::from_secs(1);
const BACKOFF_CAP: Duration = Duration::from_secs(30);

#[derive(Clone)]
pub struct Options {
    pub target: String,
    pub mosh_args: Vec<String>,
    pub remote_path: String,
    pub transport: TransportMode,
    pub bind_policy: BindPolicy,
    pub auto_forward: bool,
}

/// Connect, start the tunnel in the background, hand the terminal to mosh.
pub async fn run(options: Options) -> Result<()> {
    let state = match state::Manager::new() {
        Ok(manager) => Some(Arc::new(manager)),
        Err(e) => {
            warn!(%e, "state manager unavailable, forwards will not persist");
            None
        }
    };

    let remote_hostname = ssh::parse_target(&options.target).host;

    if options.transport != TransportMode::PrimaryOnly {
        if let Some(info) = sysctl::local_udp_buffer_info() {
            if let Some(warning) = sysctl::buffer_warning("local", info) {
                sysctl::confirm_or_continue(&warning).await;
            }
        }
    }

    // Initial connect and deploy run synchronously so setup errors surface
    // before the terminal starts.
    let client = SshSession::connect(&options.target).await?;
    let remote_path = deploy::deploy_agent(&client, &options.remote_path, common::is_dev()).await?;

    if options.transport != TransportMode::PrimaryOnly {
        if let Some(info) = sysctl::remote_udp_buffer_info(&client).await {
            if let Some(warning) = sysctl::buffer_warning("remote", info) {
                sysctl::confirm_or_continue(&warning).await;
            }
        }
    }

    let sessions = Arc::new(SessionManager::new());
    let forwarder = Forwarder::new(
        sessions.clone(),
        remote_hostname,
        options.target.clone(),
        state,
        options.bind_policy,
    );

    forwarder.restore().await;

    {
        let options = options.clone();
        let forwarder = forwarder.clone();
        let sessions = sessions.clone();
        tokio::spawn(async move {
            tunnel_loop(options, client, remote_path, forwarder, sessions).await;
        });
    }

    let code = mosh::run(&options.target, &options.mosh_args).await?;
    if code != 0 {
        return Err(Error::Protocol(format!("mosh exited with status {code}")));
    }
    Ok(())
}

/// Keep a tunnel alive until it ends cleanly: first over the already
/// established SSH client, then reconnecting with backoff.
async fn tunnel_loop(
    options: Options,
    client: SshSession,
    remote_path: String,
    forwarder: Arc<Forwarder>,
    sessions: Arc<SessionManager>,
) {
    let strict = options.transport == TransportMode::SecondaryOnly;
    let mut backoff = BACKOFF_START;
    let mut current = Some((client, remote_path));

    loop {
        let result = match current.take() {
            Some((client, remote_path)) => {
                run_tunnel(&options, &client, &remote_path, &forwarder, &sessions).await
            }
            None => reconnect_and_run(&options, &forwarder, &sessions).await,
        };
        sessions.close_all();

        match result {
            Ok(()) => {
                info!("tunnel closed cleanly");
                return;
            }
            Err(e) if strict => {
                error!(%e, "session failed in secondary-only mode");
                std::process::exit(1);
            }
            Err(e) => {
                error!(%e, delay = ?backoff, "session failed, reconnecting");
                tokio::time::sleep(backoff).await;
                backoff = (backoff * 2).min(BACKOFF_CAP);
            }
        }
    }
}

/// Fresh SSH connection, redeploy if needed, then one tunnel generation.
async fn reconnect_and_run(
    options: &Options,
    forwarder: &Arc<Forwarder>,
    sessions: &Arc<SessionManager>,
) -> Result<()> {
    let client = SshSession::connect(&options.target).await?;
    let remote_path = deploy::deploy_agent(&client, &options.remote_path, common::is_dev()).await?;

    // Re-establish persisted forwards that lost their listener.
    forwarder.restore().await;

    run_tunnel(options, &client, &remote_path, forwarder, sessions).await
}

/// One tunnel generation: handshake, control loops, optional secondary
/// upgrade. Returns when the tunnel dies or the peer shuts down.
async fn run_tunnel(
    options: &Options,
    client: &SshSession,
    remote_path: &str,
    forwarder: &Arc<Forwarder>,
    sessions: &Arc<SessionManager>,
) -> Result<()> {
    let stream = client.start_agent(remote_path, common::is_dev()).await?;
    let session = Arc::new(Session::new_pipe(stream, false).await?);

    session
        .send(&ControlMsg::Hello {
            version: PROTOCOL_VERSION.into(),
            auto_forward: options.auto_forward,
        })
        .await?;

    let (udp_port, tls_hash) = match session.receive().await? {
        ControlMsg::HelloAck {
            version,
            udp_port,
            tls_hash,
        } => {
            if version != PROTOCOL_VERSION {
                return Err(Error::Handshake(format!(
                    "version mismatch: agent={version}, master={PROTOCOL_VERSION}"
                )));
            }
            (udp_port, tls_hash)
        }
        ControlMsg::Shutdown { reason } => {
            return Err(Error::Handshake(format!("agent refused session: {reason}")));
        }
        other => {
            return Err(Error::Handshake(format!("expected HelloAck, got {other:?}")));
        }
    };

    info!("tunnel established");

    let (done_tx, mut done_rx) = mpsc::channel::<Result<()>>(1);
    start_control_loop(
        session.clone(),
        forwarder.clone(),
        sessions.clone(),
        done_tx.clone(),
    );

    let secondary_offered = udp_port != 0 && !tls_hash.is_empty();
    if options.transport != TransportMode::PrimaryOnly && secondary_offered {
        let host = client.target().host.clone();
        tokio::spawn(attempt_upgrade(
            host,
            udp_port,
            tls_hash,
            options.transport == TransportMode::SecondaryOnly,
            session.clone(),
            forwarder.clone(),
            sessions.clone(),
            done_tx.clone(),
        ));
    } else if options.transport == TransportMode::SecondaryOnly {
        return Err(Error::Handshake(
            "remote agent does not offer the secondary transport".into(),
        ));
    }

    done_rx.recv().await.unwrap_or(Ok(()))
}

/// Register a session and serve its control stream.
fn start_control_loop(
    session: Arc<Session>,
    forwarder: Arc<Forwarder>,
    sessions: Arc<SessionManager>,
    done_tx: mpsc::Sender<Result<()>>,
) {
    let on_remove = {
        let sessions = sessions.clone();
        let done_tx = done_tx.clone();
        Box::new(move || {
            if sessions.count() == 0 {
                let _ = done_tx.try_send(Err(Error::Transport("all sessions closed".into())));
            }
        })
    };
    sessions.add(session.clone(), Some(on_remove));

    tokio::spawn(async move {
        loop {
            let msg = match session.receive().await {
                Ok(msg) => msg,
                Err(e) => {
                    debug!(session = session.id(), %e, "control stream ended");
                    sessions.remove(&session);
                    return;
                }
            };
            debug!(session = session.id(), ?msg, "master received message");
            if handle_master_message(&session, msg, &forwarder, &done_tx).await {
                return;
            }
        }
    });
}

/// Handle one control message; returns `true` when the loop should stop.
async fn handle_master_message(
    session: &Arc<Session>,
    msg: ControlMsg,
    forwarder: &Arc<Forwarder>,
    done_tx: &mpsc::Sender<Result<()>>,
) -> bool {
    match msg {
        ControlMsg::Heartbeat => {
            let _ = session.send(&ControlMsg::HeartbeatAck).await;
        }
        ControlMsg::HeartbeatAck => {}
        ControlMsg::ListenRequest {
            local_addr,
            remote_host,
            remote_port,
            is_auto,
        } => {
            info!(
                local = %local_addr,
                remote = %format!("{}:{remote_port}", forwarder.remote_name()),
                is_auto,
                "dynamic listen request"
            );
            let result = forwarder
                .listen_and_forward(&local_addr, &remote_host, remote_port, is_auto)
                .await;
            let response = match result {
                Ok(_) => ControlMsg::ListenResponse {
                    remote_port,
                    success: true,
                    reason: String::new(),
                },
                Err(e) => {
                    error!(%e, "failed to handle listen request");
                    ControlMsg::ListenResponse {
                        remote_port,
                        success: false,
                        reason: e.to_string(),
                    }
                }
            };
            let _ = session.send(&response).await;
        }
        ControlMsg::ListRequest => {
            let _ = session
                .send(&ControlMsg::ListResponse {
                    entries: forwarder.get_forward_entries(),
                    master_ip: forwarder.master_ip().to_string(),
                })
                .await;
        }
        ControlMsg::CloseRequest { port } => {
            info!(remote = %forwarder.remote_name(), port, "close request received");
            let success = forwarder.close_forward(port);
            let reason = if success {
                String::new()
            } else {
                format!("no forward on port {port}")
            };
            let _ = session
                .send(&ControlMsg::CloseResponse {
                    port,
                    success,
                    reason,
                })
                .await;
        }
        ControlMsg::Shutdown { reason } => {
            info!(%reason, "shutdown received from agent");
            let _ = done_tx.try_send(Ok(()));
            return true;
        }
        other => {
            debug!(?other, "unhandled control message");
        }
    }
    false
}

/// Dial the advertised secondary transport and promote it to a session.
#[allow(clippy::too_many_arguments)]
async fn attempt_upgrade(
    host: String,
    udp_port: u16,
    tls_hash: String,
    strict: bool,
    primary: Arc<Session>,
    forwarder: Arc<Forwarder>,
    sessions: Arc<SessionManager>,
    done_tx: mpsc::Sender<Result<()>>,
) {
    info!(%host, port = udp_port, "attempting secondary transport upgrade");

    let result = async {
        let (endpoint, conn) = quic::dial(&host, udp_port, &tls_hash).await?;
        Session::new_quic(conn, Some(endpoint), false).await
    }
    .await;

    match result {
        Ok(secondary) => {
            let secondary = Arc::new(secondary);
            // First message pins stream 0 as the control stream before any
            // data stream can race it to the acceptor.
            if let Err(e) = secondary.send(&ControlMsg::Heartbeat).await {
                warn!(%e, "secondary session unusable");
                if strict {
                    let _ = done_tx.try_send(Err(e));
                }
                return;
            }
            start_control_loop(secondary, forwarder, sessions.clone(), done_tx);
            info!("secondary transport established");

            if strict {
                info!("secondary-only mode: closing primary session");
                sessions.remove(&primary);
            }
        }
        Err(e) => {
            warn!(%e, "secondary upgrade failed, staying on primary");
            if strict {
                let _ = done_tx.try_send(Err(e));
            }
        }
    }
}
