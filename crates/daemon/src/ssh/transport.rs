//! SSH transport over russh

use super::{ExecOutput, PtyHandle, PtyInput, SshConnector, SshSession, Target};
use async_trait::async_trait;
use nimbus_common::{Error, Result, SshKeyMaterial};
use russh::client;
use russh::keys::PrivateKeyWithHashAlg;
use russh::{ChannelMsg, Disconnect};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::debug;

/// Accepts any host key. Instances are created by us moments before the
/// first connection, so there is nothing to pin against yet.
struct ClientHandler {
    host: String,
}

impl client::Handler for ClientHandler {
    type Error = russh::Error;

    async fn check_server_key(
        &mut self,
        _server_public_key: &russh::keys::PublicKey,
    ) -> std::result::Result<bool, Self::Error> {
        debug!("Accepting host key for {}", self.host);
        Ok(true)
    }
}

fn ssh_error(context: &str, e: russh::Error) -> Error {
    let transient = matches!(
        e,
        russh::Error::IO(_)
            | russh::Error::Disconnect
            | russh::Error::HUP
            | russh::Error::ConnectionTimeout
    );
    Error::Ssh {
        message: format!("{}: {}", context, e),
        detail: None,
        transient,
    }
}

/// Connector speaking real SSH
pub struct RusshConnector {
    config: Arc<client::Config>,
}

impl RusshConnector {
    pub fn new(inactivity_timeout: Duration) -> Self {
        let config = client::Config {
            inactivity_timeout: Some(inactivity_timeout),
            keepalive_interval: Some(Duration::from_secs(30)),
            ..Default::default()
        };
        Self {
            config: Arc::new(config),
        }
    }
}

#[async_trait]
impl SshConnector for RusshConnector {
    async fn connect(&self, target: &Target, key: &SshKeyMaterial) -> Result<Arc<dyn SshSession>> {
        let private = russh::keys::decode_secret_key(&key.private_key_pem, None)
            .map_err(|e| Error::Validation(format!("unusable SSH private key: {}", e)))?;

        let handler = ClientHandler {
            host: target.host.clone(),
        };
        let mut handle = client::connect(
            self.config.clone(),
            (target.host.as_str(), target.port),
            handler,
        )
        .await
        .map_err(|e| ssh_error(&format!("connect to {}", target), e))?;

        let hash = handle
            .best_supported_rsa_hash()
            .await
            .map_err(|e| ssh_error("negotiate RSA hash", e))?
            .flatten();
        let auth = handle
            .authenticate_publickey(
                target.user.as_str(),
                PrivateKeyWithHashAlg::new(Arc::new(private), hash),
            )
            .await
            .map_err(|e| ssh_error("public key authentication", e))?;

        if !auth.success() {
            return Err(Error::Authentication {
                message: format!("public key rejected for {}", target),
                detail: None,
            });
        }

        Ok(Arc::new(RusshSession { handle }))
    }
}

struct RusshSession {
    handle: client::Handle<ClientHandler>,
}

#[async_trait]
impl SshSession for RusshSession {
    async fn exec(&self, command: &str) -> Result<ExecOutput> {
        let mut channel = self
            .handle
            .channel_open_session()
            .await
            .map_err(|e| ssh_error("open channel", e))?;
        channel
            .exec(true, command)
            .await
            .map_err(|e| ssh_error("exec", e))?;

        let mut stdout = Vec::new();
        let mut stderr = Vec::new();
        let mut exit_code = None;

        while let Some(msg) = channel.wait().await {
            match msg {
                ChannelMsg::Data { ref data } => stdout.extend_from_slice(data),
                ChannelMsg::ExtendedData { ref data, ext: 1 } => stderr.extend_from_slice(data),
                ChannelMsg::ExitStatus { exit_status } => exit_code = Some(exit_status as i32),
                ChannelMsg::Close => break,
                _ => {}
            }
        }

        Ok(ExecOutput {
            stdout: String::from_utf8_lossy(&stdout).into_owned(),
            stderr: String::from_utf8_lossy(&stderr).into_owned(),
            exit_code: exit_code.unwrap_or(-1),
        })
    }

    async fn open_pty(&self, term: &str, cols: u32, rows: u32) -> Result<PtyHandle> {
        let mut channel = self
            .handle
            .channel_open_session()
            .await
            .map_err(|e| ssh_error("open channel", e))?;
        channel
            .request_pty(true, term, cols, rows, 0, 0, &[])
            .await
            .map_err(|e| ssh_error("request pty", e))?;
        channel
            .request_shell(true)
            .await
            .map_err(|e| ssh_error("request shell", e))?;

        let (input_tx, mut input_rx) = mpsc::channel::<PtyInput>(64);
        let (output_tx, output_rx) = mpsc::channel::<Vec<u8>>(64);

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    msg = channel.wait() => match msg {
                        Some(ChannelMsg::Data { data }) | Some(ChannelMsg::ExtendedData { data, .. }) => {
                            if output_tx.send(data.to_vec()).await.is_err() {
                                break;
                            }
                        }
                        Some(ChannelMsg::Eof) | Some(ChannelMsg::Close) | None => break,
                        Some(_) => {}
                    },
                    input = input_rx.recv() => match input {
                        Some(PtyInput::Data(bytes)) => {
                            if channel.data(&bytes[..]).await.is_err() {
                                break;
                            }
                        }
                        Some(PtyInput::Resize { cols, rows }) => {
                            if let Err(e) = channel.window_change(cols, rows, 0, 0).await {
                                debug!("window change failed: {}", e);
                            }
                        }
                        None => break,
                    },
                }
            }
            let _ = channel.eof().await;
            let _ = channel.close().await;
            debug!("PTY channel closed");
        });

        Ok(PtyHandle {
            input: input_tx,
            output: output_rx,
        })
    }

    fn is_alive(&self) -> bool {
        !self.handle.is_closed()
    }

    async fn close(&self) {
        if let Err(e) = self
            .handle
            .disconnect(Disconnect::ByApplication, "", "en")
            .await
        {
            debug!("disconnect: {}", e);
        }
    }
}
