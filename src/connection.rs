//! Per-connection handler — the delivery state machine.
//!
//! Drives one accepted session through
//!   AUTH → CHANNEL → SHELL → [PASSPHRASE] → DELIVER
//! via the SSH library's server callbacks. All state mutation happens inside
//! callback dispatch on the session task, so plain fields suffice; the only
//! thing shared outward is the `delivered` flag the worker reads when the
//! connection deadline fires.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use russh::server::{Auth, Handler, Msg, Session};
use russh::{Channel, ChannelId, CryptoVec, MethodSet, Pty};
use russh_keys::key::PublicKey;
use tracing::{debug, info, warn};
use zeroize::{Zeroize, Zeroizing};

use crate::auth::Authenticator;
use crate::secret::{SecretError, SecretSource};

#[derive(Debug, thiserror::Error)]
pub enum HandlerError {
    #[error(transparent)]
    Ssh(#[from] russh::Error),
    #[error(transparent)]
    Secret(#[from] SecretError),
}

/// Outcome of one authentication attempt, before mapping to the wire reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    Denied,
    /// This factor passed; only the carried methods remain to be tried.
    Partial(MethodSet),
    Accepted,
}

pub struct ConnectionHandler {
    authenticator: Arc<Authenticator>,
    secret: Arc<SecretSource>,
    delivered: Arc<AtomicBool>,
    conn_id: u64,

    requires_both: bool,
    pubkey_passed: bool,
    authenticated: bool,
    got_shell: bool,
    channel: Option<ChannelId>,
    awaiting_passphrase: bool,
    line_buf: Vec<u8>,
}

impl ConnectionHandler {
    pub fn new(
        authenticator: Arc<Authenticator>,
        secret: Arc<SecretSource>,
        delivered: Arc<AtomicBool>,
        conn_id: u64,
    ) -> Self {
        let requires_both =
            authenticator.supported_methods() == MethodSet::PUBLICKEY | MethodSet::PASSWORD;
        Self {
            authenticator,
            secret,
            delivered,
            conn_id,
            requires_both,
            pubkey_passed: false,
            authenticated: false,
            got_shell: false,
            channel: None,
            awaiting_passphrase: false,
            line_buf: Vec::new(),
        }
    }

    // ─── Policy decisions ───────────────────────────────────────────────
    //
    // Kept free of SSH session plumbing so the ordering and advertisement
    // rules can be exercised directly in tests.

    /// Probe (no signature yet): would a signature from this key be
    /// accepted? Saying yes here authenticates nothing.
    pub fn offer_pubkey(&self, key: &PublicKey) -> bool {
        self.authenticator.check_pubkey(key)
    }

    /// A signature-verified public key attempt.
    pub fn verify_pubkey(&mut self, user: &str, key: &PublicKey) -> Decision {
        if !self.authenticator.check_pubkey(key) {
            return Decision::Denied;
        }
        if self.requires_both {
            // First factor done. From here on only the password may be
            // offered — leaving PUBKEY advertised would let the client
            // finish by presenting the same key twice.
            self.pubkey_passed = true;
            return Decision::Partial(MethodSet::PASSWORD);
        }
        if !self.authenticator.check_user(user) {
            return Decision::Denied;
        }
        self.authenticated = true;
        Decision::Accepted
    }

    /// A password attempt. In requires-both mode the password counts only
    /// after a valid pubkey signature.
    pub fn verify_password(&mut self, user: &str, password: &str) -> Decision {
        if self.requires_both && !self.pubkey_passed {
            return Decision::Denied;
        }
        if !self.authenticator.check_password(password) {
            return Decision::Denied;
        }
        if !self.authenticator.check_user(user) {
            return Decision::Denied;
        }
        self.authenticated = true;
        Decision::Accepted
    }

    fn reply(&self, decision: Decision) -> Auth {
        match decision {
            Decision::Accepted => Auth::Accept,
            Decision::Partial(methods) => Auth::Reject {
                proceed_with_methods: Some(methods),
            },
            Decision::Denied => {
                // One generic line. Never which factor failed.
                warn!(conn_id = self.conn_id, "Authentication denied");
                Auth::Reject {
                    proceed_with_methods: None,
                }
            }
        }
    }

    // ─── Delivery ───────────────────────────────────────────────────────

    /// Write the secret, send EOF, close the channel. The client is expected
    /// to disconnect once the channel closes; the worker's deadline reaps it
    /// if it does not.
    fn deliver(
        &mut self,
        channel: ChannelId,
        session: &mut Session,
        passphrase: Option<&str>,
    ) -> Result<(), HandlerError> {
        let secret = match self.secret.get_secret(passphrase) {
            Ok(secret) => secret,
            Err(e) => {
                warn!(conn_id = self.conn_id, error = %e, "secret delivery failed");
                return Err(e.into());
            }
        };

        // Queued onto the session's write buffer; any transport error
        // surfaces when the worker awaits the session future.
        session.data(channel, CryptoVec::from_slice(&secret));
        session.eof(channel);
        session.close(channel);

        self.delivered.store(true, Ordering::Relaxed);
        info!(conn_id = self.conn_id, "Secret delivered");
        Ok(())
    }

    /// The "no passphrase received" path: not an error, just no delivery.
    /// A client that disconnects mid-read lands here too.
    fn abandon_delivery(&mut self, channel: ChannelId, session: &mut Session) {
        self.awaiting_passphrase = false;
        warn!(conn_id = self.conn_id, "No passphrase received");
        session.close(channel);
    }
}

#[async_trait::async_trait]
impl Handler for ConnectionHandler {
    type Error = HandlerError;

    async fn auth_publickey_offered(
        &mut self,
        _user: &str,
        key: &PublicKey,
    ) -> Result<Auth, Self::Error> {
        if self.offer_pubkey(key) {
            Ok(Auth::Accept)
        } else {
            debug!(conn_id = self.conn_id, "public key not authorized (probe)");
            Ok(Auth::Reject {
                proceed_with_methods: None,
            })
        }
    }

    async fn auth_publickey(&mut self, user: &str, key: &PublicKey) -> Result<Auth, Self::Error> {
        let decision = self.verify_pubkey(user, key);
        match decision {
            Decision::Accepted => debug!(conn_id = self.conn_id, user, "public key accepted"),
            Decision::Partial(_) => {
                debug!(conn_id = self.conn_id, user, "public key accepted, password required")
            }
            Decision::Denied => {}
        }
        Ok(self.reply(decision))
    }

    async fn auth_password(&mut self, user: &str, password: &str) -> Result<Auth, Self::Error> {
        let decision = self.verify_password(user, password);
        if decision == Decision::Accepted {
            debug!(conn_id = self.conn_id, user, "password accepted");
        }
        Ok(self.reply(decision))
    }

    async fn channel_open_session(
        &mut self,
        channel: Channel<Msg>,
        _session: &mut Session,
    ) -> Result<bool, Self::Error> {
        // One channel per connection. The library may dispatch this before,
        // during, or after the final auth step; we just record the id.
        if self.channel.is_some() {
            debug!(conn_id = self.conn_id, "refusing extra session channel");
            return Ok(false);
        }
        self.channel = Some(channel.id());
        Ok(true)
    }

    /// Accepted unconditionally: the pty's only purpose here is to put the
    /// client terminal in raw mode, which hides passphrase input.
    async fn pty_request(
        &mut self,
        channel: ChannelId,
        _term: &str,
        _col_width: u32,
        _row_height: u32,
        _pix_width: u32,
        _pix_height: u32,
        _modes: &[(Pty, u32)],
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        session.channel_success(channel);
        Ok(())
    }

    async fn shell_request(
        &mut self,
        channel: ChannelId,
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        if !self.authenticated || self.got_shell || self.channel != Some(channel) {
            session.channel_failure(channel);
            return Ok(());
        }
        self.got_shell = true;
        session.channel_success(channel);

        if self.secret.needs_passphrase() {
            self.awaiting_passphrase = true;
            debug!(conn_id = self.conn_id, "shell open, waiting for passphrase");
            return Ok(());
        }
        self.deliver(channel, session, None)
    }

    async fn data(
        &mut self,
        channel: ChannelId,
        data: &[u8],
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        if !self.awaiting_passphrase || self.channel != Some(channel) {
            return Ok(());
        }

        self.line_buf.extend_from_slice(data);
        let Some(passphrase) = take_line(&mut self.line_buf) else {
            return Ok(());
        };
        self.awaiting_passphrase = false;

        if passphrase.is_empty() {
            self.abandon_delivery(channel, session);
            return Ok(());
        }
        self.deliver(channel, session, Some(&passphrase))
    }

    async fn channel_eof(
        &mut self,
        channel: ChannelId,
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        // EOF before the passphrase line arrived: the client gave up.
        if self.awaiting_passphrase && self.channel == Some(channel) {
            self.abandon_delivery(channel, session);
        }
        Ok(())
    }
}

/// Extract one line from `buf` once a `\n` or `\r` terminator has arrived.
/// Everything up to the first terminator is the line; the buffer is wiped
/// afterwards (it held passphrase material).
fn take_line(buf: &mut Vec<u8>) -> Option<Zeroizing<String>> {
    let end = buf.iter().position(|&b| b == b'\n' || b == b'\r')?;
    let line = Zeroizing::new(String::from_utf8_lossy(&buf[..end]).into_owned());
    buf.zeroize();
    Some(line)
}
