//! Authentication policy — public keys, shared password, optional username.
//!
//! One composite covers all configured modes: a bitmask of supported SSH
//! methods plus the policy pieces each method needs. The authorized-keys
//! file is re-parsed on every attempt so the operator can edit it without a
//! restart; the cost disappears into the auth round's network RTT.

use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::PathBuf;

use russh::MethodSet;
use russh_keys::key::PublicKey;
use subtle::ConstantTimeEq;
use tracing::debug;

use crate::config::{AuthMethod, Config};
use crate::secret::SecretSource;

pub struct Authenticator {
    methods: MethodSet,
    authorized_keys: Option<PathBuf>,
    password: Option<SecretSource>,
    user: Option<SecretSource>,
}

impl Authenticator {
    pub fn new(
        methods: MethodSet,
        authorized_keys: Option<PathBuf>,
        password: Option<SecretSource>,
        user: Option<SecretSource>,
    ) -> Self {
        Self {
            methods,
            authorized_keys,
            password,
            user,
        }
    }

    pub fn from_config(config: &Config) -> Self {
        let methods = match config.auth_method {
            AuthMethod::Publickey => MethodSet::PUBLICKEY,
            AuthMethod::Password => MethodSet::PASSWORD,
            AuthMethod::Both => MethodSet::PUBLICKEY | MethodSet::PASSWORD,
        };
        Self::new(
            methods,
            config.authorized_keys.as_ref().map(PathBuf::from),
            config.password_source(),
            config.user_source(),
        )
    }

    pub fn supported_methods(&self) -> MethodSet {
        self.methods
    }

    /// Scan the authorized-keys file for a structural match with `candidate`.
    ///
    /// OpenSSH line format: `<key-type> <base64-blob> [comment]`. Blank lines
    /// and `#` comments are skipped; so are lines that fail to import (wrong
    /// type name, corrupt base64). An unreadable file denies everyone rather
    /// than erroring — absence of policy is absence of permission.
    pub fn check_pubkey(&self, candidate: &PublicKey) -> bool {
        let Some(path) = &self.authorized_keys else {
            return false;
        };
        let file = match File::open(path) {
            Ok(f) => f,
            Err(e) => {
                debug!(path = %path.display(), error = %e, "authorized_keys not readable");
                return false;
            }
        };

        for line in BufReader::new(file).lines().map_while(Result::ok) {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }

            let mut fields = line.split_whitespace();
            let (Some(_key_type), Some(b64)) = (fields.next(), fields.next()) else {
                continue;
            };
            let Ok(key) = russh_keys::parse_public_key_base64(b64) else {
                continue;
            };

            // Structural equality — comments and whitespace never matter.
            if &key == candidate {
                return true;
            }
        }

        false
    }

    /// Compare a candidate password against the configured one. No
    /// configured password means the method is unusable: always false.
    pub fn check_password(&self, candidate: &str) -> bool {
        let Some(source) = &self.password else {
            return false;
        };
        match source.get_secret(None) {
            Ok(expected) => ct_eq(candidate.as_bytes(), &expected),
            Err(e) => {
                debug!(error = %e, "password source unavailable");
                false
            }
        }
    }

    /// Compare a candidate username. No configured username source means any
    /// username is acceptable.
    pub fn check_user(&self, candidate: &str) -> bool {
        let Some(source) = &self.user else {
            return true;
        };
        match source.get_secret(None) {
            Ok(expected) => ct_eq(candidate.as_bytes(), &expected),
            Err(e) => {
                debug!(error = %e, "username source unavailable");
                false
            }
        }
    }
}

/// Constant-time equality. Length is compared first (and may leak — both
/// sides are length-bounded policy values, not attacker-chosen oracles).
fn ct_eq(a: &[u8], b: &[u8]) -> bool {
    a.len() == b.len() && a.ct_eq(b).into()
}
