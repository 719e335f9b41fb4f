//! Secret sources — where the delivered secret comes from.
//!
//! A source is one of three leaves (inline literal, file, environment
//! variable), optionally wrapped in an encryption envelope. File and Env are
//! re-read on every call so the secret can be rotated without a restart.

use std::path::PathBuf;
use std::{env, fs};

use zeroize::Zeroizing;

use crate::crypto::{self, CryptoError};

#[derive(Debug, thiserror::Error)]
pub enum SecretError {
    #[error("could not read secret file {path}: {source}")]
    File {
        path: String,
        source: std::io::Error,
    },
    #[error("environment variable not set: {0}")]
    EnvNotSet(String),
    #[error("secret is encrypted but no passphrase was supplied")]
    PassphraseRequired,
    #[error("encrypted secret is not valid UTF-8/base64")]
    NotBase64,
    #[error(transparent)]
    Crypto(#[from] CryptoError),
}

#[derive(Debug, Clone)]
pub enum SecretSource {
    /// The secret itself, straight from the config.
    Literal(String),
    /// Full file contents, read at each call.
    File(PathBuf),
    /// Named environment variable, read at each call.
    Env(String),
    /// Inner source yields a base64 envelope; decrypted with the passphrase.
    Encrypted(Box<SecretSource>),
}

impl SecretSource {
    /// Build a leaf source from the three mutually-exclusive config fields.
    /// Returns `None` when all are absent. Precedence mirrors the config
    /// validation order (value, then file, then env); validation guarantees
    /// at most one is set by the time this runs.
    pub fn from_parts(
        value: Option<&str>,
        file: Option<&str>,
        env_name: Option<&str>,
    ) -> Option<Self> {
        if let Some(v) = value {
            Some(Self::Literal(v.to_string()))
        } else if let Some(p) = file {
            Some(Self::File(PathBuf::from(p)))
        } else {
            env_name.map(|n| Self::Env(n.to_string()))
        }
    }

    /// Wrap `self` in the encryption envelope.
    pub fn encrypted(self) -> Self {
        Self::Encrypted(Box::new(self))
    }

    /// True only for the `Encrypted` wrapper — the connection handler uses
    /// this to decide whether to read a passphrase line from the client.
    pub fn needs_passphrase(&self) -> bool {
        matches!(self, Self::Encrypted(_))
    }

    /// Fetch the secret bytes. `passphrase` is only consulted by the
    /// `Encrypted` wrapper; the leaves ignore it.
    pub fn get_secret(&self, passphrase: Option<&str>) -> Result<Zeroizing<Vec<u8>>, SecretError> {
        match self {
            Self::Literal(value) => Ok(Zeroizing::new(value.clone().into_bytes())),
            Self::File(path) => fs::read(path).map(Zeroizing::new).map_err(|e| {
                SecretError::File {
                    path: path.display().to_string(),
                    source: e,
                }
            }),
            Self::Env(name) => env::var(name)
                .map(|v| Zeroizing::new(v.into_bytes()))
                .map_err(|_| SecretError::EnvNotSet(name.clone())),
            Self::Encrypted(inner) => {
                let passphrase = passphrase.ok_or(SecretError::PassphraseRequired)?;
                let blob = inner.get_secret(None)?;
                let b64 = std::str::from_utf8(&blob).map_err(|_| SecretError::NotBase64)?;
                Ok(crypto::decrypt(b64.trim_end(), passphrase)?)
            }
        }
    }
}
