//! Configuration — CLI flags, config file, validation.

use clap::Parser;
use std::fmt;
use std::fs;
use std::path::Path;

use crate::secret::SecretSource;

pub const DEFAULT_CONFIG_PATH: &str = "config/ssh-drop.conf";

/// Which SSH authentication factors a client must pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthMethod {
    /// An authorized public key is sufficient.
    Publickey,
    /// The shared password is sufficient.
    Password,
    /// Public key first, then the password — in that order.
    Both,
}

impl fmt::Display for AuthMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Publickey => write!(f, "publickey"),
            Self::Password => write!(f, "password"),
            Self::Both => write!(f, "both"),
        }
    }
}

/// Ssh-drop — deliver one secret over SSH, then hang up
#[derive(Parser, Debug)]
#[command(name = "ssh-drop", version, about)]
pub struct Cli {
    /// Config file path
    pub config: Option<String>,

    /// Encrypt a secret (read from stdin) into an envelope file and exit
    #[arg(long, value_name = "PATH", conflicts_with = "decrypt")]
    pub encrypt: Option<String>,

    /// Decrypt an envelope file to stdout and exit
    #[arg(long, value_name = "PATH")]
    pub decrypt: Option<String>,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub port: u16,
    pub host_key: String,
    pub authorized_keys: Option<String>,
    pub auth_method: AuthMethod,
    pub auth_timeout_secs: u64,
    pub secret: Option<String>,
    pub secret_file: Option<String>,
    pub secret_env: Option<String>,
    pub secret_encrypted: bool,
    pub auth_password: Option<String>,
    pub auth_password_file: Option<String>,
    pub auth_password_env: Option<String>,
    pub auth_user: Option<String>,
    pub auth_user_file: Option<String>,
    pub auth_user_env: Option<String>,
    pub log_level: String,
    pub log_file: Option<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            port: 2222,
            host_key: "config/ssh_host_key".into(),
            authorized_keys: None,
            auth_method: AuthMethod::Publickey,
            auth_timeout_secs: 10,
            secret: None,
            secret_file: None,
            secret_env: None,
            secret_encrypted: false,
            auth_password: None,
            auth_password_file: None,
            auth_password_env: None,
            auth_user: None,
            auth_user_file: None,
            auth_user_env: None,
            log_level: "info".into(),
            log_file: None,
        }
    }
}

impl Config {
    /// Load configuration from the file named on the command line (or the
    /// default path). A missing file is fatal when the path was given
    /// explicitly; the default path is allowed to be absent.
    pub fn load(cli: &Cli) -> Result<Self, String> {
        let (path, explicit) = match &cli.config {
            Some(p) => (p.as_str(), true),
            None => (DEFAULT_CONFIG_PATH, false),
        };

        let mut config = Config::default();

        if Path::new(path).exists() {
            let content = fs::read_to_string(path).map_err(|e| format!("{path}: {e}"))?;
            apply_config_file(&mut config, &content).map_err(|e| format!("{path}:{e}"))?;
        } else if explicit {
            return Err(format!("config file not found: {path}"));
        }

        config.validate()?;
        Ok(config)
    }

    /// Validate configuration. Returns an error message if invalid.
    pub fn validate(&self) -> Result<(), String> {
        if self.port == 0 {
            return Err("port must be in 1..65535".into());
        }
        if self.auth_timeout_secs == 0 {
            return Err("auth_timeout must be >= 1".into());
        }

        match count_set(&[&self.secret, &self.secret_file, &self.secret_env]) {
            0 => {
                return Err(
                    "no secret source configured (set secret, secret_file, or secret_env)".into(),
                );
            }
            1 => {}
            _ => return Err("specify exactly one of secret, secret_file, secret_env".into()),
        }

        if self.auth_method != AuthMethod::Password && self.authorized_keys.is_none() {
            return Err(format!(
                "auth_method = {} requires authorized_keys",
                self.auth_method
            ));
        }

        let passwords = count_set(&[
            &self.auth_password,
            &self.auth_password_file,
            &self.auth_password_env,
        ]);
        if self.auth_method != AuthMethod::Publickey && passwords != 1 {
            return Err(format!(
                "auth_method = {} requires exactly one of auth_password, \
                 auth_password_file, auth_password_env",
                self.auth_method
            ));
        }

        if count_set(&[&self.auth_user, &self.auth_user_file, &self.auth_user_env]) > 1 {
            return Err(
                "specify at most one of auth_user, auth_user_file, auth_user_env".into(),
            );
        }

        Ok(())
    }

    /// The configured secret source, wrapped in the encryption envelope when
    /// `secret_encrypted` is set. `None` only for un-validated configs.
    pub fn secret_source(&self) -> Option<SecretSource> {
        let source = SecretSource::from_parts(
            self.secret.as_deref(),
            self.secret_file.as_deref(),
            self.secret_env.as_deref(),
        )?;
        Some(if self.secret_encrypted {
            source.encrypted()
        } else {
            source
        })
    }

    pub fn password_source(&self) -> Option<SecretSource> {
        SecretSource::from_parts(
            self.auth_password.as_deref(),
            self.auth_password_file.as_deref(),
            self.auth_password_env.as_deref(),
        )
    }

    pub fn user_source(&self) -> Option<SecretSource> {
        SecretSource::from_parts(
            self.auth_user.as_deref(),
            self.auth_user_file.as_deref(),
            self.auth_user_env.as_deref(),
        )
    }
}

/// Apply the line-oriented `key = value` grammar. Blank lines and `#`
/// comments are skipped; every other line must contain `=`. Duplicate keys:
/// last wins. Unknown keys are ignored.
fn apply_config_file(config: &mut Config, content: &str) -> Result<(), String> {
    for (idx, line) in content.lines().enumerate() {
        let line_num = idx + 1;
        let trimmed = line.trim();
        if trimmed.is_empty() || trimmed.starts_with('#') {
            continue;
        }

        let Some(eq_pos) = trimmed.find('=') else {
            return Err(format!("{line_num}: expected 'key = value'"));
        };

        let key = trimmed[..eq_pos].trim();
        let mut value = trimmed[eq_pos + 1..].trim().to_string();
        if key.is_empty() {
            return Err(format!("{line_num}: empty key"));
        }

        // Strip quotes
        if (value.starts_with('"') && value.ends_with('"') && value.len() >= 2)
            || (value.starts_with('\'') && value.ends_with('\'') && value.len() >= 2)
        {
            value = value[1..value.len() - 1].to_string();
        }

        match key {
            "port" => {
                config.port = value
                    .parse()
                    .map_err(|_| format!("{line_num}: invalid port '{value}'"))?;
            }
            "host_key" => config.host_key = value,
            "authorized_keys" => config.authorized_keys = Some(value),
            "auth_method" => {
                config.auth_method = parse_auth_method(&value)
                    .ok_or_else(|| format!("{line_num}: invalid auth_method '{value}'"))?;
            }
            "auth_timeout" => {
                config.auth_timeout_secs = value
                    .parse()
                    .map_err(|_| format!("{line_num}: invalid auth_timeout '{value}'"))?;
            }
            "secret" => config.secret = Some(value),
            "secret_file" => config.secret_file = Some(value),
            "secret_env" => config.secret_env = Some(value),
            "secret_encrypted" => {
                config.secret_encrypted = matches!(value.as_str(), "true" | "1" | "yes");
            }
            "auth_password" => config.auth_password = Some(value),
            "auth_password_file" => config.auth_password_file = Some(value),
            "auth_password_env" => config.auth_password_env = Some(value),
            "auth_user" => config.auth_user = Some(value),
            "auth_user_file" => config.auth_user_file = Some(value),
            "auth_user_env" => config.auth_user_env = Some(value),
            "log_level" => config.log_level = value,
            "log_file" => config.log_file = Some(value),
            _ => {}
        }
    }

    Ok(())
}

fn parse_auth_method(value: &str) -> Option<AuthMethod> {
    match value.trim().to_lowercase().as_str() {
        "publickey" => Some(AuthMethod::Publickey),
        "password" => Some(AuthMethod::Password),
        "both" => Some(AuthMethod::Both),
        _ => None,
    }
}

fn count_set(fields: &[&Option<String>]) -> usize {
    fields.iter().filter(|f| f.is_some()).count()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parsed(content: &str) -> Config {
        let mut config = Config::default();
        apply_config_file(&mut config, content).unwrap();
        config
    }

    /// A minimal config that passes validation.
    fn valid_base() -> Config {
        let mut config = Config::default();
        config.authorized_keys = Some("config/authorized_keys".into());
        config.secret = Some("hello".into());
        config
    }

    // ─── Config file parsing ─────────────────────────────────────────────

    #[test]
    fn parse_basic_config_file() {
        let config = parsed(
            r#"
port = 2022
host_key = /etc/ssh-drop/host_key
authorized_keys = /etc/ssh-drop/authorized_keys
auth_method = both
auth_timeout = 5
secret = hello
log_level = debug
"#,
        );
        assert_eq!(config.port, 2022);
        assert_eq!(config.host_key, "/etc/ssh-drop/host_key");
        assert_eq!(
            config.authorized_keys,
            Some("/etc/ssh-drop/authorized_keys".into())
        );
        assert_eq!(config.auth_method, AuthMethod::Both);
        assert_eq!(config.auth_timeout_secs, 5);
        assert_eq!(config.secret, Some("hello".into()));
        assert_eq!(config.log_level, "debug");
    }

    #[test]
    fn parse_quoted_values() {
        let config = parsed(
            r#"
secret = "spaced out secret"
auth_password = 'p4ss'
"#,
        );
        assert_eq!(config.secret, Some("spaced out secret".into()));
        assert_eq!(config.auth_password, Some("p4ss".into()));
    }

    #[test]
    fn comments_and_blank_lines_ignored() {
        let config = parsed(
            r#"
# delivery point for the db password
port = 2200

  # indented comment
secret = tok
"#,
        );
        assert_eq!(config.port, 2200);
        assert_eq!(config.secret, Some("tok".into()));
    }

    #[test]
    fn unknown_keys_ignored() {
        let config = parsed("unknown_key = some_value\nport = 2201\n");
        assert_eq!(config.port, 2201);
    }

    #[test]
    fn line_without_equals_is_an_error() {
        let mut config = Config::default();
        let err = apply_config_file(&mut config, "port = 2222\nno equals here\n").unwrap_err();
        assert!(err.starts_with("2:"), "got: {err}");
        assert!(err.contains("key = value"));
    }

    #[test]
    fn empty_key_is_an_error() {
        let mut config = Config::default();
        let err = apply_config_file(&mut config, "= value\n").unwrap_err();
        assert!(err.contains("empty key"));
    }

    #[test]
    fn duplicate_keys_last_wins() {
        let config = parsed("port = 1111\nport = 2222\n");
        assert_eq!(config.port, 2222);
    }

    #[test]
    fn values_are_trimmed() {
        let config = parsed("secret =    padded value   \n");
        assert_eq!(config.secret, Some("padded value".into()));
    }

    #[test]
    fn auth_method_parsing() {
        assert_eq!(parse_auth_method("publickey"), Some(AuthMethod::Publickey));
        assert_eq!(parse_auth_method("password"), Some(AuthMethod::Password));
        assert_eq!(parse_auth_method("both"), Some(AuthMethod::Both));
        assert_eq!(parse_auth_method("  Both  "), Some(AuthMethod::Both));
        assert_eq!(parse_auth_method("kerberos"), None);
    }

    #[test]
    fn bad_auth_method_is_an_error() {
        let mut config = Config::default();
        assert!(apply_config_file(&mut config, "auth_method = kerberos\n").is_err());
    }

    #[test]
    fn secret_encrypted_booleans() {
        assert!(parsed("secret_encrypted = true\n").secret_encrypted);
        assert!(parsed("secret_encrypted = yes\n").secret_encrypted);
        assert!(parsed("secret_encrypted = 1\n").secret_encrypted);
        assert!(!parsed("secret_encrypted = false\n").secret_encrypted);
        assert!(!parsed("secret_encrypted = banana\n").secret_encrypted);
    }

    // ─── Port and timeout boundaries ─────────────────────────────────────

    #[test]
    fn port_boundaries() {
        assert_eq!(parsed("port = 1\n").port, 1);
        assert_eq!(parsed("port = 65535\n").port, 65535);

        let mut config = Config::default();
        assert!(apply_config_file(&mut config, "port = 65536\n").is_err());
        assert!(apply_config_file(&mut config, "port = -1\n").is_err());
        assert!(apply_config_file(&mut config, "port = ssh\n").is_err());
    }

    #[test]
    fn port_zero_rejected_by_validation() {
        let mut config = valid_base();
        config.port = 0;
        assert!(config.validate().unwrap_err().contains("port"));
    }

    #[test]
    fn auth_timeout_boundaries() {
        assert_eq!(parsed("auth_timeout = 1\n").auth_timeout_secs, 1);

        let mut config = valid_base();
        config.auth_timeout_secs = 0;
        assert!(config.validate().unwrap_err().contains("auth_timeout"));

        config.auth_timeout_secs = 1;
        assert!(config.validate().is_ok());
    }

    // ─── Validation ──────────────────────────────────────────────────────

    #[test]
    fn validate_minimal_pubkey_config() {
        assert!(valid_base().validate().is_ok());
    }

    #[test]
    fn validate_no_secret_fails() {
        let mut config = valid_base();
        config.secret = None;
        assert!(config.validate().unwrap_err().contains("secret"));
    }

    #[test]
    fn validate_two_secret_sources_fail() {
        let mut config = valid_base();
        config.secret_env = Some("SECRET".into());
        assert!(config.validate().unwrap_err().contains("exactly one"));
    }

    #[test]
    fn validate_pubkey_requires_authorized_keys() {
        let mut config = valid_base();
        config.authorized_keys = None;
        assert!(
            config
                .validate()
                .unwrap_err()
                .contains("authorized_keys")
        );
    }

    #[test]
    fn validate_password_mode_requires_password() {
        let mut config = valid_base();
        config.auth_method = AuthMethod::Password;
        config.authorized_keys = None;
        assert!(config.validate().unwrap_err().contains("auth_password"));

        config.auth_password = Some("s3cret".into());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn validate_password_mode_rejects_two_password_sources() {
        let mut config = valid_base();
        config.auth_method = AuthMethod::Password;
        config.authorized_keys = None;
        config.auth_password = Some("a".into());
        config.auth_password_env = Some("B".into());
        assert!(config.validate().is_err());
    }

    #[test]
    fn validate_both_mode_requires_keys_and_password() {
        let mut config = valid_base();
        config.auth_method = AuthMethod::Both;
        assert!(config.validate().is_err()); // password missing

        config.auth_password_file = Some("/run/pw".into());
        assert!(config.validate().is_ok());

        config.authorized_keys = None;
        assert!(config.validate().is_err());
    }

    #[test]
    fn validate_at_most_one_user_source() {
        let mut config = valid_base();
        config.auth_user = Some("deploy".into());
        assert!(config.validate().is_ok());

        config.auth_user_env = Some("DEPLOY_USER".into());
        assert!(config.validate().unwrap_err().contains("at most one"));
    }

    #[test]
    fn password_only_mode_does_not_need_keys() {
        let mut config = Config::default();
        config.auth_method = AuthMethod::Password;
        config.auth_password = Some("pw".into());
        config.secret = Some("tok".into());
        assert!(config.validate().is_ok());
    }

    // ─── Source builders ─────────────────────────────────────────────────

    #[test]
    fn secret_source_plain() {
        let config = valid_base();
        let source = config.secret_source().unwrap();
        assert!(!source.needs_passphrase());
        assert_eq!(&*source.get_secret(None).unwrap(), b"hello");
    }

    #[test]
    fn secret_source_encrypted_wraps() {
        let mut config = valid_base();
        config.secret_encrypted = true;
        assert!(config.secret_source().unwrap().needs_passphrase());
    }

    #[test]
    fn user_source_absent_by_default() {
        assert!(valid_base().user_source().is_none());
    }

    // ─── Round trip ──────────────────────────────────────────────────────

    #[test]
    fn parse_is_idempotent_over_reserialization() {
        let original = parsed(
            r#"
port = 2022
auth_method = both
authorized_keys = /etc/ak
auth_password = pw
secret = s
auth_timeout = 3
"#,
        );

        // Re-serialize the populated fields and parse again.
        let serialized = format!(
            "port = {}\nauth_method = {}\nauthorized_keys = {}\nauth_password = {}\nsecret = {}\nauth_timeout = {}\n",
            original.port,
            original.auth_method,
            original.authorized_keys.as_deref().unwrap(),
            original.auth_password.as_deref().unwrap(),
            original.secret.as_deref().unwrap(),
            original.auth_timeout_secs,
        );
        let reparsed = parsed(&serialized);

        assert_eq!(reparsed.port, original.port);
        assert_eq!(reparsed.auth_method, original.auth_method);
        assert_eq!(reparsed.authorized_keys, original.authorized_keys);
        assert_eq!(reparsed.auth_password, original.auth_password);
        assert_eq!(reparsed.secret, original.secret);
        assert_eq!(reparsed.auth_timeout_secs, original.auth_timeout_secs);
    }
}
