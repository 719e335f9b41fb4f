//! Envelope tooling — `--encrypt` writes a secret to disk under a
//! passphrase, `--decrypt` opens one back up. Both are interactive:
//! passphrases come from a hidden prompt, never from argv.

use std::fs;
use std::io::{self, BufRead, Write};

use zeroize::Zeroizing;

use crate::crypto::{self, CryptoError};

/// Prompt for a passphrase twice, read one secret line from stdin, write the
/// envelope to `output_path`. Returns the process exit code.
pub fn run_encrypt(output_path: &str) -> i32 {
    let pass1 = match prompt("Passphrase: ") {
        Ok(p) => p,
        Err(e) => {
            eprintln!("Could not read passphrase: {e}");
            return 1;
        }
    };
    let pass2 = match prompt("Confirm passphrase: ") {
        Ok(p) => p,
        Err(e) => {
            eprintln!("Could not read passphrase: {e}");
            return 1;
        }
    };

    if *pass1 != *pass2 {
        eprintln!("Passphrases do not match");
        return 1;
    }
    if pass1.is_empty() {
        eprintln!("Passphrase must not be empty");
        return 1;
    }

    eprint!("Secret (single line): ");
    let _ = io::stderr().flush();
    let mut secret = Zeroizing::new(String::new());
    if let Err(e) = io::stdin().lock().read_line(&mut secret) {
        eprintln!("Could not read secret: {e}");
        return 1;
    }
    let secret_line = secret.trim_end_matches(['\r', '\n']);

    if secret_line.is_empty() {
        eprintln!("Secret must not be empty");
        return 1;
    }

    let envelope = match crypto::encrypt(secret_line.as_bytes(), &pass1) {
        Ok(envelope) => envelope,
        Err(e) => {
            eprintln!("Encryption failed: {e}");
            return 1;
        }
    };

    if let Err(e) = fs::write(output_path, envelope) {
        eprintln!("Could not write {output_path}: {e}");
        return 1;
    }

    eprintln!("Encrypted secret written to {output_path}");
    0
}

/// Prompt for the passphrase once and print the decrypted secret to stdout.
/// Returns the process exit code.
pub fn run_decrypt(input_path: &str) -> i32 {
    let data_b64 = match fs::read_to_string(input_path) {
        Ok(data) => data,
        Err(e) => {
            eprintln!("Could not read {input_path}: {e}");
            return 1;
        }
    };
    if data_b64.trim().is_empty() {
        eprintln!("Input file is empty");
        return 1;
    }

    let passphrase = match prompt("Passphrase: ") {
        Ok(p) => p,
        Err(e) => {
            eprintln!("Could not read passphrase: {e}");
            return 1;
        }
    };
    if passphrase.is_empty() {
        eprintln!("Passphrase must not be empty");
        return 1;
    }

    match crypto::decrypt(data_b64.trim(), &passphrase) {
        Ok(plaintext) => {
            let mut stdout = io::stdout().lock();
            if stdout.write_all(&plaintext).and_then(|_| stdout.flush()).is_err() {
                return 1;
            }
            0
        }
        Err(CryptoError::WrongPassphrase) => {
            println!("Wrong passphrase");
            1
        }
        Err(e) => {
            eprintln!("{e}");
            1
        }
    }
}

fn prompt(message: &str) -> io::Result<Zeroizing<String>> {
    rpassword::prompt_password(message).map(Zeroizing::new)
}
