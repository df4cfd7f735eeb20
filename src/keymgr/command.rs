//! External passphrase command.
//!
//! The operator configures a shell command template; the key manager runs it
//! and reads the passphrase from its stdout. `%p` in the template expands to
//! the fixed prompt, `%%` to a literal percent. Output is taken verbatim:
//! trailing newlines are part of the passphrase, so bootstrap and every
//! later startup must run the identical template.

use std::io::Read;
use std::process::{Command, Stdio};

use secrecy::ExposeSecret;
use thiserror::Error;
use zeroize::Zeroizing;

use super::PASSPHRASE_MAX_LEN;
use super::crypto::SecretBytes;

/// Prompt substituted for `%p` in the command template.
pub const PASSPHRASE_PROMPT: &str = "Enter database encryption pass phrase:";

/// Upper bound on the substituted command line; longer templates are
/// truncated without error.
const COMMAND_MAX_LEN: usize = 1024;

#[derive(Debug, Error)]
pub enum CommandError {
    #[error("could not execute passphrase command")]
    Spawn(#[source] std::io::Error),

    #[error("could not read from passphrase command")]
    Read(#[source] std::io::Error),

    #[error("passphrase command failed: {0}")]
    Exit(std::process::ExitStatus),
}

/// A passphrase as read from the command, zeroized on drop.
pub struct Passphrase {
    bytes: SecretBytes,
}

impl Passphrase {
    fn new(bytes: &[u8]) -> Self {
        Self {
            bytes: SecretBytes::from(bytes.to_vec()),
        }
    }

    pub fn len(&self) -> usize {
        self.bytes.expose_secret().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub(crate) fn expose(&self) -> &[u8] {
        self.bytes.expose_secret()
    }
}

/// Expand `%`-escapes in the command template.
///
/// `%p` becomes the prompt, `%%` a literal `%`, any other `%X` just `X`.
pub(crate) fn substitute_template(template: &str) -> String {
    let mut out = String::with_capacity(template.len());
    let mut chars = template.chars();

    while let Some(c) = chars.next() {
        if c != '%' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some('p') => out.push_str(PASSPHRASE_PROMPT),
            Some(other) => out.push(other),
            None => out.push('%'),
        }
    }

    truncate_to_char_boundary(&mut out, COMMAND_MAX_LEN);
    out
}

fn truncate_to_char_boundary(s: &mut String, max: usize) {
    if s.len() <= max {
        return;
    }
    let mut end = max;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    s.truncate(end);
}

/// Run the passphrase command and return what it wrote to stdout, up to
/// `PASSPHRASE_MAX_LEN` bytes. Length validation is the caller's job.
pub fn run_passphrase_command(template: &str) -> Result<Passphrase, CommandError> {
    let command = substitute_template(template);

    let mut child = Command::new("sh")
        .arg("-c")
        .arg(&command)
        .stdout(Stdio::piped())
        .spawn()
        .map_err(CommandError::Spawn)?;

    let mut buf = Zeroizing::new(Vec::with_capacity(PASSPHRASE_MAX_LEN + 1));
    let read_result = match child.stdout.take() {
        Some(stdout) => stdout
            .take(PASSPHRASE_MAX_LEN as u64)
            .read_to_end(&mut buf)
            .map(|_| ()),
        None => Ok(()),
    };
    // The pipe is closed here; a command still writing sees EPIPE and that
    // surfaces below as a failed exit status.

    if let Err(err) = read_result {
        let _ = child.kill();
        let _ = child.wait();
        return Err(CommandError::Read(err));
    }

    let status = child.wait().map_err(CommandError::Read)?;
    if !status.success() {
        return Err(CommandError::Exit(status));
    }

    Ok(Passphrase::new(&buf))
}
