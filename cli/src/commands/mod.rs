pub mod convert;
pub mod inspect;
pub mod pack;
pub mod unpack;

use abkit_core::{BackupHeader, Password};
use anyhow::{Context, Result, anyhow};
use indicatif::{ProgressBar, ProgressStyle};
use std::fs::File;
use std::io::{self, BufReader, Write};
use std::path::Path;
use std::time::Duration;

fn read_password(prompt: &str) -> Result<String> {
    print!("{}", prompt);
    io::stdout().flush()?;
    rpassword::read_password().context("Failed to read password")
}

/// Password for a new archive. Prompts (with confirmation) only when
/// `encrypt` is set and none was given on the command line.
pub fn password_for_writing(cli: &crate::Cli, encrypt: bool) -> Result<Option<Password>> {
    if let Some(password) = &cli.password {
        return Ok(Some(Password::from(password.as_str())));
    }
    if !encrypt {
        return Ok(None);
    }
    let first = Password::from(read_password("Enter backup password: ")?);
    let second = Password::from(read_password("Confirm backup password: ")?);
    if first.is_empty() {
        return Err(anyhow!("Password must not be empty"));
    }
    if first != second {
        return Err(anyhow!("Passwords do not match"));
    }
    Ok(Some(first))
}

/// Password for an existing archive. Only prompts when the header says
/// the archive is encrypted.
pub fn password_for_reading(cli: &crate::Cli, archive: &Path) -> Result<Option<Password>> {
    if let Some(password) = &cli.password {
        return Ok(Some(Password::from(password.as_str())));
    }
    let header = read_header(archive)?;
    if !header.is_encrypted() {
        return Ok(None);
    }
    Ok(Some(Password::from(read_password("Enter backup password: ")?)))
}

pub fn read_header(archive: &Path) -> Result<BackupHeader> {
    let file = File::open(archive).with_context(|| format!("Cannot open {}", archive.display()))?;
    let header = BackupHeader::read_from(&mut BufReader::new(file))
        .with_context(|| format!("Cannot read header of {}", archive.display()))?;
    Ok(header)
}

pub fn spinner(cli: &crate::Cli, message: impl Into<String>) -> Result<ProgressBar> {
    if cli.quiet {
        return Ok(ProgressBar::hidden());
    }
    let pb = ProgressBar::new_spinner();
    pb.set_style(ProgressStyle::default_spinner().template("{spinner:.green} [{elapsed_precise}] {msg}")?);
    pb.set_message(message.into());
    pb.enable_steady_tick(Duration::from_millis(100));
    Ok(pb)
}
