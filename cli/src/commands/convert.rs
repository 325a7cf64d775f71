use abkit_core::{WriteOptions, ab_to_tar, tar_to_ab};
use anyhow::{Context, Result};
use clap::Args;
use std::path::PathBuf;
use tracing::info;

#[derive(Args)]
pub struct ToTarCommand {
    #[arg(help = "Backup file to read")]
    input: PathBuf,

    #[arg(help = "Tar file to write")]
    output: PathBuf,
}

impl ToTarCommand {
    pub async fn run(&self, cli: &crate::Cli) -> Result<()> {
        let password = crate::commands::password_for_reading(cli, &self.input)?;
        let pb = crate::commands::spinner(cli, format!("Converting {}...", self.input.display()))?;
        let input = self.input.clone();
        let output = self.output.clone();
        let header = tokio::task::spawn_blocking(move || ab_to_tar(&input, &output, password.as_ref()))
            .await?
            .with_context(|| format!("Failed to convert {}", self.input.display()))?;
        pb.finish_and_clear();

        info!("Archive format version {}", header.version);
        println!("✅ Wrote {}", self.output.display());
        Ok(())
    }
}

#[derive(Args)]
pub struct FromTarCommand {
    #[arg(help = "Tar file to read")]
    input: PathBuf,

    #[arg(help = "Backup file to write")]
    output: PathBuf,

    #[arg(long, help = "Target API level (selects the format version)")]
    api: Option<u32>,

    #[arg(long, help = "Do not deflate the archive payload")]
    no_compress: bool,

    #[arg(long, help = "Prompt for a password and encrypt the archive")]
    encrypt: bool,
}

impl FromTarCommand {
    pub async fn run(&self, cli: &crate::Cli) -> Result<()> {
        let mut settings = crate::load_settings(cli)?;
        if let Some(api) = self.api {
            settings.api_level = api;
        }
        if self.no_compress {
            settings.compress = false;
        }
        settings.validate()?;

        let options = WriteOptions {
            compress: settings.compress,
            rounds: settings.pbkdf2_rounds,
            ..WriteOptions::for_api_level(settings.api_level)?
        };
        let password = crate::commands::password_for_writing(cli, self.encrypt)?;
        let encrypted = password.is_some();

        let pb = crate::commands::spinner(cli, format!("Converting {}...", self.input.display()))?;
        let input = self.input.clone();
        let output = self.output.clone();
        let bytes = tokio::task::spawn_blocking(move || tar_to_ab(&input, &output, &options, password.as_ref()))
            .await?
            .with_context(|| format!("Failed to convert {}", self.input.display()))?;
        pb.finish_and_clear();

        println!("✅ Wrote {}", self.output.display());
        println!("   Version:    {}", options.version);
        println!("   Compressed: {}", if options.compress { "yes" } else { "no" });
        println!("   Encrypted:  {}", if encrypted { "yes" } else { "no" });
        println!("   Tar size:   {:.2} MB", bytes as f64 / 1024.0 / 1024.0);
        Ok(())
    }
}
