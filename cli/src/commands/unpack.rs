use abkit_core::{BackupUnpacker, ManifestRecord, Password, StoredSet};
use anyhow::{Context, Result};
use clap::Args;
use std::path::{Path, PathBuf};
use tracing::info;

#[derive(Args)]
pub struct UnpackCommand {
    #[arg(help = "Backup file to unpack")]
    input: PathBuf,

    #[arg(long, help = "Package name the backup belongs to")]
    package: String,

    #[arg(short, long, help = "Directory for the per-category segment sets")]
    output: PathBuf,

    #[arg(
        long,
        default_value_t = 0,
        help = "Data index of the first data set (data<N>.tar.*); later sets count up from it"
    )]
    data_index: usize,

    #[arg(long, help = "Compression of the written segments (z = gzip, j = bzip2)")]
    tar_type: Option<String>,

    #[arg(long, help = "Maximum segment size in bytes")]
    split_size: Option<u64>,
}

impl UnpackCommand {
    pub async fn run(&self, cli: &crate::Cli) -> Result<()> {
        let mut settings = crate::load_settings(cli)?;
        if let Some(tar_type) = &self.tar_type {
            settings.tar_type = tar_type.parse()?;
        }
        if let Some(split_size) = self.split_size {
            settings.split_size = split_size;
        }
        settings.validate()?;

        let password = crate::commands::password_for_reading(cli, &self.input)?;

        info!("Unpacking {} for {}", self.input.display(), self.package);
        let pb = crate::commands::spinner(cli, format!("Unpacking {}...", self.input.display()))?;
        let unpacker = BackupUnpacker::new(&self.package, settings.unpack_options());
        let input = self.input.clone();
        let output = self.output.clone();
        let work_root = settings.temp_dir();
        let data_index = self.data_index;

        let (manifest, written) = tokio::task::spawn_blocking(move || {
            unpack_to(&unpacker, &input, &work_root, &output, data_index, password.as_ref())
        })
        .await?
        .with_context(|| format!("Failed to unpack {}", self.input.display()))?;
        pb.finish_with_message(format!("Wrote {} segment set(s)", written.len()));

        println!("✅ Unpacked {}", self.input.display());
        if let Some(manifest) = manifest {
            println!("   Package:      {}", manifest.package_name);
            println!("   Version code: {}", manifest.version_code);
            println!("   Platform SDK: {}", manifest.platform_sdk);
            if !manifest.installer.is_empty() {
                println!("   Installer:    {}", manifest.installer);
            }
        }
        for set in &written {
            println!("   {} (data index {}):", set.category, set.data_index);
            for file in &set.files {
                println!("     {}", file.display());
            }
        }
        Ok(())
    }
}

/// Extracts `input` and stores every category it holds under `output`.
fn unpack_to(
    unpacker: &BackupUnpacker,
    input: &Path,
    work_root: &Path,
    output: &Path,
    first_data_index: usize,
    password: Option<&Password>,
) -> abkit_core::Result<(Option<ManifestRecord>, Vec<StoredSet>)> {
    let extracted = unpacker.extract_file(input, work_root, password)?;
    let written = extracted.store_all(output, first_data_index)?;
    Ok((extracted.manifest().cloned(), written))
}
