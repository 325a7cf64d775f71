use abkit_core::split::sort_segments;
use abkit_core::{BackupPacker, Category, PackageInfo};
use anyhow::{Context, Result};
use clap::Args;
use std::collections::BTreeMap;
use std::path::PathBuf;
use tracing::{info, warn};

#[derive(Args)]
pub struct PackCommand {
    #[arg(long, help = "Package name")]
    package: String,

    #[arg(long, default_value_t = 0, help = "Package version code")]
    version_code: i64,

    #[arg(long, help = "Installer package name")]
    installer: Option<String>,

    #[arg(long = "signature", help = "Signing certificate as hex-encoded DER (repeatable)")]
    signatures: Vec<String>,

    #[arg(long, help = "Segment files holding the APKs")]
    source: Vec<PathBuf>,

    #[arg(long, help = "Segment files holding credential-encrypted app data")]
    internal_ce: Vec<PathBuf>,

    #[arg(long, help = "Segment files holding device-encrypted app data")]
    internal_de: Vec<PathBuf>,

    #[arg(long, help = "Segment files holding external storage data")]
    external: Vec<PathBuf>,

    #[arg(long, help = "Segment files holding OBB expansion files")]
    obb: Vec<PathBuf>,

    #[arg(long, help = "Target API level (selects the format version)")]
    api: Option<u32>,

    #[arg(long, help = "Do not deflate the archive payload")]
    no_compress: bool,

    #[arg(long, help = "Compression of the segment files (z = gzip, j = bzip2)")]
    tar_type: Option<String>,

    #[arg(long, help = "Prompt for a password and encrypt the archive")]
    encrypt: bool,

    #[arg(short, long, help = "Output .ab file")]
    output: PathBuf,
}

impl PackCommand {
    fn segments(&self) -> BTreeMap<Category, Vec<PathBuf>> {
        let mut segments = BTreeMap::new();
        for (category, files) in [
            (Category::Source, &self.source),
            (Category::InternalCe, &self.internal_ce),
            (Category::InternalDe, &self.internal_de),
            (Category::External, &self.external),
            (Category::Obb, &self.obb),
        ] {
            if files.is_empty() {
                continue;
            }
            let mut files = files.clone();
            sort_segments(&mut files);
            segments.insert(category, files);
        }
        segments
    }

    pub async fn run(&self, cli: &crate::Cli) -> Result<()> {
        let mut settings = crate::load_settings(cli)?;
        if let Some(api) = self.api {
            settings.api_level = api;
        }
        if self.no_compress {
            settings.compress = false;
        }
        if let Some(tar_type) = &self.tar_type {
            settings.tar_type = tar_type.parse()?;
        }
        settings.validate()?;

        let signatures = self
            .signatures
            .iter()
            .map(|sig| hex::decode(sig).with_context(|| format!("Invalid signature hex: {}", sig)))
            .collect::<Result<Vec<_>>>()?;
        let package = PackageInfo {
            package_name: self.package.clone(),
            version_code: self.version_code,
            signatures,
        };

        let segments = self.segments();
        if segments.is_empty() {
            warn!("No segment files given, the archive will only contain the manifest");
        }
        let password = crate::commands::password_for_writing(cli, self.encrypt)?;

        info!("Packing {} into {}", self.package, self.output.display());
        let pb = crate::commands::spinner(cli, format!("Packing {}...", self.package))?;
        let packer = BackupPacker::new(package, self.installer.clone(), settings.pack_options());
        let output = self.output.clone();
        let encrypted = password.is_some();
        let summary = tokio::task::spawn_blocking(move || packer.pack(&segments, &output, password.as_ref()))
            .await?
            .with_context(|| format!("Failed to pack {}", self.package))?;
        pb.finish_with_message(format!("Packed {} entries", summary.entries));

        println!("✅ Created {}", self.output.display());
        println!("   Package:   {}", self.package);
        println!("   Entries:   {}", summary.entries);
        println!("   Data:      {:.2} MB", summary.bytes as f64 / 1024.0 / 1024.0);
        println!("   Encrypted: {}", if encrypted { "yes" } else { "no" });
        for (category, count) in &summary.per_category {
            println!("   {:<12} {} entries", format!("{}:", category), count);
        }
        Ok(())
    }
}
