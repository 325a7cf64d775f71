use anyhow::Result;
use clap::Args;
use serde_json::json;
use std::path::PathBuf;

#[derive(Args)]
pub struct InspectCommand {
    #[arg(help = "Backup file to inspect")]
    input: PathBuf,

    #[arg(long, help = "Print the header as JSON")]
    json: bool,
}

impl InspectCommand {
    pub async fn run(&self, _cli: &crate::Cli) -> Result<()> {
        let header = crate::commands::read_header(&self.input)?;

        if self.json {
            let encryption = header.encryption.as_ref().map(|params| {
                json!({
                    "user_salt": hex::encode(&params.user_salt),
                    "checksum_salt": hex::encode(&params.checksum_salt),
                    "rounds": params.rounds,
                    "user_iv": hex::encode(&params.user_iv),
                    "key_blob_size": params.key_blob.len(),
                })
            });
            let value = json!({
                "file": self.input.display().to_string(),
                "version": header.version.get(),
                "compressed": header.compressed,
                "algorithm": header.algorithm(),
                "encryption": encryption,
            });
            println!("{}", serde_json::to_string_pretty(&value)?);
            return Ok(());
        }

        println!("📦 {}", self.input.display());
        println!("   Version:    {}", header.version);
        println!("   Compressed: {}", if header.compressed { "yes" } else { "no" });
        println!("   Encryption: {}", header.algorithm());
        if let Some(params) = &header.encryption {
            println!("   PBKDF2 rounds: {}", params.rounds);
            println!("   User salt:     {}", hex::encode(&params.user_salt));
            println!("   Checksum salt: {}", hex::encode(&params.checksum_salt));
            println!("   User IV:       {}", hex::encode(&params.user_iv));
        }
        Ok(())
    }
}
