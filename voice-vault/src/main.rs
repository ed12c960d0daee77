//! Voice vault CLI

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use tracing::info;
use voice_vault::{
    init_logging, ArtifactDisposition, DecryptOutcome, EncryptOutcome, VaultConfig, VoiceVault,
    Waveform,
};

#[derive(Parser)]
#[command(name = "voice-vault")]
#[command(about = "Voice-authenticated file encryption", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// JSON config file (defaults and VOICE_VAULT_* variables otherwise)
    #[arg(long, global = true)]
    config: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Enroll an identity from reference recordings
    Enroll {
        /// Identity label
        identity: String,
        /// WAV recordings of the voice
        #[arg(required = true)]
        recordings: Vec<PathBuf>,
    },

    /// Encrypt a file after verifying the voice
    Encrypt {
        identity: String,
        /// WAV recording used to authenticate
        voice: PathBuf,
        /// File to encrypt
        input: PathBuf,
        /// Artifact path (default: <input>.enc)
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Decrypt an artifact after verifying the voice
    Decrypt {
        identity: String,
        /// WAV recording used to authenticate
        voice: PathBuf,
        /// Artifact to decrypt
        artifact: PathBuf,
        /// Output path (default: <artifact> with .dec)
        #[arg(short, long)]
        output: Option<PathBuf>,
        /// Delete the artifact after a successful decrypt
        #[arg(long)]
        remove_artifact: bool,
    },

    /// Score a recording against an enrolled identity
    Verify {
        identity: String,
        voice: PathBuf,
    },

    /// List encrypted artifacts in a directory
    List {
        #[arg(default_value = ".")]
        dir: PathBuf,
    },
}

fn main() -> anyhow::Result<()> {
    init_logging();

    let cli = Cli::parse();

    let config = match &cli.config {
        Some(path) => VaultConfig::from_json_file(path)
            .with_context(|| format!("Failed to load config {}", path.display()))?,
        None => VaultConfig::from_env().context("Invalid VOICE_VAULT_* environment")?,
    };

    if let Commands::List { dir } = &cli.command {
        for artifact in VoiceVault::list_artifacts(dir)? {
            println!("{}", artifact.display());
        }
        return Ok(());
    }

    let vault = VoiceVault::new(config)?;

    match cli.command {
        Commands::Enroll {
            identity,
            recordings,
        } => {
            let templates = vault.enroll_wav_files(&identity, &recordings)?;
            println!("Enrolled '{}' with {} templates", identity, templates.len());
        }

        Commands::Encrypt {
            identity,
            voice,
            input,
            output,
        } => {
            let voice = load_voice(&voice)?;
            let output = output.unwrap_or_else(|| VoiceVault::default_artifact_path(&input));

            match vault.encrypt_file(&identity, &voice, &input, &output)? {
                EncryptOutcome::Accepted {
                    similarity,
                    artifact,
                } => {
                    println!(
                        "Encrypted to {} (similarity {:.3})",
                        artifact.display(),
                        similarity.max_similarity
                    );
                }
                EncryptOutcome::Rejected { similarity, reason } => {
                    bail!(
                        "Voice not authorized ({:?}, similarity {:.3})",
                        reason,
                        similarity.max_similarity
                    );
                }
            }
        }

        Commands::Decrypt {
            identity,
            voice,
            artifact,
            output,
            remove_artifact,
        } => {
            let voice = load_voice(&voice)?;
            let output = output.unwrap_or_else(|| VoiceVault::default_decrypted_path(&artifact));
            let disposition = if remove_artifact {
                ArtifactDisposition::Remove
            } else {
                ArtifactDisposition::Keep
            };

            match vault.decrypt_file(&identity, &voice, &artifact, &output, disposition)? {
                DecryptOutcome::Accepted { similarity, output } => {
                    println!(
                        "Decrypted to {} (similarity {:.3})",
                        output.display(),
                        similarity.max_similarity
                    );
                }
                DecryptOutcome::Rejected { similarity, reason } => {
                    bail!(
                        "Voice not authorized ({:?}, similarity {:.3})",
                        reason,
                        similarity.max_similarity
                    );
                }
            }
        }

        Commands::Verify { identity, voice } => {
            let voice = load_voice(&voice)?;
            let result = vault.verify(&identity, &voice)?;
            println!("{}", serde_json::to_string_pretty(&result)?);
        }

        Commands::List { .. } => {}
    }

    info!("Done");
    Ok(())
}

fn load_voice(path: &Path) -> anyhow::Result<Waveform> {
    Waveform::from_wav_file(path).with_context(|| format!("Failed to read {}", path.display()))
}
