use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use rollcall_core::{CascadeDetector, IdentityId, ImageInput};
use rollcall_engine::{
    Config, EngineHandle, FaceRecognitionService, IdentityStore, SampleStore, SqliteIdentityStore,
};
use serde_json::json;
use std::path::{Path, PathBuf};
use std::sync::Arc;

#[derive(Parser)]
#[command(name = "rollcall", about = "Face enrollment and recognition for attendance")]
struct Cli {
    /// TOML configuration file; ROLLCALL_* variables override it
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Store a face sample for an identity and retrain
    Enroll {
        /// Identity id (must exist in the identity database)
        #[arg(short, long)]
        id: i64,
        /// Display name; defaults to the name on record
        #[arg(short, long)]
        name: Option<String>,
        /// Treat the file as base64 text (data URLs accepted)
        #[arg(long)]
        base64: bool,
        /// Image containing exactly one face
        image: PathBuf,
    },
    /// Detect and identify every face in an image
    Recognize {
        #[arg(long)]
        base64: bool,
        image: PathBuf,
    },
    /// Retrain the model from all stored samples
    Train,
    /// List stored face samples
    Samples {
        /// Only samples for this identity
        #[arg(long)]
        id: Option<i64>,
    },
    /// Manage identities in the identity database
    Identity {
        #[command(subcommand)]
        command: IdentityCommands,
    },
    /// Show model and store status
    Status,
}

#[derive(Subcommand)]
enum IdentityCommands {
    /// Add or rename an identity
    Add {
        id: i64,
        name: String,
    },
    /// List all identities
    List,
}

fn read_image(path: &Path, base64: bool) -> Result<ImageInput> {
    if base64 {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read {}", path.display()))?;
        Ok(ImageInput::Base64(text))
    } else {
        let bytes = std::fs::read(path).with_context(|| format!("failed to read {}", path.display()))?;
        Ok(ImageInput::Encoded(bytes))
    }
}

fn open_identities(config: &Config) -> Result<Arc<SqliteIdentityStore>> {
    let store = SqliteIdentityStore::open(&config.identity_db)
        .with_context(|| format!("failed to open identity database {}", config.identity_db.display()))?;
    Ok(Arc::new(store))
}

/// Build and load the service, then hand it to an engine thread.
fn start_engine(config: &Config, identities: Arc<SqliteIdentityStore>) -> Result<EngineHandle> {
    let detector = CascadeDetector::load(&config.cascade_path, config.detector)
        .with_context(|| format!("failed to load cascade {}", config.cascade_path.display()))?;
    tracing::info!(path = %config.cascade_path.display(), "cascade loaded");

    let service = FaceRecognitionService::new(config.clone(), Arc::new(detector))
        .with_identity_store(identities);
    service.load();
    EngineHandle::spawn(Arc::new(service)).context("failed to start engine")
}

fn print_json(value: &impl serde::Serialize) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let config = Config::load(cli.config.as_deref()).context("failed to load configuration")?;

    match cli.command {
        Commands::Enroll {
            id,
            name,
            base64,
            image,
        } => {
            let id = IdentityId(id);
            let input = read_image(&image, base64)?;
            let identities = open_identities(&config)?;
            let name = match name {
                Some(name) => name,
                None => identities
                    .lookup(id)?
                    .map(|identity| identity.name)
                    .unwrap_or_default(),
            };

            let engine = start_engine(&config, identities)?;
            let outcome = engine.enroll(input, id, name).await;
            print_json(&outcome)?;
            if !outcome.ok {
                bail!("enrollment failed");
            }
        }
        Commands::Recognize { base64, image } => {
            let input = read_image(&image, base64)?;
            let engine = start_engine(&config, open_identities(&config)?)?;
            let detections = engine.recognize(input).await?;
            print_json(&detections)?;
        }
        Commands::Train => {
            let engine = start_engine(&config, open_identities(&config)?)?;
            let status = engine.retrain().await?;
            print_json(&status)?;
        }
        Commands::Samples { id } => {
            let store = SampleStore::open(&config.data_dir)
                .with_context(|| format!("failed to open sample store {}", config.data_dir.display()))?;
            let samples: Vec<_> = match id {
                Some(id) => store.samples_for(IdentityId(id)).collect(),
                None => store.samples().iter().collect(),
            };
            print_json(&samples)?;
        }
        Commands::Identity { command } => {
            let identities = open_identities(&config)?;
            match command {
                IdentityCommands::Add { id, name } => {
                    identities.upsert(IdentityId(id), &name)?;
                    print_json(&json!({ "id": id, "name": name }))?;
                }
                IdentityCommands::List => print_json(&identities.all()?)?,
            }
        }
        Commands::Status => {
            let engine = start_engine(&config, open_identities(&config)?)?;
            let status = engine.status().await?;
            print_json(&json!({
                "status": status,
                "data_dir": config.data_dir,
                "model_path": config.model_path,
                "match_threshold": config.match_threshold,
            }))?;
        }
    }

    Ok(())
}
