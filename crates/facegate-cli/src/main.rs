use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use facegate_core::backend::{ModelPaths, OnnxBackends};
use facegate_core::{
    Embedding, EnrollmentBuilder, EnrollmentCaptures, FaceEmbedder, HeadPoseClassifier, LivenessDetector, LookupError,
    ReferenceLookup, Task, VerificationOrchestrator, VerifyError, DEFAULT_SIMILARITY_THRESHOLD,
};
use image::RgbImage;
use std::path::{Path, PathBuf};
use std::sync::Arc;

#[derive(Parser)]
#[command(name = "facegate", about = "facegate offline face verification tools")]
struct Cli {
    /// Directory containing the ONNX models (default: $FACEGATE_MODEL_DIR or the XDG data dir)
    #[arg(long, global = true)]
    model_dir: Option<PathBuf>,

    /// Real-face score above which a capture counts as live
    #[arg(long, global = true, default_value_t = 0.5)]
    liveness_threshold: f32,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Print the embedding of the most confident face in an image
    Embed { image: PathBuf },
    /// Build a reference embedding from front, left and right captures
    Enroll {
        #[arg(long)]
        front: PathBuf,
        #[arg(long)]
        left: PathBuf,
        #[arg(long)]
        right: PathBuf,
        /// Write the reference as JSON here instead of stdout
        #[arg(short, long)]
        out: Option<PathBuf>,
    },
    /// Verify a capture against a reference written by `enroll`
    Verify {
        #[arg(long)]
        reference: PathBuf,
        #[arg(long)]
        image: PathBuf,
        /// Front, Left, Right, Up or Down ("Look Left" also accepted)
        #[arg(long, default_value = "Front")]
        task: String,
        #[arg(long, default_value_t = DEFAULT_SIMILARITY_THRESHOLD)]
        threshold: f32,
    },
    /// Report liveness and head direction for an image
    Pose { image: PathBuf },
    /// Check model files against their pinned checksums
    CheckModels,
}

/// The reference read from disk, whoever asks.
struct FileReference(Embedding);

impl ReferenceLookup for FileReference {
    fn reference_embedding(&self, _identity: &str) -> Result<Option<Embedding>, LookupError> {
        Ok(Some(self.0.clone()))
    }
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let model_dir = cli
        .model_dir
        .or_else(|| std::env::var_os("FACEGATE_MODEL_DIR").map(PathBuf::from))
        .unwrap_or_else(facegate_models::default_model_dir);

    let liveness_threshold = cli.liveness_threshold;
    let backends = || {
        OnnxBackends::load(&ModelPaths::from_dir(&model_dir), liveness_threshold)
            .with_context(|| format!("failed to load models from {}", model_dir.display()))
    };

    match cli.command {
        Commands::Embed { image } => {
            let backends = backends()?;
            let image = load(&image)?;
            let Some(embedding) = backends.embedder.embed(&image)? else {
                bail!("no face detected");
            };
            println!("{}", serde_json::to_string(&embedding)?);
        }
        Commands::Enroll { front, left, right, out } => {
            let backends = backends()?;
            let (front, left, right) = (load(&front)?, load(&left)?, load(&right)?);
            let builder = EnrollmentBuilder::new(backends.embedder);
            let reference = builder.build(&EnrollmentCaptures { front: &front, left: &left, right: &right })?;
            let json = serde_json::to_string_pretty(&reference)?;
            match out {
                Some(path) => {
                    std::fs::write(&path, json).with_context(|| format!("failed to write {}", path.display()))?;
                    println!("reference ({} dims) written to {}", reference.dim(), path.display());
                }
                None => println!("{json}"),
            }
        }
        Commands::Verify { reference, image, task, threshold } => {
            let task: Task = task.parse()?;
            let raw = std::fs::read_to_string(&reference)
                .with_context(|| format!("failed to read {}", reference.display()))?;
            let reference: Embedding = serde_json::from_str(&raw).context("reference is not an embedding")?;
            let image = load(&image)?;
            let backends = backends()?;

            let orchestrator = VerificationOrchestrator::new(
                backends.embedder,
                backends.liveness,
                backends.pose,
                Arc::new(FileReference(reference.clone())),
            )
            .with_similarity_threshold(threshold);

            match orchestrator.verify_against(&reference, &image, task) {
                Ok(outcome) => {
                    println!("face match:    {} (similarity {:.2})", outcome.face_match, outcome.similarity_rounded());
                    println!("liveness:      {}", outcome.liveness);
                    println!("task:          {task} (saw {})", outcome.detected_direction);
                    println!("task validity: {}", outcome.task_validity);
                    if !outcome.is_verified() {
                        bail!("verification failed");
                    }
                }
                Err(VerifyError::NoFaceDetected) => bail!("no face detected in the capture"),
                Err(e) => return Err(e.into()),
            }
        }
        Commands::Pose { image } => {
            let backends = backends()?;
            let image = load(&image)?;
            println!("liveness:  {}", backends.liveness.assess(&image)?);
            println!("direction: {}", backends.pose.classify(&image)?);
        }
        Commands::CheckModels => check_models(&model_dir)?,
    }

    Ok(())
}

fn check_models(model_dir: &Path) -> Result<()> {
    let mut failed = 0;
    for model in facegate_models::MODELS {
        let path = model_dir.join(model.name);
        match facegate_models::verify_model_file(model, &path) {
            Ok(()) => println!("ok       {}", model.name),
            Err(e) => {
                failed += 1;
                println!("FAILED   {}: {e}", model.name);
            }
        }
    }
    if failed > 0 {
        bail!("{failed} model(s) failed verification in {}", model_dir.display());
    }
    Ok(())
}

fn load(path: &Path) -> Result<RgbImage> {
    Ok(image::open(path)
        .with_context(|| format!("failed to open {}", path.display()))?
        .to_rgb8())
}
