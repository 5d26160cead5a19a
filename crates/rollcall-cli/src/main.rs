use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};

#[zbus::proxy(
    interface = "org.rollcall.Attendance1",
    default_service = "org.rollcall.Attendance1",
    default_path = "/org/rollcall/Attendance1"
)]
trait Attendance {
    async fn enroll(
        &self,
        identity_id: &str,
        class_id: &str,
        roll_number: &str,
        display_name: &str,
        embedding: &[f64],
        model_version: &str,
    ) -> zbus::Result<String>;

    async fn submit_attendance(
        &self,
        embedding: &[f64],
        model_version: &str,
        class_id: &str,
        subject_id: &str,
        date: &str,
        timeout_ms: u64,
    ) -> zbus::Result<String>;

    async fn capture_attendance(
        &self,
        frame: &[u8],
        content_type: &str,
        class_id: &str,
        subject_id: &str,
        date: &str,
        timeout_ms: u64,
    ) -> zbus::Result<String>;

    async fn finalize(&self, class_id: &str, subject_id: &str, date: &str)
        -> zbus::Result<String>;

    async fn list_identities(&self, class_id: &str) -> zbus::Result<String>;

    async fn remove_identity(&self, identity_id: &str) -> zbus::Result<bool>;

    async fn query_attendance(&self, filter: &str) -> zbus::Result<String>;

    async fn status(&self) -> zbus::Result<String>;
}

#[derive(Parser)]
#[command(name = "rollcall", about = "Rollcall face attendance CLI")]
struct Cli {
    /// Talk to a daemon on the session bus instead of the system bus
    #[arg(long, global = true)]
    session_bus: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Enroll a student from an embedding file ("-" for stdin)
    Enroll {
        #[arg(long)]
        id: String,
        #[arg(long)]
        class: String,
        #[arg(long)]
        roll: String,
        #[arg(long)]
        name: String,
        /// Path to the embedding JSON
        embedding: PathBuf,
    },
    /// Submit a captured embedding for attendance
    Submit {
        #[arg(long)]
        class: String,
        #[arg(long)]
        subject: String,
        /// Date as YYYY-MM-DD (default: today)
        #[arg(long)]
        date: Option<String>,
        /// Timeout in milliseconds (0 = daemon default)
        #[arg(long, default_value_t = 0)]
        timeout_ms: u64,
        /// Path to the embedding JSON
        embedding: PathBuf,
    },
    /// Submit an image frame; the daemon runs its extractor on it
    Capture {
        #[arg(long)]
        class: String,
        #[arg(long)]
        subject: String,
        #[arg(long)]
        date: Option<String>,
        #[arg(long, default_value_t = 0)]
        timeout_ms: u64,
        /// MIME type of the image (default: guessed from the file extension)
        #[arg(long)]
        content_type: Option<String>,
        /// Path to the encoded image
        frame: PathBuf,
    },
    /// Mark everyone without a record for the subject/date absent
    Finalize {
        #[arg(long)]
        class: String,
        #[arg(long)]
        subject: String,
        #[arg(long)]
        date: Option<String>,
    },
    /// List enrolled students
    List {
        #[arg(long)]
        class: Option<String>,
    },
    /// Remove an enrolled student
    Remove {
        /// Identity ID to remove
        id: String,
    },
    /// Show attendance history, newest first
    Attendance {
        #[arg(long)]
        class: Option<String>,
        #[arg(long)]
        subject: Option<String>,
        #[arg(long)]
        student: Option<String>,
        #[arg(long)]
        date: Option<String>,
        #[arg(long)]
        limit: Option<u32>,
    },
    /// Show daemon status
    Status,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    let session_bus = cli.session_bus
        || std::env::var("ROLLCALL_BUS").map(|v| v == "session").unwrap_or(false);
    let conn = if session_bus {
        zbus::Connection::session().await?
    } else {
        zbus::Connection::system().await?
    };
    let proxy = AttendanceProxy::new(&conn)
        .await
        .context("connecting to rollcalld")?;

    match cli.command {
        Commands::Enroll {
            id,
            class,
            roll,
            name,
            embedding,
        } => {
            let embedding = read_embedding(&embedding)?;
            let reply = proxy
                .enroll(&id, &class, &roll, &name, &embedding.values, embedding.model_version())
                .await?;
            print_json(&reply);
        }
        Commands::Submit {
            class,
            subject,
            date,
            timeout_ms,
            embedding,
        } => {
            let embedding = read_embedding(&embedding)?;
            let reply = proxy
                .submit_attendance(
                    &embedding.values,
                    embedding.model_version(),
                    &class,
                    &subject,
                    date.as_deref().unwrap_or(""),
                    timeout_ms,
                )
                .await?;
            print_outcome(&reply);
        }
        Commands::Capture {
            class,
            subject,
            date,
            timeout_ms,
            content_type,
            frame,
        } => {
            let bytes = std::fs::read(&frame)
                .with_context(|| format!("reading {}", frame.display()))?;
            let content_type = content_type.or_else(|| guess_content_type(&frame));
            let reply = proxy
                .capture_attendance(
                    &bytes,
                    content_type.as_deref().unwrap_or(""),
                    &class,
                    &subject,
                    date.as_deref().unwrap_or(""),
                    timeout_ms,
                )
                .await?;
            print_outcome(&reply);
        }
        Commands::Finalize {
            class,
            subject,
            date,
        } => {
            let reply = proxy
                .finalize(&class, &subject, date.as_deref().unwrap_or(""))
                .await?;
            print_json(&reply);
        }
        Commands::List { class } => {
            let reply = proxy
                .list_identities(class.as_deref().unwrap_or(""))
                .await?;
            print_json(&reply);
        }
        Commands::Remove { id } => {
            if proxy.remove_identity(&id).await? {
                println!("Removed {id}");
            } else {
                println!("No student with ID {id}");
            }
        }
        Commands::Attendance {
            class,
            subject,
            student,
            date,
            limit,
        } => {
            let filter = serde_json::json!({
                "class_id": class,
                "subject_id": subject,
                "identity_id": student,
                "date": date,
                "limit": limit,
            });
            let reply = proxy.query_attendance(&filter.to_string()).await?;
            print_json(&reply);
        }
        Commands::Status => {
            let reply = proxy.status().await?;
            print_json(&reply);
        }
    }

    Ok(())
}

/// Embedding read from a JSON file, with its model tag when the file has one.
#[derive(Debug, PartialEq)]
struct EmbeddingFile {
    values: Vec<f64>,
    model_version: Option<String>,
}

impl EmbeddingFile {
    /// Empty string tells the daemon the embedding is untagged.
    fn model_version(&self) -> &str {
        self.model_version.as_deref().unwrap_or("")
    }
}

/// Accepts a bare JSON array or an object with a `values` array and an
/// optional `model_version`.
fn read_embedding(path: &Path) -> Result<EmbeddingFile> {
    let text = if path == Path::new("-") {
        std::io::read_to_string(std::io::stdin())?
    } else {
        std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?
    };
    parse_embedding(&text)
}

fn parse_embedding(text: &str) -> Result<EmbeddingFile> {
    let value: serde_json::Value = serde_json::from_str(text).context("embedding is not JSON")?;
    let (array, model_version) = match &value {
        serde_json::Value::Array(a) => (a, None),
        serde_json::Value::Object(o) => {
            let array = match o.get("values") {
                Some(serde_json::Value::Array(a)) => a,
                _ => bail!("embedding object has no \"values\" array"),
            };
            let model_version = match o.get("model_version") {
                None | Some(serde_json::Value::Null) => None,
                Some(serde_json::Value::String(v)) => Some(v.clone()),
                Some(_) => bail!("\"model_version\" must be a string"),
            };
            (array, model_version)
        }
        _ => bail!("embedding must be a JSON array"),
    };
    let values = array
        .iter()
        .enumerate()
        .map(|(i, v)| {
            v.as_f64()
                .with_context(|| format!("embedding[{i}] is not a number"))
        })
        .collect::<Result<Vec<_>>>()?;
    Ok(EmbeddingFile {
        values,
        model_version,
    })
}

fn guess_content_type(path: &Path) -> Option<String> {
    let ext = path.extension()?.to_str()?.to_ascii_lowercase();
    let mime = match ext.as_str() {
        "jpg" | "jpeg" => "image/jpeg",
        "png" => "image/png",
        "webp" => "image/webp",
        "bmp" => "image/bmp",
        _ => return None,
    };
    Some(mime.to_string())
}

fn print_json(reply: &str) {
    match serde_json::from_str::<serde_json::Value>(reply) {
        Ok(v) => println!(
            "{}",
            serde_json::to_string_pretty(&v).unwrap_or_else(|_| reply.to_string())
        ),
        Err(_) => println!("{reply}"),
    }
}

fn print_outcome(reply: &str) {
    let Ok(v) = serde_json::from_str::<serde_json::Value>(reply) else {
        println!("{reply}");
        return;
    };
    match v["outcome"].as_str() {
        Some("recorded") => println!(
            "Attendance marked for {} (Roll No: {}), distance {:.3}",
            v["identity"]["display_name"].as_str().unwrap_or("?"),
            v["identity"]["roll_number"].as_str().unwrap_or("?"),
            v["score"].as_f64().unwrap_or(f64::NAN),
        ),
        Some("conflict") => println!("Attendance already recorded for today"),
        Some("no_match") => println!("No matching student found"),
        Some("failed") => println!("Failed to mark attendance: {}", v["cause"]),
        _ => print_json(reply),
    }
}
