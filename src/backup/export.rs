use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::process::Stdio;

use async_trait::async_trait;
use flate2::write::GzEncoder;
use flate2::Compression;
use thiserror::Error;
use tokio::fs::{self, File};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::process::Command;
use tracing::{debug, info};

use crate::cloud::Endpoint;

use super::naming::MasterCredential;

#[derive(Debug, Error)]
pub enum ExportError {
    #[error("failed to start {tool}: {source}")]
    Spawn {
        tool: String,
        #[source]
        source: io::Error,
    },

    #[error("{tool} exited with {code}: {stderr}")]
    ToolFailed {
        tool: String,
        code: String,
        stderr: String,
    },

    #[error("failed to write {path}: {source}")]
    Write {
        path: String,
        #[source]
        source: io::Error,
    },
}

const READ_CHUNK: usize = 64 * 1024;

/// SQL dialect family of the instance being exported
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Engine {
    MySql,
    Postgres,
}

impl Engine {
    pub fn from_engine_name(engine: &str) -> Self {
        if engine.starts_with("postgres") || engine.starts_with("aurora-postgresql") {
            Engine::Postgres
        } else {
            Engine::MySql
        }
    }

    fn default_tool(self) -> &'static str {
        match self {
            Engine::MySql => "mysqldump",
            Engine::Postgres => "pg_dump",
        }
    }
}

/// Everything needed to dump one database to a local file
#[derive(Debug, Clone)]
pub struct ExportRequest {
    pub engine: Engine,
    pub endpoint: Endpoint,
    pub username: String,
    pub password: MasterCredential,
    pub db_name: Option<String>,
    /// Gzip output path; parent directories are created as needed
    pub destination: PathBuf,
}

/// A finished local dump
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExportedFile {
    pub path: PathBuf,
    pub size: u64,
}

/// Produces a compressed logical dump of a database
#[async_trait]
pub trait Exporter: Send + Sync {
    async fn export(&self, request: &ExportRequest) -> Result<ExportedFile, ExportError>;
}

/// Runs the engine's native dump tool and gzips its output
pub struct DumpToolExporter {
    tool_override: Option<String>,
}

impl DumpToolExporter {
    pub fn new(tool_override: Option<String>) -> Self {
        Self { tool_override }
    }

    fn command(&self, request: &ExportRequest) -> (String, Command) {
        let tool = self
            .tool_override
            .clone()
            .unwrap_or_else(|| request.engine.default_tool().to_string());
        let mut cmd = Command::new(&tool);
        let port = request.endpoint.port.to_string();

        match request.engine {
            Engine::MySql => {
                cmd.env("MYSQL_PWD", request.password.expose())
                    .args(["--single-transaction", "--routines", "--triggers"])
                    .args(["-h", &request.endpoint.address, "-P", &port])
                    .args(["-u", &request.username]);
                match &request.db_name {
                    Some(db) => cmd.arg(db),
                    None => cmd.arg("--all-databases"),
                };
            }
            Engine::Postgres => {
                cmd.env("PGPASSWORD", request.password.expose())
                    .args(["-h", &request.endpoint.address, "-p", &port])
                    .args(["-U", &request.username, "--no-password"])
                    .arg(request.db_name.as_deref().unwrap_or("postgres"));
            }
        }
        (tool, cmd)
    }
}

#[async_trait]
impl Exporter for DumpToolExporter {
    async fn export(&self, request: &ExportRequest) -> Result<ExportedFile, ExportError> {
        let (tool, cmd) = self.command(request);
        let destination = request.destination.clone();
        info!(
            "Running {} against {}:{} into {}",
            tool,
            request.endpoint.address,
            request.endpoint.port,
            destination.display()
        );

        run_dump(tool, cmd, &destination).await
    }
}

fn write_error(path: &Path) -> impl FnOnce(io::Error) -> ExportError + '_ {
    move |source| ExportError::Write {
        path: path.display().to_string(),
        source,
    }
}

async fn run_dump(tool: String, mut cmd: Command, destination: &Path) -> Result<ExportedFile, ExportError> {
    if let Some(parent) = destination.parent() {
        fs::create_dir_all(parent).await.map_err(write_error(parent))?;
    }
    let mut file = File::create(destination).await.map_err(write_error(destination))?;

    let mut child = cmd
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .map_err(|source| ExportError::Spawn {
            tool: tool.clone(),
            source,
        })?;

    // stderr is drained alongside stdout so a chatty tool cannot block on a full pipe
    let stdout = child.stdout.take();
    let stderr = child.stderr.take();
    let (copied, stderr) = tokio::join!(gzip_into(stdout, &mut file), read_all(stderr));

    let status = child.wait().await.map_err(|source| ExportError::Spawn {
        tool: tool.clone(),
        source,
    })?;

    if !status.success() {
        return Err(ExportError::ToolFailed {
            tool,
            code: status
                .code()
                .map(|c| c.to_string())
                .unwrap_or_else(|| "signal".to_string()),
            stderr: stderr.lines().next().unwrap_or_default().to_string(),
        });
    }

    let raw_bytes = copied.map_err(write_error(destination))?;
    let size = fs::metadata(destination)
        .await
        .map_err(write_error(destination))?
        .len();
    debug!(
        "Dump finished: {} raw bytes, {} compressed",
        raw_bytes, size
    );

    Ok(ExportedFile {
        path: destination.to_path_buf(),
        size,
    })
}

/// Compresses `source` into `file` chunk by chunk. Returns the raw byte count.
async fn gzip_into<R>(source: Option<R>, file: &mut File) -> io::Result<u64>
where
    R: AsyncRead + Unpin,
{
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    let mut raw_bytes = 0;
    if let Some(mut source) = source {
        let mut chunk = vec![0u8; READ_CHUNK];
        loop {
            let n = source.read(&mut chunk).await?;
            if n == 0 {
                break;
            }
            raw_bytes += n as u64;
            encoder.write_all(&chunk[..n])?;
            if !encoder.get_ref().is_empty() {
                file.write_all(encoder.get_ref()).await?;
                encoder.get_mut().clear();
            }
        }
    }
    let tail = encoder.finish()?;
    file.write_all(&tail).await?;
    file.flush().await?;
    Ok(raw_bytes)
}

async fn read_all<R>(source: Option<R>) -> String
where
    R: AsyncRead + Unpin,
{
    let mut buf = String::new();
    if let Some(mut source) = source {
        let _ = source.read_to_string(&mut buf).await;
    }
    buf
}

#[cfg(test)]
mod tests {
    use super::*;
    use flate2::read::GzDecoder;
    use std::io::Read;

    fn request(destination: PathBuf, engine: Engine) -> ExportRequest {
        ExportRequest {
            engine,
            endpoint: Endpoint {
                address: "clone.local".into(),
                port: 3306,
            },
            username: "admin".into(),
            password: MasterCredential::derive("secret", "abc"),
            db_name: Some("orders".into()),
            destination,
        }
    }

    #[test]
    fn engine_detection() {
        assert_eq!(Engine::from_engine_name("postgres"), Engine::Postgres);
        assert_eq!(Engine::from_engine_name("aurora-postgresql"), Engine::Postgres);
        assert_eq!(Engine::from_engine_name("mysql"), Engine::MySql);
        assert_eq!(Engine::from_engine_name("mariadb"), Engine::MySql);
    }

    #[test]
    fn password_is_not_on_the_command_line() {
        let exporter = DumpToolExporter::new(None);
        let req = request(PathBuf::from("/tmp/x.sql.gz"), Engine::MySql);
        let (tool, cmd) = exporter.command(&req);
        assert_eq!(tool, "mysqldump");
        let args: Vec<String> = cmd
            .as_std()
            .get_args()
            .map(|a| a.to_string_lossy().into_owned())
            .collect();
        assert!(args.iter().all(|a| !a.contains(req.password.expose())));
        assert_eq!(args.last().map(String::as_str), Some("orders"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn streams_tool_output_through_gzip() {
        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("nested/out.sql.gz");
        // `echo` ignores the dump flags and prints them, which is enough output to check
        let exporter = DumpToolExporter::new(Some("echo".into()));

        let exported = exporter
            .export(&request(dest.clone(), Engine::Postgres))
            .await
            .unwrap();

        assert_eq!(exported.path, dest);
        assert!(exported.size > 0);
        let mut text = String::new();
        GzDecoder::new(std::fs::File::open(&dest).unwrap())
            .read_to_string(&mut text)
            .unwrap();
        assert!(text.contains("clone.local"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn failing_tool_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let exporter = DumpToolExporter::new(Some("false".into()));

        let err = exporter
            .export(&request(dir.path().join("out.sql.gz"), Engine::MySql))
            .await
            .unwrap_err();

        assert!(matches!(err, ExportError::ToolFailed { ref code, .. } if code == "1"));
    }
}
