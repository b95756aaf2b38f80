use anyhow::{Context, Result};
use blobfs::{
    BlobFileSystem, CreateOptions, ObjectPath,
    config::{AppConfig, ConfigArgs},
    store::sqlite::SqliteStore,
};
use clap::{Parser, Subcommand};
use futures::StreamExt;
use std::{path::PathBuf, sync::Arc};
use tokio::io::{AsyncRead, AsyncWriteExt};
use tokio_util::io::ReaderStream;
use tracing_subscriber::EnvFilter;

/// Hierarchical file operations over a flat object store.
#[derive(Parser, Debug)]
#[command(name = "blobfs", version)]
struct Cli {
    #[command(flatten)]
    config: ConfigArgs,

    #[command(subcommand)]
    command: Command,
}

/// Paths are `blobfs://bucket/key` or `bucket/key`.
#[derive(Subcommand, Debug)]
enum Command {
    /// Create a bucket
    Mb { bucket: String },
    /// Delete a bucket and everything in it
    Rb { bucket: String },
    /// Create a directory
    Mkdir { path: String },
    /// List the immediate children of a directory
    Ls { path: String },
    /// Upload a local file, or stdin when no file is given
    Put {
        path: String,
        file: Option<PathBuf>,
        /// Fail instead of replacing an existing object
        #[arg(long)]
        no_clobber: bool,
    },
    /// Print an object to stdout
    Cat { path: String },
    /// Delete a file or directory
    Rm {
        path: String,
        #[arg(short, long)]
        recursive: bool,
    },
    /// Move a file or directory
    Mv { src: String, dst: String },
    /// Show metadata of a file or directory
    Stat { path: String },
    /// Delete every bucket carrying the test bucket prefix
    Sweep,
}

#[tokio::main]
async fn main() -> Result<()> {
    // --- Logging setup ---
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let cfg = AppConfig::from_env_and_args(&cli.config)?;
    tracing::debug!("Starting blobfs with config: {:?}", cfg);

    // --- Initialize store + filesystem ---
    let store = SqliteStore::connect(&cfg.database_url, &cfg.storage_dir)
        .await
        .with_context(|| format!("opening store at {}", cfg.database_url))?;
    let fs = BlobFileSystem::new(Arc::new(store), cfg.fs_options());

    match cli.command {
        Command::Mb { bucket } => fs.create_bucket(&bucket).await?,
        Command::Rb { bucket } => fs.delete_bucket(&bucket).await?,
        Command::Mkdir { path } => fs.mkdir(&parse_path(&path)?).await?,
        Command::Ls { path } => {
            for entry in fs.list_file_info(&parse_path(&path)?).await? {
                if entry.is_directory {
                    println!("{:>12}  {}", "DIR", entry.path);
                } else {
                    println!("{:>12}  {}", entry.size, entry.path);
                }
            }
        }
        Command::Put {
            path,
            file,
            no_clobber,
        } => {
            let path = parse_path(&path)?;
            let options = if no_clobber {
                CreateOptions::create_new()
            } else {
                CreateOptions::overwrite()
            };
            let written = match file {
                Some(file) => {
                    let reader = tokio::fs::File::open(&file)
                        .await
                        .with_context(|| format!("opening {}", file.display()))?;
                    upload(&fs, &path, options, reader).await?
                }
                None => upload(&fs, &path, options, tokio::io::stdin()).await?,
            };
            tracing::info!("wrote {} bytes to {}", written, path);
        }
        Command::Cat { path } => {
            let mut reader = fs.open(&parse_path(&path)?).await?;
            let mut stdout = tokio::io::stdout();
            let mut buf = vec![0u8; cfg.read_buffer_size];
            loop {
                let n = reader.read(&mut buf).await?;
                if n == 0 {
                    break;
                }
                stdout.write_all(&buf[..n]).await?;
            }
            stdout.flush().await?;
        }
        Command::Rm { path, recursive } => fs.delete(&parse_path(&path)?, recursive).await?,
        Command::Mv { src, dst } => fs.rename(&parse_path(&src)?, &parse_path(&dst)?).await?,
        Command::Stat { path } => {
            let info = fs.stat(&parse_path(&path)?).await?;
            let kind = if info.is_directory { "directory" } else { "file" };
            println!("path:          {}", info.path);
            println!("type:          {}", kind);
            println!("size:          {}", info.size);
            match info.last_modified {
                Some(at) => println!("last modified: {}", at.to_rfc3339()),
                None => println!("last modified: -"),
            }
        }
        Command::Sweep => {
            let swept = cfg.test_buckets().cleanup(&fs).await?;
            println!("deleted {} test buckets", swept);
        }
    }

    Ok(())
}

fn parse_path(raw: &str) -> Result<ObjectPath> {
    ObjectPath::from_uri(raw, true).with_context(|| format!("bad path `{}`", raw))
}

/// Stream `reader` into a new object at `path`.
async fn upload<R>(fs: &BlobFileSystem, path: &ObjectPath, options: CreateOptions, reader: R) -> Result<u64>
where
    R: AsyncRead + Unpin,
{
    let mut writer = fs.create(path, options).await?;
    let mut chunks = ReaderStream::new(reader);
    while let Some(chunk) = chunks.next().await {
        writer.write(&chunk?);
    }
    Ok(writer.close().await?)
}
