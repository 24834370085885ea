use blobpart::client::{ChunkUploader, FileSource, HttpMultipartClient, UploadOptions};
use blobpart::storage::CreateOptions;
use clap::Parser;
use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "blobpart", about = "Upload a file to a blobpart server in parts", version)]
struct Args {
  /// File to upload
  file: String,
  /// Destination pathname
  pathname: String,
  #[arg(long, env = "BLOBPART_ENDPOINT", default_value = "http://localhost:3900")]
  endpoint: String,
  #[arg(long, env = "BLOBPART_TOKEN")]
  token: Option<String>,
  /// Backend tag requested from the server
  #[arg(long)]
  backend: Option<String>,
  /// Part size in bytes
  #[arg(long, default_value_t = UploadOptions::default().part_size)]
  part_size: u64,
  #[arg(long, default_value_t = UploadOptions::default().concurrency)]
  concurrency: usize,
  /// Failed part attempts tolerated across the upload
  #[arg(long, default_value_t = UploadOptions::default().max_retry)]
  max_retry: u32,
  #[arg(long)]
  content_type: Option<String>,
  /// Custom metadata, repeatable
  #[arg(long = "meta", value_name = "KEY=VALUE", value_parser = parse_meta)]
  meta: Vec<(String, String)>,
  #[arg(long, default_value = "info")]
  log_level: String,
}

fn parse_meta(raw: &str) -> Result<(String, String), String> {
  match raw.split_once('=') {
    Some((key, value)) if !key.is_empty() => Ok((key.to_string(), value.to_string())),
    _ => Err(format!("expected KEY=VALUE, got '{}'", raw)),
  }
}

#[tokio::main]
async fn main() -> Result<(), anyhow::Error> {
  let args = Args::parse();

  tracing_subscriber::registry()
    .with(
      tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| args.log_level.clone().into()),
    )
    .with(tracing_subscriber::fmt::layer())
    .init();

  let mut client = HttpMultipartClient::new(&args.endpoint);
  if let Some(token) = args.token {
    client = client.with_token(token);
  }
  if let Some(backend) = args.backend {
    client = client.with_backend(backend);
  }

  let mut options = CreateOptions {
    content_type: args.content_type,
    ..Default::default()
  };
  for (key, value) in args.meta {
    options = options.with_metadata(key, value);
  }

  let source = FileSource::open(&args.file).await?;
  let uploader = ChunkUploader::new(
    Arc::new(client),
    UploadOptions {
      part_size: args.part_size,
      concurrency: args.concurrency,
      max_retry: args.max_retry,
    },
  );

  let object = uploader
    .upload(&source, &args.pathname, options, |progress| {
      tracing::info!("{:.1}%", progress * 100.0);
    })
    .await?;

  println!("{}", serde_json::to_string_pretty(&object)?);
  Ok(())
}
