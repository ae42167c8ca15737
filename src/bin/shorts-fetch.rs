use std::path::PathBuf;

use anyhow::Context;
use clap::Parser;
use indicatif::{ProgressBar, ProgressStyle};
use shorts_relay::{
    client::{ClientError, RelayClient},
    progress::{DownloadSession, format_megabytes, format_speed},
};
use tokio_util::sync::CancellationToken;

/// Download a YouTube Short through a running relay server.
#[derive(Parser, Debug)]
#[command(name = "shorts-fetch")]
#[command(about = "Download a YouTube Short through a shorts-relay server", long_about = None)]
struct Cli {
    /// Short URL, e.g. https://youtube.com/shorts/<id>
    #[arg(value_name = "URL")]
    #[arg(value_hint = clap::ValueHint::Url)]
    url: String,

    /// "highest" or a target height such as 720
    #[arg(long, value_name = "QUALITY")]
    quality: Option<String>,

    /// Base address of the relay server
    #[arg(long, value_name = "URL", default_value = "http://127.0.0.1:3000")]
    server: String,

    /// Directory the video is saved into
    #[arg(long, value_name = "DIR", default_value = ".")]
    #[arg(value_hint = clap::ValueHint::DirPath)]
    output: PathBuf,
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "shorts_relay=warn".to_string()),
        )
        .with_writer(std::io::stderr)
        .init();

    if let Err(error) = run(Cli::parse()).await {
        eprintln!("Error: {error:#}");
        std::process::exit(1);
    }
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let client = RelayClient::new(&cli.server)?;
    let cancel = CancellationToken::new();

    let ctrl_c = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            ctrl_c.cancel();
        }
    });

    let bar = ProgressBar::new(100);
    bar.set_style(
        ProgressStyle::with_template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}% {msg}")
            .context("progress template")?
            .progress_chars("#>-"),
    );
    bar.set_message("Preparing download...");

    let mut session = DownloadSession::new();
    let result = client
        .download(
            &cli.url,
            cli.quality.as_deref(),
            &mut session,
            &cancel,
            |sample| {
                bar.set_position(sample.percent.floor() as u64);
                bar.set_message(format!(
                    "{} ({})",
                    format_megabytes(sample.downloaded_bytes),
                    format_speed(sample.speed_kbps)
                ));
            },
        )
        .await;
    bar.finish_and_clear();

    let downloaded = match result {
        Ok(downloaded) => downloaded,
        Err(ClientError::Cancelled { downloaded_bytes }) => {
            eprintln!(
                "Download cancelled after {}",
                format_megabytes(downloaded_bytes)
            );
            return Ok(());
        }
        Err(error) => return Err(error.into()),
    };

    tokio::fs::create_dir_all(&cli.output)
        .await
        .with_context(|| format!("could not create {}", cli.output.display()))?;
    let path = cli.output.join(&downloaded.filename);
    tokio::fs::write(&path, &downloaded.completed.data)
        .await
        .with_context(|| format!("could not write {}", path.display()))?;

    println!(
        "Saved {} ({} in {:.1}s, avg {})",
        path.display(),
        format_megabytes(downloaded.completed.size),
        downloaded.completed.elapsed.as_secs_f64(),
        format_speed(downloaded.completed.average_kbps)
    );

    Ok(())
}
