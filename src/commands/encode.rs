use anyhow::{Context, Result};
use spotwire::config::SpotwireConfig;
use spotwire::{Report, SpotRequest};
use tokio::io::{AsyncReadExt, AsyncWriteExt};

/// Dry run: render one report from stdin exactly as it would go on the wire
pub async fn handle_encode(config: SpotwireConfig) -> Result<()> {
    let mut input = String::new();
    tokio::io::stdin()
        .read_to_string(&mut input)
        .await
        .context("Failed to read report from stdin")?;

    let report: Report =
        serde_json::from_str(input.trim()).context("Failed to parse report JSON")?;
    let station = config.uploader.to_uploader_config().station_info();
    let request = SpotRequest::build(&report, &station)?;

    let mut stdout = tokio::io::stdout();
    stdout.write_all(request.as_bytes()).await?;
    stdout.write_all(b"\n").await?;
    stdout.flush().await?;
    Ok(())
}
