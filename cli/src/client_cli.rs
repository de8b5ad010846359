use crate::arg_parser::{Cli, Command};
use anyhow::{bail, Context};
use futures::StreamExt;
use reqwest::multipart;
use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;
use tokio_util::io::ReaderStream;

pub async fn run(cli: Cli) -> anyhow::Result<()> {
    let client = reqwest::Client::new();
    match cli.command {
        Command::Sign {
            package,
            certificate,
            profile,
            entitlements,
            output,
        } => {
            sign(
                &client,
                &cli.server,
                package,
                certificate,
                profile,
                entitlements,
                output,
            )
            .await
        }
        Command::Status { job_id } => status(&client, &cli.server, &job_id).await,
        Command::Cancel { job_id } => cancel(&client, &cli.server, &job_id).await,
    }
}

async fn sign(
    client: &reqwest::Client,
    server: &str,
    package: PathBuf,
    certificate: PathBuf,
    profile: PathBuf,
    entitlements: Option<PathBuf>,
    output: PathBuf,
) -> anyhow::Result<()> {
    let mut form = multipart::Form::new()
        .part("package", file_part(&package).await?)
        .part("certificate", file_part(&certificate).await?)
        .part("profile", file_part(&profile).await?);
    if let Some(entitlements) = entitlements {
        form = form.part("entitlements", file_part(&entitlements).await?);
    }

    let response = client
        .post(format!("{}/jobs", server))
        .multipart(form)
        .send()
        .await
        .context("cannot reach server")?;
    let submitted: serde_json::Value = check(response).await?.json().await?;
    let job_id = submitted["job_id"]
        .as_str()
        .context("server response missing job_id")?
        .to_string();
    println!("job {} submitted", job_id);

    // the download endpoint waits server-side for the job to finish
    let response = client
        .get(format!("{}/jobs/{}/package", server, job_id))
        .send()
        .await
        .context("cannot reach server")?;
    let response = check(response).await?;

    let mut file = tokio::fs::File::create(&output)
        .await
        .with_context(|| format!("cannot create {}", output.display()))?;
    let mut stream = response.bytes_stream();
    let mut written = 0u64;
    while let Some(chunk) = stream.next().await {
        let chunk = chunk.context("download interrupted")?;
        written += chunk.len() as u64;
        file.write_all(&chunk).await?;
    }
    file.flush().await?;
    println!("wrote {} ({} bytes)", output.display(), written);
    Ok(())
}

async fn status(client: &reqwest::Client, server: &str, job_id: &str) -> anyhow::Result<()> {
    let response = client
        .get(format!("{}/jobs/{}", server, job_id))
        .send()
        .await
        .context("cannot reach server")?;
    let body: serde_json::Value = check(response).await?.json().await?;
    println!("{}", body);
    Ok(())
}

async fn cancel(client: &reqwest::Client, server: &str, job_id: &str) -> anyhow::Result<()> {
    let response = client
        .delete(format!("{}/jobs/{}", server, job_id))
        .send()
        .await
        .context("cannot reach server")?;
    check(response).await?;
    println!("job {} cancelled", job_id);
    Ok(())
}

async fn file_part(path: &Path) -> anyhow::Result<multipart::Part> {
    let file = tokio::fs::File::open(path)
        .await
        .with_context(|| format!("cannot open {}", path.display()))?;
    let name = path
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|| "file".to_string());
    let stream = ReaderStream::new(file);
    Ok(multipart::Part::stream(reqwest::Body::wrap_stream(stream)).file_name(name))
}

async fn check(response: reqwest::Response) -> anyhow::Result<reqwest::Response> {
    if response.status().is_success() {
        return Ok(response);
    }
    let status = response.status();
    let detail = response
        .json::<serde_json::Value>()
        .await
        .ok()
        .and_then(|body| body["detail"].as_str().map(str::to_string))
        .unwrap_or_else(|| "no detail".to_string());
    bail!("server returned {}: {}", status, detail);
}
