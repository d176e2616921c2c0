//! Kubo (go-ipfs) content store backends
//!
//! `KuboCli` runs the `ipfs` binary directly with an explicit argument list
//! and captured output. `KuboHttp` talks to the Kubo RPC API.

use async_trait::async_trait;
use bytes::Bytes;
use serde::Deserialize;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::{debug, warn};

use crate::content_store::{ContentStore, Link, StoreError};

/// Default bound on a single store call
pub const DEFAULT_STORE_TIMEOUT: Duration = Duration::from_secs(120);

/// Map a Kubo error message onto the store error taxonomy
fn classify_failure(address: &str, message: &str) -> StoreError {
    let lower = message.to_ascii_lowercase();
    if lower.contains("invalid path") || lower.contains("invalid cid") || lower.contains("selected encoding not supported") {
        StoreError::InvalidAddress(format!("{}: {}", address, message.trim()))
    } else if lower.contains("not found") || lower.contains("no link named") {
        StoreError::NotFound(address.to_string())
    } else {
        StoreError::Unreachable(message.trim().to_string())
    }
}

/// Parse `ipfs ls -v` output: an optional `Hash Size Name` header, then one
/// link per line. Names may contain spaces.
pub fn parse_ls_output(output: &str) -> Vec<Link> {
    output
        .lines()
        .filter_map(|line| {
            let mut parts = line.trim().splitn(3, char::is_whitespace);
            let address = parts.next()?.trim();
            let size = parts.next()?.trim();
            let name = parts.next().unwrap_or("").trim();
            if address.is_empty() || address == "Hash" {
                return None;
            }
            Some(Link {
                address: address.to_string(),
                size: size.parse().unwrap_or(0),
                name: name.to_string(),
            })
        })
        .collect()
}

/// Kubo binary invoked as a child process
#[derive(Debug, Clone)]
pub struct KuboCli {
    binary: PathBuf,
    repo: Option<PathBuf>,
    timeout: Duration,
}

impl KuboCli {
    pub fn new(binary: impl Into<PathBuf>) -> Self {
        Self {
            binary: binary.into(),
            repo: None,
            timeout: DEFAULT_STORE_TIMEOUT,
        }
    }

    /// Use a specific Kubo repository (`IPFS_PATH`)
    pub fn with_repo(mut self, repo: impl Into<PathBuf>) -> Self {
        self.repo = Some(repo.into());
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    async fn run(&self, args: &[&str], address: &str, input: Option<Bytes>) -> Result<Vec<u8>, StoreError> {
        let timeout_flag = format!("--timeout={}s", self.timeout.as_secs().max(1));

        let mut command = Command::new(&self.binary);
        command
            .arg(&timeout_flag)
            .args(args)
            .stdin(if input.is_some() { Stdio::piped() } else { Stdio::null() })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(repo) = &self.repo {
            command.env("IPFS_PATH", repo);
        }

        let mut child = command.spawn().map_err(|e| {
            StoreError::Unreachable(format!("failed to launch {:?}: {}", self.binary, e))
        })?;

        let writer = match (input, child.stdin.take()) {
            (Some(data), Some(mut stdin)) => Some(tokio::spawn(async move {
                stdin.write_all(&data).await?;
                stdin.shutdown().await
            })),
            _ => None,
        };

        // Slack over Kubo's own --timeout so its error message wins the race
        let output = tokio::time::timeout(self.timeout + Duration::from_secs(5), child.wait_with_output())
            .await
            .map_err(|_| StoreError::Unreachable(format!("{} timed out for {}", args[0], address)))??;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            debug!(address, status = ?output.status, "Kubo {} failed: {}", args[0], stderr.trim());
            return Err(classify_failure(address, &stderr));
        }

        if let Some(writer) = writer {
            writer
                .await
                .map_err(|e| StoreError::Io(std::io::Error::other(e.to_string())))??;
        }

        Ok(output.stdout)
    }
}

#[async_trait]
impl ContentStore for KuboCli {
    async fn fetch(&self, address: &str) -> Result<Bytes, StoreError> {
        let data = self.run(&["cat", address], address, None).await?;
        Ok(Bytes::from(data))
    }

    async fn insert(&self, data: Bytes) -> Result<String, StoreError> {
        let stdout = self.run(&["add", "-Q", "--pin=true"], "<stdin>", Some(data)).await?;
        let address = String::from_utf8_lossy(&stdout)
            .lines()
            .last()
            .map(|l| l.trim().to_string())
            .unwrap_or_default();
        if address.is_empty() {
            return Err(StoreError::Protocol("add returned no address".to_string()));
        }
        Ok(address)
    }

    async fn list_links(&self, address: &str) -> Result<Vec<Link>, StoreError> {
        let stdout = self.run(&["ls", "-v", address], address, None).await?;
        Ok(parse_ls_output(&String::from_utf8_lossy(&stdout)))
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct RpcError {
    message: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct AddResponse {
    hash: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct LsResponse {
    #[serde(default)]
    objects: Vec<LsObject>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct LsObject {
    #[serde(default)]
    links: Vec<LsLink>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct LsLink {
    name: String,
    hash: String,
    #[serde(default)]
    size: u64,
}

/// Kubo RPC API client (`/api/v0/...`)
#[derive(Debug, Clone)]
pub struct KuboHttp {
    client: reqwest::Client,
    api_url: String,
}

impl KuboHttp {
    pub fn new(api_url: impl Into<String>, timeout: Duration) -> Result<Self, StoreError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| StoreError::Unreachable(e.to_string()))?;

        Ok(Self {
            client,
            api_url: api_url.into().trim_end_matches('/').to_string(),
        })
    }

    fn endpoint(&self, command: &str) -> String {
        format!("{}/api/v0/{}", self.api_url, command)
    }

    async fn check(address: &str, response: reqwest::Response) -> Result<reqwest::Response, StoreError> {
        if response.status().is_success() {
            return Ok(response);
        }

        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        let message = serde_json::from_str::<RpcError>(&body)
            .map(|e| e.message)
            .unwrap_or(body);
        warn!(address, %status, "Kubo RPC error: {}", message);

        if status.is_server_error() && !message.is_empty() {
            Err(classify_failure(address, &message))
        } else if status == reqwest::StatusCode::NOT_FOUND {
            Err(StoreError::Unreachable(format!("RPC endpoint missing: {}", status)))
        } else {
            Err(StoreError::Unreachable(format!("{}: {}", status, message)))
        }
    }
}

fn transport_error(e: reqwest::Error) -> StoreError {
    StoreError::Unreachable(e.to_string())
}

#[async_trait]
impl ContentStore for KuboHttp {
    async fn fetch(&self, address: &str) -> Result<Bytes, StoreError> {
        let response = self
            .client
            .post(self.endpoint("cat"))
            .query(&[("arg", address)])
            .send()
            .await
            .map_err(transport_error)?;

        Self::check(address, response)
            .await?
            .bytes()
            .await
            .map_err(transport_error)
    }

    async fn insert(&self, data: Bytes) -> Result<String, StoreError> {
        let part = reqwest::multipart::Part::stream(data).file_name("upload");
        let form = reqwest::multipart::Form::new().part("file", part);

        let response = self
            .client
            .post(self.endpoint("add"))
            .query(&[("pin", "true"), ("quieter", "true")])
            .multipart(form)
            .send()
            .await
            .map_err(transport_error)?;

        let added: AddResponse = Self::check("<upload>", response)
            .await?
            .json()
            .await
            .map_err(|e| StoreError::Protocol(e.to_string()))?;
        Ok(added.hash)
    }

    async fn list_links(&self, address: &str) -> Result<Vec<Link>, StoreError> {
        let response = self
            .client
            .post(self.endpoint("ls"))
            .query(&[("arg", address)])
            .send()
            .await
            .map_err(transport_error)?;

        let listing: LsResponse = Self::check(address, response)
            .await?
            .json()
            .await
            .map_err(|e| StoreError::Protocol(e.to_string()))?;

        Ok(listing
            .objects
            .into_iter()
            .flat_map(|o| o.links)
            .map(|l| Link {
                address: l.hash,
                size: l.size,
                name: l.name,
            })
            .collect())
    }
}
