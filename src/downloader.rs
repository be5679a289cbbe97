// src/downloader.rs

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use futures_util::StreamExt;
use reqwest::{Client, StatusCode};
use tokio::fs::{File, OpenOptions};
use tokio::io::AsyncWriteExt;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::models::Request;
use crate::resolver::{ResolveError, Resolver, TransferEvent, TransferHandle, TransferSender};

const USER_AGENT: &str = concat!("taskdl/", env!("CARGO_PKG_VERSION"));

/// Numbered alternatives tried before giving up on a crowded name.
const MAX_NAME_ATTEMPTS: usize = 1000;

/// Resolves requests whose source is an HTTP(S) URL and streams the body to disk.
#[derive(Debug, Clone)]
pub struct HttpResolver {
    client: Client,
    output_dir: PathBuf,
}

impl HttpResolver {
    pub fn new(output_dir: impl Into<PathBuf>) -> Result<Self, ResolveError> {
        let client = Client::builder().user_agent(USER_AGENT).build()?;
        Ok(Self::with_client(client, output_dir))
    }

    pub fn with_client(client: Client, output_dir: impl Into<PathBuf>) -> Self {
        Self {
            client,
            output_dir: output_dir.into(),
        }
    }

    /// Where the finished file for `request` ends up, unless that name is
    /// taken. See [`claim_destination`].
    pub fn destination_for(&self, request: &Request) -> PathBuf {
        match &request.destination {
            Some(hint) => self.output_dir.join(hint),
            None => self.output_dir.join(sanitize_file_name(&request.title)),
        }
    }
}

/// The in-progress file for a destination, e.g. `song.mp3.part`.
pub fn temporary_path(destination: &Path) -> PathBuf {
    let mut name = destination.as_os_str().to_owned();
    name.push(".part");
    PathBuf::from(name)
}

/// `dir/song (2).mp3` for `dir/song.mp3` and `n = 2`.
fn numbered(destination: &Path, n: usize) -> PathBuf {
    let stem = destination
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();
    let name = match destination.extension() {
        Some(ext) => format!("{stem} ({n}).{}", ext.to_string_lossy()),
        None => format!("{stem} ({n})"),
    };
    destination.with_file_name(name)
}

/// Picks the first free name among `destination`, `name (1).ext`, ... and
/// creates its part file exclusively. A name is free when neither the
/// finished file nor another transfer's part file exists.
pub async fn claim_destination(destination: &Path) -> Result<(PathBuf, PathBuf, File), ResolveError> {
    for n in 0..MAX_NAME_ATTEMPTS {
        let candidate = if n == 0 {
            destination.to_path_buf()
        } else {
            numbered(destination, n)
        };
        if tokio::fs::try_exists(&candidate).await? {
            continue;
        }
        let part = temporary_path(&candidate);
        match OpenOptions::new().write(true).create_new(true).open(&part).await {
            Ok(file) => return Ok((candidate, part, file)),
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => continue,
            Err(e) => return Err(e.into()),
        }
    }
    Err(ResolveError::Other(format!(
        "no free file name for {}",
        destination.display()
    )))
}

fn sanitize_file_name(title: &str) -> String {
    let cleaned: String = title
        .chars()
        .map(|c| match c {
            '/' | '\\' | ':' | '*' | '?' | '"' | '<' | '>' | '|' => '_',
            c if c.is_control() => '_',
            c => c,
        })
        .collect();
    let cleaned = cleaned.trim().trim_matches('.');
    if cleaned.is_empty() {
        "download".to_string()
    } else {
        cleaned.to_string()
    }
}

#[async_trait]
impl Resolver for HttpResolver {
    async fn resolve(
        &self,
        request: &Request,
        events: TransferSender,
    ) -> Result<Box<dyn TransferHandle>, ResolveError> {
        let url = reqwest::Url::parse(&request.source)
            .map_err(|_| ResolveError::NotFound(request.source.clone()))?;
        let resp = self.client.get(url).send().await?;
        let status = resp.status();
        if status == StatusCode::NOT_FOUND || status == StatusCode::GONE {
            return Err(ResolveError::NotFound(request.source.clone()));
        }
        if !status.is_success() {
            return Err(ResolveError::Http {
                url: request.source.clone(),
                status: status.as_u16(),
            });
        }

        let preferred = self.destination_for(request);
        if let Some(parent) = preferred.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let (destination, part, file) = claim_destination(&preferred).await?;
        info!(url = %request.source, dest = %destination.display(), size = ?resp.content_length(), "transfer started");

        let (pause_tx, pause_rx) = watch::channel(false);
        let cancel = CancellationToken::new();
        let body = BodyTransfer {
            file,
            part,
            destination,
            paused: pause_rx,
            cancel: cancel.clone(),
            events,
        };
        tokio::spawn(body.run(resp));

        Ok(Box::new(HttpTransfer { paused: pause_tx, cancel }))
    }
}

/// Control side of an HTTP body transfer.
pub struct HttpTransfer {
    paused: watch::Sender<bool>,
    cancel: CancellationToken,
}

impl TransferHandle for HttpTransfer {
    fn pause(&self) {
        self.paused.send_replace(true);
    }

    fn resume(&self) {
        self.paused.send_replace(false);
    }

    fn destroy(&self) {
        self.cancel.cancel();
    }
}

impl Drop for HttpTransfer {
    // No effect once the body has finished.
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

struct BodyTransfer {
    file: File,
    part: PathBuf,
    destination: PathBuf,
    paused: watch::Receiver<bool>,
    cancel: CancellationToken,
    events: TransferSender,
}

impl BodyTransfer {
    async fn run(mut self, resp: reqwest::Response) {
        let events = self.events.clone();
        let part = self.part.clone();
        match self.copy_body(resp).await {
            Ok(true) => {
                let _ = events.send(TransferEvent::Complete);
            }
            Ok(false) => {
                debug!(part = %part.display(), "transfer destroyed, removing partial file");
                let _ = tokio::fs::remove_file(&part).await;
            }
            Err(e) => {
                let _ = tokio::fs::remove_file(&part).await;
                let _ = events.send(TransferEvent::Error(e));
            }
        }
    }

    /// Streams the body into the part file. Returns false if the transfer
    /// was destroyed before it finished.
    async fn copy_body(&mut self, resp: reqwest::Response) -> Result<bool, ResolveError> {
        let total = resp.content_length().filter(|t| *t > 0);
        let mut stream = resp.bytes_stream();
        let mut transferred = 0u64;
        let mut last_percent = 0u64;

        loop {
            if !self.wait_while_paused().await {
                return Ok(false);
            }
            let chunk = tokio::select! {
                chunk = stream.next() => chunk,
                _ = self.cancel.cancelled() => return Ok(false),
            };
            let Some(chunk) = chunk else { break };
            let bytes = chunk?;
            self.file.write_all(&bytes).await?;
            transferred += bytes.len() as u64;

            match total {
                Some(total) => {
                    let percent = transferred.min(total) * 100 / total;
                    if percent > last_percent {
                        last_percent = percent;
                        let _ = self.events.send(TransferEvent::Progress {
                            percent: percent as f64,
                            transferred,
                            total: Some(total),
                        });
                    }
                }
                None => {
                    let _ = self.events.send(TransferEvent::Progress {
                        percent: 0.0,
                        transferred,
                        total: None,
                    });
                }
            }
        }

        self.file.flush().await?;
        tokio::fs::rename(&self.part, &self.destination).await?;
        info!(dest = %self.destination.display(), bytes = transferred, "transfer complete");
        Ok(true)
    }

    /// Parks while the handle says paused. False if the transfer was
    /// destroyed or its handle dropped meanwhile.
    async fn wait_while_paused(&mut self) -> bool {
        loop {
            let paused = *self.paused.borrow();
            if !paused {
                return true;
            }
            tokio::select! {
                changed = self.paused.changed() => {
                    if changed.is_err() {
                        return false;
                    }
                }
                _ = self.cancel.cancelled() => return false,
            }
        }
    }
}
