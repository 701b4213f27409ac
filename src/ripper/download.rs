//! Execution of one image download job
//!
//! A job resolves its image through the host registry, streams the file
//! into the temp directory and moves it into the post's folder. The whole
//! resolve and transfer sequence runs inside the retry policy; the job's
//! cancellation token is checked before every request and between chunks.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use parking_lot::Mutex;
use tokio::fs::{self, File};
use tokio::io::AsyncWriteExt;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use crate::ripper::config_loader::{Settings, SettingsManager};
use crate::ripper::data_service::DataService;
use crate::ripper::error::{RipperError, RipperResult};
use crate::ripper::hosts::{HostRegistry, ResolveContext};
use crate::ripper::job_queue::Job;
use crate::ripper::models::{Image, ImageStatus, Post};
use crate::ripper::monitor::ThroughputMeter;
use crate::ripper::retry::RetryPolicy;
use crate::ripper::transport::{ByteStream, Transport};

/// How a job ended
#[derive(Debug)]
pub enum JobOutcome {
    Completed { image: Image, bytes: u64, path: PathBuf },
    Failed { image: Option<Image>, error: RipperError },
    Cancelled { image_id: i64 },
}

pub struct Downloader {
    data: Arc<DataService>,
    transport: Arc<dyn Transport>,
    hosts: Arc<HostRegistry>,
    settings: Arc<SettingsManager>,
    meter: Arc<ThroughputMeter>,
    placement: Mutex<()>,
}

impl Downloader {
    pub fn new(
        data: Arc<DataService>,
        transport: Arc<dyn Transport>,
        hosts: Arc<HostRegistry>,
        settings: Arc<SettingsManager>,
        meter: Arc<ThroughputMeter>,
    ) -> Self {
        Self {
            data,
            transport,
            hosts,
            settings,
            meter,
            placement: Mutex::new(()),
        }
    }

    /// Run a job to completion, failure or cancellation
    #[instrument(skip(self, job), fields(post_id = %job.post_id, image_id = job.image_id))]
    pub async fn run(&self, job: &Job) -> JobOutcome {
        let image = match self.data.find_image(job.image_id) {
            Ok(Some(image)) => image,
            Ok(None) => {
                return JobOutcome::Failed {
                    image: None,
                    error: RipperError::Validation(format!("unknown image {}", job.image_id)),
                };
            }
            Err(error) => return JobOutcome::Failed { image: None, error },
        };

        match self.execute(&image, &job.cancel).await {
            Ok((bytes, path)) => JobOutcome::Completed { image, bytes, path },
            Err(_) if job.cancel.is_cancelled() => JobOutcome::Cancelled { image_id: image.id },
            Err(error) => JobOutcome::Failed {
                image: Some(image),
                error,
            },
        }
    }

    async fn execute(&self, image: &Image, cancel: &CancellationToken) -> RipperResult<(u64, PathBuf)> {
        let post = self
            .data
            .find_post(&image.post_id)?
            .ok_or_else(|| RipperError::Validation(format!("unknown post {}", image.post_id)))?;
        let settings = self.settings.settings();
        let post_dir = self.post_directory(&post, &settings)?;

        self.data.update_image_status(image.id, ImageStatus::Downloading)?;
        let policy = RetryPolicy::from_settings(&settings.connection);
        policy
            .run(cancel, "image download", || {
                self.attempt(image, &post_dir, &settings, cancel)
            })
            .await
    }

    /// Folder of a post, assigned on its first job
    fn post_directory(&self, post: &Post, settings: &Settings) -> RipperResult<PathBuf> {
        let _placement = self.placement.lock();
        if let Some(dir) = self.data.find_post(&post.post_id)?.and_then(|p| p.download_directory) {
            return Ok(PathBuf::from(dir));
        }

        let base = Path::new(&settings.download.download_directory);
        let mut folder = sanitize_file_name(&post.title);
        if folder.is_empty() {
            folder = post.post_id.clone();
        }
        let mut dir = base.join(&folder);
        let taken = self.data.posts()?.into_iter().any(|other| {
            other.post_id != post.post_id
                && other.download_directory.as_deref().map(Path::new) == Some(dir.as_path())
        });
        if taken {
            dir = base.join(format!("{}_{}", folder, post.post_id));
        }

        let dir_text = dir.to_string_lossy().to_string();
        self.data.update_download_directory(&post.post_id, &dir_text)?;
        debug!(post_id = %post.post_id, dir = %dir_text, "Assigned download directory");
        Ok(dir)
    }

    /// Move a post's folder to `name` next to where it lives now
    ///
    /// The folder is created lazily, so a post that has not downloaded
    /// anything yet only has its recorded directory changed.
    pub fn rename_directory(&self, post: &Post, name: &str) -> RipperResult<PathBuf> {
        let folder = sanitize_file_name(name);
        if folder.is_empty() {
            return Err(RipperError::Validation(format!("'{}' is not a usable folder name", name)));
        }

        let _placement = self.placement.lock();
        let current = post.download_directory.as_deref().map(PathBuf::from);
        let parent = match current.as_deref().and_then(Path::parent) {
            Some(parent) => parent.to_path_buf(),
            None => PathBuf::from(&self.settings.settings().download.download_directory),
        };
        let target = parent.join(&folder);
        if current.as_deref() == Some(target.as_path()) {
            return Ok(target);
        }
        let taken = self.data.posts()?.into_iter().any(|other| {
            other.post_id != post.post_id
                && other.download_directory.as_deref().map(Path::new) == Some(target.as_path())
        });
        if taken || target.exists() {
            return Err(RipperError::Validation(format!("{} is already in use", target.display())));
        }

        if let Some(current) = current.filter(|dir| dir.exists()) {
            std::fs::rename(&current, &target)?;
            info!(post_id = %post.post_id, from = %current.display(), to = %target.display(), "Moved post folder");
        }
        self.data.update_download_directory(&post.post_id, &target.to_string_lossy())?;
        Ok(target)
    }

    async fn attempt(
        &self,
        image: &Image,
        post_dir: &Path,
        settings: &Settings,
        cancel: &CancellationToken,
    ) -> RipperResult<(u64, PathBuf)> {
        let ctx = ResolveContext {
            transport: self.transport.as_ref(),
        };
        let resolved = self.hosts.resolve(image, &ctx).await?;
        if cancel.is_cancelled() {
            return Err(RipperError::Cancelled);
        }

        let headers = vec![("Referer".to_string(), image.url.clone())];
        let response = self.transport.get_stream(&resolved.url, &headers).await?;
        let extension = file_extension(response.content_type.as_deref(), &resolved.name)?;

        let temp_dir = Path::new(&settings.download.temp_directory);
        fs::create_dir_all(temp_dir).await?;
        let mut part = PartFile::new(temp_dir.join(format!("{}.part", Uuid::new_v4())));
        let interval = Duration::from_millis(settings.connection.progress_interval_ms);
        let bytes = self
            .stream_to_file(image.id, response, &part.path, interval, cancel)
            .await?;

        let stem = sanitize_file_name(&resolved.name);
        let mut file_name = format!("{}.{}", strip_image_extension(&stem), extension);
        if settings.download.force_order {
            file_name = format!("{:03}_{}", image.index, file_name);
        }
        fs::create_dir_all(post_dir).await?;
        let destination = post_dir.join(file_name);
        move_file(&part.path, &destination).await?;
        part.keep();
        info!("Downloaded {} to {}", resolved.url, destination.display());
        Ok((bytes, destination))
    }

    async fn stream_to_file(
        &self,
        image_id: i64,
        response: ByteStream,
        path: &Path,
        interval: Duration,
        cancel: &CancellationToken,
    ) -> RipperResult<u64> {
        let total = response.content_length.unwrap_or(0);
        self.data.update_image_progress(image_id, 0, total)?;

        let mut file = File::create(path).await?;
        let mut body = response.body;
        let mut written = 0u64;
        let mut last_persist: Option<Instant> = None;

        loop {
            let next = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(RipperError::Cancelled),
                next = body.next() => next,
            };
            let Some(chunk) = next else { break };
            let chunk = chunk?;
            file.write_all(&chunk).await?;
            written += chunk.len() as u64;
            self.meter.record(chunk.len() as u64);

            if last_persist.is_none_or(|at| at.elapsed() >= interval) {
                self.data.update_image_progress(image_id, written, total.max(written))?;
                last_persist = Some(Instant::now());
            }
        }
        file.flush().await?;
        Ok(written)
    }
}

/// Temp file deleted on drop unless kept
struct PartFile {
    path: PathBuf,
    kept: bool,
}

impl PartFile {
    fn new(path: PathBuf) -> Self {
        Self { path, kept: false }
    }

    fn keep(&mut self) {
        self.kept = true;
    }
}

impl Drop for PartFile {
    fn drop(&mut self) {
        if self.kept {
            return;
        }
        match std::fs::remove_file(&self.path) {
            Ok(()) => debug!("Discarded partial file {}", self.path.display()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => warn!("Failed to remove partial file {}: {}", self.path.display(), e),
        }
    }
}

async fn move_file(from: &Path, to: &Path) -> RipperResult<()> {
    if fs::rename(from, to).await.is_ok() {
        return Ok(());
    }
    // rename fails across filesystems
    fs::copy(from, to).await?;
    if let Err(e) = fs::remove_file(from).await {
        warn!("Failed to remove temp file {}: {}", from.display(), e);
    }
    Ok(())
}

const IMAGE_EXTENSIONS: [&str; 6] = ["bmp", "gif", "jpg", "jpeg", "png", "webp"];

/// Pick the file extension from the content type, falling back to the name
pub fn file_extension(content_type: Option<&str>, name: &str) -> RipperResult<String> {
    let mime = content_type
        .and_then(|ct| ct.split(';').next())
        .map(|ct| ct.trim().to_ascii_lowercase());

    let from_mime = match mime.as_deref() {
        Some("image/bmp") => Some("bmp"),
        Some("image/gif") => Some("gif"),
        Some("image/jpeg") | Some("image/jpg") | Some("image/pjpeg") => Some("jpg"),
        Some("image/png") => Some("png"),
        Some("image/webp") => Some("webp"),
        Some(other) if !other.starts_with("image/") && other != "application/octet-stream" => {
            return Err(RipperError::Extraction(format!("unexpected content type {}", other)));
        }
        _ => None,
    };
    if let Some(ext) = from_mime {
        return Ok(ext.to_string());
    }

    name.rsplit_once('.')
        .map(|(_, ext)| ext.to_ascii_lowercase())
        .filter(|ext| IMAGE_EXTENSIONS.contains(&ext.as_str()))
        .ok_or_else(|| RipperError::Extraction(format!("cannot determine file type of {}", name)))
}

fn strip_image_extension(name: &str) -> &str {
    match name.rsplit_once('.') {
        Some((stem, ext))
            if !stem.is_empty() && IMAGE_EXTENSIONS.contains(&ext.to_ascii_lowercase().as_str()) =>
        {
            stem
        }
        _ => name,
    }
}

/// Replace characters that are not allowed in file names
pub fn sanitize_file_name(name: &str) -> String {
    let cleaned: String = name
        .chars()
        .map(|c| match c {
            '/' | '\\' | ':' | '*' | '?' | '"' | '<' | '>' | '|' => '_',
            c if c.is_control() => '_',
            c => c,
        })
        .collect();
    cleaned.trim().trim_end_matches('.').trim().to_string()
}
