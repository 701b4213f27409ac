use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Error, bail};
use console::{Term, style};
use gallery_ripper::ripper::{
    EventBus, MemoryStore, Notification, NotificationSink, PostStatus, ReqwestTransport, RipperEngine,
    SqliteStore, Store, SubmitOutcome, Topic, default_registry, error_chain, init_logging, init_settings,
};
use tracing::{info, trace, warn};

use crate::tui::DownloadProgress;

/// The name of the cargo package.
const NAME: &str = env!("CARGO_PKG_NAME");

/// The version of the cargo package.
const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Directory holding `settings.toml` unless `--config` is given
const DEFAULT_CONFIG_DIR: &str = "./config";

const USAGE: &str = "usage: gallery_ripper [--config DIR] [--all-posts] <link>...";

/// Settled check interval for when no notification arrives
const SETTLE_CHECK_INTERVAL: Duration = Duration::from_secs(1);

/// Hands aggregated notifications to the console loop
struct ChannelSink {
    sender: flume::Sender<Notification>,
}

impl NotificationSink for ChannelSink {
    fn send(&self, notification: &Notification) {
        // the console loop only goes away at shutdown
        let _ = self.sender.send(notification.clone());
    }
}

/// Command line options
#[derive(Debug, Default, PartialEq)]
pub(crate) struct Options {
    pub(crate) config_dir: PathBuf,
    /// Add every post of a thread that would otherwise be queued
    pub(crate) all_posts: bool,
    pub(crate) links: Vec<String>,
}

impl Options {
    pub(crate) fn parse(args: impl IntoIterator<Item = String>) -> Result<Self, Error> {
        let mut options = Options {
            config_dir: PathBuf::from(DEFAULT_CONFIG_DIR),
            ..Default::default()
        };
        let mut args = args.into_iter();
        while let Some(arg) = args.next() {
            match arg.as_str() {
                "--config" => {
                    let dir = args.next().context("--config needs a directory")?;
                    options.config_dir = PathBuf::from(dir);
                }
                "--all-posts" => options.all_posts = true,
                flag if flag.starts_with("--") => bail!("unknown option {}\n{}", flag, USAGE),
                _ => options.links.push(arg),
            }
        }
        Ok(options)
    }
}

/// Drives the engine from the console: submit links, show progress, print a summary.
pub(crate) struct Program {
    options: Options,
}

impl Program {
    pub(crate) fn new(options: Options) -> Self {
        Self { options }
    }

    pub(crate) async fn run(self) -> Result<(), Error> {
        Term::stdout().set_title("gallery ripper");

        let event_bus = EventBus::new();
        let settings = init_settings(&self.options.config_dir, event_bus.clone())
            .with_context(|| format!("failed to load settings from {}", self.options.config_dir.display()))?;
        let current = settings.settings();
        let _log_guard = init_logging(&current.logging)?;
        info!("Starting {} {}", NAME, VERSION);
        trace!(config_dir = %self.options.config_dir.display(), "Settings loaded");

        let links = match self.options.links.is_empty() {
            true => read_links_from_terminal()?,
            false => self.options.links.clone(),
        };
        if links.is_empty() {
            println!("{}", USAGE);
            return Ok(());
        }

        let store = open_store(&current.storage.database_file)?;
        let transport = Arc::new(ReqwestTransport::new(&current.connection)?);
        let engine = Arc::new(RipperEngine::new(
            settings.clone(),
            store,
            transport,
            default_registry(),
            event_bus.clone(),
        ));
        let (sender, notifications) = flume::unbounded();
        engine.attach_sinks(vec![Arc::new(ChannelSink { sender })]);
        engine.start().await?;

        let tracked = self.submit(&engine, &links.join("\n")).await;
        if tracked.is_empty() {
            warn!("Nothing to download");
            engine.shutdown().await;
            return Ok(());
        }

        let progress = DownloadProgress::new(0);
        refresh(&engine, &tracked, &progress)?;
        let mut ticker = tokio::time::interval(SETTLE_CHECK_INTERVAL);
        loop {
            if all_settled(&engine, &tracked)? {
                break;
            }
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {
                    progress.println("Interrupted, stopping downloads...");
                    let outcome = engine.stop_all().await?;
                    for (post_id, e) in outcome.failed {
                        warn!(post_id, "Failed to stop post: {}", e);
                    }
                    break;
                }
                notification = notifications.recv_async() => match notification {
                    Ok(Notification { topic: Topic::Posts | Topic::PostsDeleted, .. }) => {
                        refresh(&engine, &tracked, &progress)?
                    }
                    Ok(Notification { topic: Topic::Speed, payload }) => {
                        progress.set_speed(payload.as_u64().unwrap_or_default())
                    }
                    Ok(_) => {}
                    Err(_) => break,
                },
                _ = ticker.tick() => refresh(&engine, &tracked, &progress)?,
            }
        }
        progress.finish();

        print_summary(&engine, &tracked)?;
        engine.shutdown().await;
        info!("Finished downloading posts!");
        Ok(())
    }

    /// Submit links and return the ids of the posts to follow
    async fn submit(&self, engine: &RipperEngine, text: &str) -> HashSet<String> {
        let mut tracked = HashSet::new();
        for (link, result) in engine.submit_links(text).await {
            match result {
                Ok(SubmitOutcome::Added(ids)) => tracked.extend(ids),
                Ok(SubmitOutcome::Queued(group)) if self.options.all_posts => {
                    match engine.grab(&group.thread_id).await {
                        Ok(items) => {
                            let posts: Vec<(String, String)> = items
                                .iter()
                                .map(|item| (item.thread_id.clone(), item.post_id.clone()))
                                .collect();
                            for (post_id, added) in engine.add_posts(&posts).await {
                                match added {
                                    Ok(_) => {
                                        tracked.insert(post_id);
                                    }
                                    Err(e) => warn!(post_id, "Skipped post: {}", e),
                                }
                            }
                            if let Err(e) = engine.remove_queued(&group.thread_id) {
                                warn!("Failed to drop queued thread {}: {}", group.thread_id, e);
                            }
                        }
                        Err(e) => eprintln!("{} {}: {}", style("failed").red(), link, error_chain(&e)),
                    }
                }
                Ok(SubmitOutcome::Queued(group)) => println!(
                    "{} {} has {} posts; rerun with --all-posts to add them all",
                    style("queued").yellow(),
                    link,
                    group.total
                ),
                Err(e) => eprintln!("{} {}: {}", style("failed").red(), link, error_chain(&e)),
            }
        }

        // Posts added while auto start is off still get downloaded from the console
        for post_id in &tracked {
            let stopped = matches!(engine.post(post_id), Ok(Some(post)) if post.status == PostStatus::Stopped);
            if !stopped {
                continue;
            }
            if let Err(e) = engine.restart(post_id).await {
                warn!(post_id, "Failed to start post: {}", e);
            }
        }
        tracked
    }
}

fn read_links_from_terminal() -> Result<Vec<String>, Error> {
    let term = Term::stdout();
    if !term.is_term() {
        return Ok(Vec::new());
    }
    println!("Paste gallery links, one per line; finish with an empty line:");
    let mut links = Vec::new();
    loop {
        let line = term.read_line()?;
        let line = line.trim();
        if line.is_empty() {
            break;
        }
        links.push(line.to_string());
    }
    Ok(links)
}

fn open_store(database_file: &str) -> Result<Arc<dyn Store>, Error> {
    if database_file.is_empty() {
        info!("Using in-memory store");
        return Ok(Arc::new(MemoryStore::new()));
    }
    let path = Path::new(database_file);
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)?;
    }
    let store = SqliteStore::open(path).with_context(|| format!("failed to open database {}", database_file))?;
    info!(path = database_file, "Opened database");
    Ok(Arc::new(store))
}

fn refresh(engine: &RipperEngine, tracked: &HashSet<String>, progress: &DownloadProgress) -> Result<(), Error> {
    let (mut done, mut total) = (0u64, 0u64);
    for post_id in tracked {
        if let Some(post) = engine.post(post_id)? {
            done += u64::from(post.done);
            total += u64::from(post.total);
        }
    }
    progress.set_counts(done, total);
    Ok(())
}

/// A tracked post is settled once it is terminal with no jobs left, or gone
fn all_settled(engine: &RipperEngine, tracked: &HashSet<String>) -> Result<bool, Error> {
    for post_id in tracked {
        if engine.is_pending(post_id) {
            return Ok(false);
        }
        if let Some(post) = engine.post(post_id)? {
            if !post.status.is_terminal() {
                return Ok(false);
            }
        }
    }
    Ok(true)
}

fn print_summary(engine: &RipperEngine, tracked: &HashSet<String>) -> Result<(), Error> {
    let mut ids: Vec<&String> = tracked.iter().collect();
    ids.sort();
    for post_id in ids {
        match engine.post(post_id)? {
            Some(post) => {
                let status = match post.status {
                    PostStatus::Complete => style(post.status.as_str()).green(),
                    PostStatus::Error => style(post.status.as_str()).red(),
                    _ => style(post.status.as_str()).yellow(),
                };
                println!("{:>8} {} ({}/{})", status, post.title, post.done, post.total);
                if let Some(dir) = post.download_directory {
                    println!("         {}", style(dir).dim());
                }
            }
            None => println!("{:>8} post {}", style("CLEARED").green(), post_id),
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_parse_links_and_flags() {
        let options = Options::parse(args(&["--config", "/tmp/conf", "a", "--all-posts", "b"])).unwrap();
        assert_eq!(options.config_dir, PathBuf::from("/tmp/conf"));
        assert!(options.all_posts);
        assert_eq!(options.links, args(&["a", "b"]));
    }

    #[test]
    fn test_parse_defaults() {
        let options = Options::parse(Vec::new()).unwrap();
        assert_eq!(options.config_dir, PathBuf::from(DEFAULT_CONFIG_DIR));
        assert!(!options.all_posts);
        assert!(options.links.is_empty());
    }

    #[test]
    fn test_parse_rejects_unknown_flag_and_missing_value() {
        assert!(Options::parse(args(&["--verbose"])).is_err());
        assert!(Options::parse(args(&["--config"])).is_err());
    }

    #[test]
    fn test_open_store_creates_parent_directory() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("data").join("ripper.sqlite");
        open_store(&file.to_string_lossy()).unwrap();
        assert!(file.parent().unwrap().exists());
    }

    #[test]
    fn test_channel_sink_forwards_notifications() {
        let (sender, receiver) = flume::unbounded();
        let sink = ChannelSink { sender };
        let notification = Notification {
            topic: Topic::Speed,
            payload: serde_json::json!(2048),
        };
        sink.send(&notification);
        assert_eq!(receiver.try_recv().unwrap(), notification);
    }
}
