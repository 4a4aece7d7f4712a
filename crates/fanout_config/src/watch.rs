use std::path::{Path, PathBuf};
use std::sync::mpsc::channel;
use std::time::Duration;

use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use tracing::{debug, info, warn};

use crate::loader;
use crate::schema::FanoutConfig;

/// Watches `path` for writes and re-parses/re-validates the document on
/// every change, invoking `on_change` with the new configuration when it
/// passes validation. A parse or validation failure logs a warning and
/// keeps the prior configuration rather than propagating the error.
///
/// Runs the watch loop on a dedicated blocking OS thread (`notify`'s
/// callback is synchronous) and is intentionally fire-and-forget: the
/// caller retains the returned `RecommendedWatcher` only to keep it
/// alive; dropping it stops the watch.
pub fn watch_config<F>(path: impl AsRef<Path>, mut on_change: F) -> notify::Result<RecommendedWatcher>
where
    F: FnMut(FanoutConfig) + Send + 'static,
{
    let path: PathBuf = path.as_ref().to_path_buf();
    let (tx, rx) = channel::<notify::Result<Event>>();

    let mut watcher = RecommendedWatcher::new(
        move |res| {
            let _ = tx.send(res);
        },
        notify::Config::default().with_poll_interval(Duration::from_secs(1)),
    )?;

    // Watch the parent directory rather than the file itself: editors
    // commonly replace the file (write-then-rename) rather than
    // truncate-and-write, which would otherwise orphan a watch on the
    // old inode.
    let watch_dir = path.parent().unwrap_or_else(|| Path::new("."));
    watcher.watch(watch_dir, RecursiveMode::NonRecursive)?;

    let watched_path = path.clone();
    std::thread::spawn(move || {
        for res in rx {
            let event = match res {
                Ok(event) => event,
                Err(err) => {
                    warn!(target: "fanout::config", error = ?err, "config watcher error");
                    continue;
                }
            };

            if !matches!(
                event.kind,
                EventKind::Modify(_) | EventKind::Create(_)
            ) {
                continue;
            }
            if !event.paths.iter().any(|p| p == &watched_path) {
                continue;
            }

            debug!(target: "fanout::config", path = %watched_path.display(), "config file changed, reloading");
            match loader::load(watched_path.to_string_lossy().as_ref()) {
                Ok(new_cfg) => {
                    info!(target: "fanout::config", "configuration reloaded successfully");
                    on_change(new_cfg);
                }
                Err(err) => {
                    warn!(
                        target: "fanout::config",
                        error = %err,
                        "hot-reload produced an invalid configuration; keeping prior configuration"
                    );
                }
            }
        }
    });

    Ok(watcher)
}
