//! Reload of the policy and protected-topic files.
//!
//! A file watcher reloads as soon as either file changes on disk; the
//! interval task is the resync fallback for filesystems that deliver no
//! events. A reload that fails keeps the previous rules in force.

use crate::service::ServiceState;
use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

/// Quiet period that lets a burst of writes settle before reloading.
const WATCH_DEBOUNCE: Duration = Duration::from_millis(100);

/// Spawn the reload task; it ticks every `interval`.
pub fn spawn_reload_task(state: Arc<ServiceState>, interval: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // first tick completes at once; files were just opened
        ticker.tick().await;
        loop {
            ticker.tick().await;
            reload_once(&state);
        }
    })
}

/// Directory to watch and the canonical path events will name for `path`.
///
/// Watching the directory survives editors and our own writes replacing
/// the file by rename.
fn watch_target(path: &Path) -> std::io::Result<(PathBuf, PathBuf)> {
    let dir = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };
    let dir = dir.canonicalize()?;
    let file = dir.join(path.file_name().unwrap_or_default());
    Ok((dir, file))
}

/// Watch both files and reload whenever either changes.
///
/// The returned watcher stops delivering events when dropped.
pub fn spawn_file_watcher(
    state: Arc<ServiceState>,
) -> anyhow::Result<(RecommendedWatcher, JoinHandle<()>)> {
    let mut dirs = Vec::new();
    let mut files = Vec::new();
    for path in [state.store().path(), state.topics().path()] {
        let (dir, file) = watch_target(path)?;
        dirs.push(dir);
        files.push(file);
    }
    dirs.sort();
    dirs.dedup();

    // capacity 1: events arriving during a reload collapse into one more
    let (tx, mut rx) = mpsc::channel::<()>(1);
    let mut watcher = notify::recommended_watcher(move |res: notify::Result<Event>| match res {
        Ok(event) => {
            let relevant = matches!(
                event.kind,
                EventKind::Create(_) | EventKind::Modify(_) | EventKind::Remove(_)
            ) && event.paths.iter().any(|p| files.contains(p));
            if relevant {
                let _ = tx.try_send(());
            }
        }
        Err(e) => error!(error = %e, "file watcher error"),
    })?;
    for dir in &dirs {
        watcher.watch(dir, RecursiveMode::NonRecursive)?;
    }
    info!(?dirs, "watching policy files");

    let task = tokio::spawn(async move {
        while rx.recv().await.is_some() {
            tokio::time::sleep(WATCH_DEBOUNCE).await;
            while rx.try_recv().is_ok() {}
            debug!("policy file change observed");
            reload_once(&state);
        }
        debug!("file watcher stopped");
    });
    Ok((watcher, task))
}

/// Check both files once. Returns whether anything was installed.
pub fn reload_once(state: &ServiceState) -> bool {
    let policy = match state.store().reload() {
        Ok(changed) => changed,
        Err(e) => {
            error!(path = %state.store().path().display(), error = %e, "policy reload failed, previous policy kept");
            false
        }
    };
    let topics = state.topics().reload();
    if policy || topics {
        info!(policy, topics, "reloaded from disk");
    } else {
        debug!("no file changes");
    }
    policy || topics
}
