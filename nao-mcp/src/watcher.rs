use crate::error::Result;
use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use std::future::Future;
use std::path::Path;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Watches the parent directory of `path` and forwards Modify/Create events for
/// that file name. The watcher must be kept alive for events to flow.
pub(crate) fn watch_file(path: &Path) -> Result<(RecommendedWatcher, mpsc::Receiver<()>)> {
    let watch_dir = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
        _ => Path::new(".").to_path_buf(),
    };
    let file_name = path.file_name().map(|n| n.to_os_string()).unwrap_or_default();
    let (tx, rx) = mpsc::channel::<()>(16);

    let mut watcher = RecommendedWatcher::new(
        move |result: std::result::Result<Event, notify::Error>| match result {
            Ok(event) => {
                if !matches!(event.kind, EventKind::Modify(_) | EventKind::Create(_)) {
                    return;
                }
                let ours = event
                    .paths
                    .iter()
                    .any(|p| p.file_name().is_some_and(|n| n == file_name));
                if ours {
                    // A full channel already guarantees a pending reload.
                    let _ = tx.try_send(());
                }
            }
            Err(e) => tracing::error!(error = %e, "mcp config watcher error"),
        },
        notify::Config::default(),
    )?;
    watcher.watch(&watch_dir, RecursiveMode::NonRecursive)?;
    tracing::info!(path = %path.display(), "watching mcp config");
    Ok((watcher, rx))
}

/// Trailing-edge debounce: each event restarts the quiet window and
/// `on_quiet` runs once the window passes without events.
pub(crate) async fn debounce_loop<F, Fut>(
    mut events: mpsc::Receiver<()>,
    window: Duration,
    shutdown: CancellationToken,
    mut on_quiet: F,
) where
    F: FnMut() -> Fut,
    Fut: Future<Output = ()>,
{
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => return,
            msg = events.recv() => {
                if msg.is_none() {
                    return;
                }
            }
        }

        let quiet = tokio::time::sleep(window);
        tokio::pin!(quiet);
        let mut closed = false;
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => return,
                _ = &mut quiet => break,
                msg = events.recv() => match msg {
                    Some(()) => quiet.as_mut().reset(Instant::now() + window),
                    None => {
                        closed = true;
                        break;
                    }
                }
            }
        }

        on_quiet().await;
        if closed {
            return;
        }
    }
}
