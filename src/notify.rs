//! Desktop notifications for finished autonomous work
//!
//! The operator was away while the daemon worked; a native notification on
//! return beats digging through the log. Failures here are never allowed to
//! affect the daemon.

use notify_rust::Notification;
use tracing::debug;

/// Announce a finished (or failed) task
pub fn task_finished(title: &str, success: bool) {
    let summary = if success {
        "Task ready for review"
    } else {
        "Task failed"
    };

    let result = Notification::new()
        .summary(summary)
        .body(title)
        .appname("wise-magpie")
        .timeout(10_000)
        .show();

    if let Err(e) = result {
        debug!("Desktop notification failed: {e}");
    }
}
