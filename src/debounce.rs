//! Debounce coalescer.
//!
//! Collapses a bursty stream into one value per quiet window. The watch
//! driver feeds raw filesystem events through this so that an editor writing
//! a file in several steps triggers a single rebuild.

use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::{Instant, sleep};

/// Debounce `input` under a quiet `window`.
///
/// A value is forwarded only once `window` has elapsed without another value
/// arriving; every arrival restarts the timer. Within a burst, `keep_last`
/// selects which value survives: the newest (`true`) or the first (`false`).
///
/// When `input` ends while a value is pending, that value is emitted right
/// away and the returned stream closes. The background task also stops as
/// soon as the returned receiver is dropped.
pub fn debounce<T>(mut input: mpsc::Receiver<T>, window: Duration, keep_last: bool) -> mpsc::Receiver<T>
where
    T: Send + 'static,
{
    let (tx, rx) = mpsc::channel(1);

    tokio::spawn(async move {
        loop {
            let mut pending = tokio::select! {
                next = input.recv() => match next {
                    Some(value) => value,
                    None => return,
                },
                () = tx.closed() => return,
            };

            let timer = sleep(window);
            tokio::pin!(timer);

            loop {
                tokio::select! {
                    next = input.recv() => match next {
                        Some(value) => {
                            if keep_last {
                                pending = value;
                            }
                            timer.as_mut().reset(Instant::now() + window);
                        }
                        None => {
                            let _ = tx.send(pending).await;
                            return;
                        }
                    },
                    () = &mut timer => {
                        if tx.send(pending).await.is_err() {
                            return;
                        }
                        break;
                    }
                }
            }
        }
    });

    rx
}
