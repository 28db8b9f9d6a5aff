//! Quiet-feed detection.
//!
//! A silently dropped connection produces no error frame. The consumer reads every frame
//! through a [`FeedWatchdog`], which reports [`Watched::Idle`] once nothing has arrived
//! for the configured period.

use futures::{Stream, StreamExt};
use std::time::Duration;
use tokio::time::Instant;

/// Result of one watched read.
#[derive(Debug, PartialEq)]
pub enum Watched<T> {
    Frame(T),
    /// Inner stream finished on its own.
    Ended,
    /// No frame for at least the idle period.
    Idle { quiet_for: Duration },
}

/// Tracks activity of one feed session.
///
/// The deadline is derived from the last frame rather than from the start of each read,
/// so a read cancelled by a sibling `select!` branch does not extend it.
#[derive(Debug)]
pub struct FeedWatchdog {
    idle: Duration,
    last_frame: Instant,
    frames: u64,
}

impl FeedWatchdog {
    pub fn new(idle: Duration) -> Self {
        Self {
            idle,
            last_frame: Instant::now(),
            frames: 0,
        }
    }

    /// Frames received since the session started.
    pub fn frames(&self) -> u64 {
        self.frames
    }

    pub async fn next<S>(&mut self, frames: &mut S) -> Watched<S::Item>
    where
        S: Stream + Unpin,
    {
        match tokio::time::timeout_at(self.last_frame + self.idle, frames.next()).await {
            Ok(Some(frame)) => {
                self.last_frame = Instant::now();
                self.frames += 1;
                Watched::Frame(frame)
            }
            Ok(None) => Watched::Ended,
            Err(_) => Watched::Idle {
                quiet_for: self.last_frame.elapsed(),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc;

    fn feed() -> (
        mpsc::UnboundedSender<&'static str>,
        impl Stream<Item = &'static str> + Unpin,
    ) {
        let (tx, rx) = mpsc::unbounded_channel();
        let frames = futures::stream::unfold(rx, |mut rx| async move {
            rx.recv().await.map(|frame| (frame, rx))
        });
        (tx, Box::pin(frames))
    }

    #[tokio::test(start_paused = true)]
    async fn test_quiet_feed_reported_idle() {
        let (tx, mut frames) = feed();
        let mut watchdog = FeedWatchdog::new(Duration::from_secs(120));

        tx.send("new_pairs").unwrap();
        assert_eq!(watchdog.next(&mut frames).await, Watched::Frame("new_pairs"));

        tokio::time::advance(Duration::from_secs(119)).await;
        tx.send("update_pulse_v2").unwrap();
        assert_eq!(watchdog.next(&mut frames).await, Watched::Frame("update_pulse_v2"));

        assert_eq!(
            watchdog.next(&mut frames).await,
            Watched::Idle {
                quiet_for: Duration::from_secs(120)
            }
        );
        assert_eq!(watchdog.frames(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancelled_reads_do_not_extend_deadline() {
        let (_tx, mut frames) = feed();
        let mut watchdog = FeedWatchdog::new(Duration::from_secs(10));

        for _ in 0..3 {
            let read = watchdog.next(&mut frames);
            assert!(tokio::time::timeout(Duration::from_secs(4), read).await.is_err());
        }

        // 12s have passed, beyond the 10s idle window
        let start = Instant::now();
        assert!(matches!(watchdog.next(&mut frames).await, Watched::Idle { .. }));
        assert_eq!(start.elapsed(), Duration::ZERO);
    }

    #[tokio::test]
    async fn test_finished_feed_reported_ended() {
        let mut frames = futures::stream::iter(["only"]);
        let mut watchdog = FeedWatchdog::new(Duration::from_secs(1));

        assert_eq!(watchdog.next(&mut frames).await, Watched::Frame("only"));
        assert_eq!(watchdog.next(&mut frames).await, Watched::Ended);
    }
}
