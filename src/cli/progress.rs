//! Progress display module
//!
//! Renders `DownloadProgress` snapshots as a single refreshing terminal line.

use std::io::{self, Write};
use std::time::{Duration, Instant};

use tokio::sync::watch;

use crate::download::{DownloadProgress, DownloadSummary};

/// Format bytes to human readable string
pub fn format_bytes(bytes: u64) -> String {
    const UNITS: &[&str] = &["B", "KB", "MB", "GB", "TB"];
    let mut size = bytes as f64;
    let mut unit_index = 0;

    while size >= 1024.0 && unit_index < UNITS.len() - 1 {
        size /= 1024.0;
        unit_index += 1;
    }

    format!("{:.2} {}", size, UNITS[unit_index])
}

/// Format speed to human readable string
pub fn format_speed(bytes_per_sec: f64) -> String {
    format!("{}/s", format_bytes(bytes_per_sec as u64))
}

/// Format duration to human readable string
pub fn format_duration(duration: Duration) -> String {
    let total_secs = duration.as_secs();
    let hours = total_secs / 3600;
    let minutes = (total_secs % 3600) / 60;
    let seconds = total_secs % 60;

    if hours > 0 {
        format!("{}h {}m {}s", hours, minutes, seconds)
    } else if minutes > 0 {
        format!("{}m {}s", minutes, seconds)
    } else {
        format!("{}s", seconds)
    }
}

/// Calculate ETA based on download speed and remaining bytes
pub fn calculate_eta(downloaded: u64, total: u64, speed: f64) -> Option<Duration> {
    if speed <= 0.0 || downloaded >= total {
        return None;
    }

    let remaining = total.saturating_sub(downloaded) as f64;
    Some(Duration::from_secs_f64(remaining / speed))
}

/// Progress display for CLI
pub struct ProgressDisplay {
    /// Start time of the download
    start_time: Instant,
    /// Last update time
    last_update: Option<Instant>,
    /// Update interval
    update_interval: Duration,
    /// Quiet mode (no progress output)
    quiet: bool,
}

impl ProgressDisplay {
    /// Create a new progress display
    pub fn new(quiet: bool) -> Self {
        Self::with_interval(quiet, Duration::from_millis(500))
    }

    /// Create a progress display with custom update interval
    pub fn with_interval(quiet: bool, interval: Duration) -> Self {
        Self {
            start_time: Instant::now(),
            last_update: None,
            update_interval: interval,
            quiet,
        }
    }

    /// Redraw until the downloader drops its progress sender, then hand the display back
    pub async fn follow(mut self, mut progress: watch::Receiver<DownloadProgress>) -> Self {
        while progress.changed().await.is_ok() {
            let snapshot = *progress.borrow_and_update();
            if self.update(&snapshot).is_err() {
                break;
            }
        }
        self
    }

    /// Update the progress display, at most once per interval
    pub fn update(&mut self, progress: &DownloadProgress) -> io::Result<()> {
        if self.quiet {
            return Ok(());
        }

        // Final snapshot is always drawn
        let due = self.last_update.map_or(true, |t| t.elapsed() >= self.update_interval);
        if !due && !progress.is_complete() {
            return Ok(());
        }

        self.last_update = Some(Instant::now());
        print!("\r\x1b[2K{}", self.render(progress));
        io::stdout().flush()
    }

    /// Build the progress line
    pub fn render(&self, progress: &DownloadProgress) -> String {
        let fraction = progress.fraction().clamp(0.0, 1.0);

        let bar_width: usize = 40;
        let filled = (fraction * bar_width as f64) as usize;
        let bar: String = "=".repeat(filled) + &" ".repeat(bar_width.saturating_sub(filled));

        let elapsed = self.start_time.elapsed().as_secs_f64();
        let speed = if elapsed > 0.0 { progress.verified_bytes as f64 / elapsed } else { 0.0 };
        let eta = calculate_eta(progress.verified_bytes, progress.total_bytes, speed)
            .map(format_duration)
            .unwrap_or_else(|| "∞".to_string());

        format!(
            "[{}] {:.1}% | {} / {} | {}/{} pieces | ↓ {} | Peers: {} | ETA: {}",
            bar,
            fraction * 100.0,
            format_bytes(progress.verified_bytes),
            format_bytes(progress.total_bytes),
            progress.completed_pieces,
            progress.total_pieces,
            format_speed(speed),
            progress.connected_peers,
            eta,
        )
    }

    /// Print completion message
    pub fn print_complete(&self, summary: &DownloadSummary) -> io::Result<()> {
        if self.quiet {
            return Ok(());
        }

        // Clear the progress line
        print!("\r\x1b[2K");
        io::stdout().flush()?;

        println!("Download Complete!");
        println!("  Downloaded: {} in {} pieces", format_bytes(summary.bytes), summary.pieces);
        println!("  Peers used: {}", summary.peers_used);
        println!("  Elapsed Time: {}", format_duration(summary.elapsed));

        Ok(())
    }

    /// Get the elapsed time since start
    pub fn elapsed(&self) -> Duration {
        self.start_time.elapsed()
    }

    /// Check if quiet mode is enabled
    pub fn is_quiet(&self) -> bool {
        self.quiet
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_bytes() {
        assert_eq!(format_bytes(0), "0.00 B");
        assert_eq!(format_bytes(1024), "1.00 KB");
        assert_eq!(format_bytes(1024 * 1024), "1.00 MB");
        assert_eq!(format_bytes(1024 * 1024 * 1024), "1.00 GB");
    }

    #[test]
    fn test_format_speed() {
        assert_eq!(format_speed(1024.0), "1.00 KB/s");
    }

    #[test]
    fn test_format_duration() {
        assert_eq!(format_duration(Duration::from_secs(30)), "30s");
        assert_eq!(format_duration(Duration::from_secs(90)), "1m 30s");
        assert_eq!(format_duration(Duration::from_secs(3661)), "1h 1m 1s");
    }

    #[test]
    fn test_calculate_eta() {
        assert_eq!(calculate_eta(50, 100, 10.0), Some(Duration::from_secs(5)));
        assert_eq!(calculate_eta(100, 100, 10.0), None);
        assert_eq!(calculate_eta(50, 100, 0.0), None);
    }

    #[test]
    fn test_render_line() {
        let display = ProgressDisplay::new(true);
        let line = display.render(&DownloadProgress {
            completed_pieces: 2,
            total_pieces: 4,
            verified_bytes: 2048,
            total_bytes: 4096,
            connected_peers: 3,
            failed_verifications: 0,
        });

        assert!(line.contains("50.0%"));
        assert!(line.contains("2/4 pieces"));
        assert!(line.contains("2.00 KB / 4.00 KB"));
        assert!(line.contains("Peers: 3"));
        assert!(display.is_quiet());
    }

    #[tokio::test]
    async fn test_follow_ends_with_sender() {
        let (tx, rx) = watch::channel(DownloadProgress::default());
        let task = tokio::spawn(ProgressDisplay::new(true).follow(rx));
        tx.send_replace(DownloadProgress {
            completed_pieces: 1,
            total_pieces: 1,
            ..Default::default()
        });
        drop(tx);
        let display = task.await.unwrap();
        assert!(display.is_quiet());
    }
}
