//! Terminal progress display.

use indicatif::{ProgressBar, ProgressStyle};
use std::time::Duration;

/// Spinner for slow single steps such as RSA key generation.
#[must_use]
pub fn spinner(message: &str) -> ProgressBar {
    let bar = ProgressBar::new_spinner();
    let style = ProgressStyle::default_spinner()
        .template("{spinner:.green} {msg} [{elapsed}]")
        .unwrap_or_else(|_| ProgressStyle::default_spinner());
    bar.set_style(style);
    bar.set_message(message.to_string());
    bar.enable_steady_tick(Duration::from_millis(100));
    bar
}

/// Bar counting delivered messages.
#[must_use]
pub fn message_bar(total: u64) -> ProgressBar {
    let bar = ProgressBar::new(total);
    let style = ProgressStyle::default_bar()
        .template("{spinner:.green} [{elapsed_precise}] [{wide_bar:.cyan/blue}] {pos}/{len} messages")
        .unwrap_or_else(|_| ProgressStyle::default_bar())
        .progress_chars("#>-");
    bar.set_style(style);
    bar
}

/// Abbreviate a long address id for display.
#[must_use]
pub fn short_id(id: &str) -> String {
    const KEEP: usize = 12;
    if id.len() <= 2 * KEEP + 3 {
        return id.to_string();
    }
    format!("{}...{}", &id[..KEEP], &id[id.len() - KEEP..])
}

/// Format a duration for humans.
#[must_use]
pub fn format_elapsed(duration: Duration) -> String {
    let millis = duration.as_millis();
    if millis < 1_000 {
        format!("{millis} ms")
    } else {
        format!("{:.2} s", duration.as_secs_f64())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_short_id() {
        assert_eq!(short_id("-"), "-");
        let id = format!("A{}Z", "x".repeat(340));
        let short = short_id(&id);
        assert!(short.starts_with("Axxxxxxxxxxx..."));
        assert!(short.ends_with("xxxxxxxxxxxZ"));
        assert_eq!(short.len(), 27);
    }

    #[test]
    fn test_format_elapsed() {
        assert_eq!(format_elapsed(Duration::from_millis(0)), "0 ms");
        assert_eq!(format_elapsed(Duration::from_millis(250)), "250 ms");
        assert_eq!(format_elapsed(Duration::from_millis(1_500)), "1.50 s");
    }
}
