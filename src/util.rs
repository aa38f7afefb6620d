//! Utility functions used by Stampede, and available when writing load tests.

use lazy_static::lazy_static;
use regex::Regex;
use std::str::FromStr;
use std::sync::RwLock;
use std::time;
use tokio_util::sync::CancellationToken;
use url::Url;

use crate::StampedeError;

lazy_static! {
    /// The run currently listening for ctrl-c, if any.
    static ref CTRLC_TOKEN: RwLock<Option<CancellationToken>> = RwLock::new(None);
}

/// Parse a string representing a time span and return a [`Duration`](std::time::Duration).
///
/// Can be specified as an integer, indicating seconds. Or can use integers
/// together with one or more of "h", "m", "s" and "ms", in that order, indicating
/// "hours", "minutes", "seconds" and "milliseconds".
///
/// Valid formats include: 20, 20s, 3m, 2h, 1h20m, 3h30m10s, 250ms, 1s500ms, etc.
///
/// Returns `None` if the string can't be parsed.
///
/// # Example
/// ```rust
/// use stampede::util;
/// use std::time::Duration;
///
/// // 1 hour 2 minutes and 3 seconds.
/// assert_eq!(util::parse_timespan("1h2m3s"), Some(Duration::from_secs(3_723)));
///
/// // A bare integer is seconds.
/// assert_eq!(util::parse_timespan("45"), Some(Duration::from_secs(45)));
///
/// // Sub-second think times.
/// assert_eq!(util::parse_timespan("250ms"), Some(Duration::from_millis(250)));
///
/// // Invalid value.
/// assert_eq!(util::parse_timespan("foo"), None);
/// ```
pub fn parse_timespan(time_str: &str) -> Option<time::Duration> {
    let time_str = time_str.trim();
    // If an integer is passed in, assume it's seconds
    if let Ok(t) = u64::from_str(time_str) {
        trace!("{} is integer: {} seconds", time_str, t);
        return Some(time::Duration::from_secs(t));
    }

    // Otherwise use a regex to extract hours, minutes, seconds and milliseconds.
    let re = Regex::new(
        r"^((?P<hours>\d+)h)?((?P<minutes>\d+)m)?((?P<seconds>\d+)s)?((?P<milliseconds>\d+)ms)?$",
    )
    .expect("failed to compile timespan regex");
    let time_matches = re.captures(time_str)?;
    let component = |name: &str| -> Option<u64> {
        match time_matches.name(name) {
            Some(m) => u64::from_str(m.as_str()).ok(),
            None => Some(0),
        }
    };
    let hours = component("hours")?;
    let minutes = component("minutes")?;
    let seconds = component("seconds")?;
    let milliseconds = component("milliseconds")?;
    // An empty string matches the regex but isn't a time span.
    if time_matches.iter().skip(1).all(|m| m.is_none()) {
        return None;
    }
    // A span too large to represent is as invalid as a malformed one.
    let secs = hours
        .checked_mul(60 * 60)?
        .checked_add(minutes.checked_mul(60)?)?
        .checked_add(seconds)?;
    let total = time::Duration::from_secs(secs).checked_add(time::Duration::from_millis(milliseconds))?;
    trace!(
        "{} hours {} minutes {} seconds {} milliseconds: {:?}",
        hours,
        minutes,
        seconds,
        milliseconds,
        total
    );
    Some(total)
}

/// Sleep for a specified duration, minus the time spent doing other things.
///
/// # Example
/// ```rust
/// use stampede::util;
///
/// async fn loop_with_delay() {
///     // Start drift timer.
///     let mut drift_timer = tokio::time::Instant::now();
///     loop {
///         // Do other stuff, which is the "drift" subtracted from the sleep later.
///         tokio::time::sleep(std::time::Duration::from_millis(25)).await;
///
///         // Sleep for 100 milliseconds minus the time spent doing other stuff.
///         drift_timer = util::sleep_minus_drift(
///             std::time::Duration::from_millis(100),
///             drift_timer,
///         ).await;
///         break;
///     }
/// }
/// ```
pub async fn sleep_minus_drift(
    duration: time::Duration,
    drift: tokio::time::Instant,
) -> tokio::time::Instant {
    match duration.checked_sub(drift.elapsed()) {
        Some(delay) if delay.as_nanos() > 0 => tokio::time::sleep(delay).await,
        _ => debug!("sleep_minus_drift: drift was greater than or equal to duration, not sleeping"),
    };
    tokio::time::Instant::now()
}

/// Truncate strings when they're too long to display.
///
/// If a string is longer than the specified max length, this function removes extra
/// the characters and replaces the last two with a double-period ellipsis.
///
/// # Example
/// ```rust
/// use stampede::util;
///
/// // All but 7 characters are truncated, with ".." appended.
/// assert_eq!(util::truncate_string("this is a long string", 9), "this is..");
///
/// // All characters are returned as the string is less than 15 characters long.
/// assert_eq!(util::truncate_string("shorter string", 15), "shorter string");
/// ```
pub fn truncate_string(str_to_truncate: &str, max_length: usize) -> String {
    if max_length >= 2 && str_to_truncate.char_indices().count() > max_length {
        match str_to_truncate.char_indices().nth(max_length - 2) {
            None => str_to_truncate.to_string(),
            Some((idx, _)) => format!("{}..", &str_to_truncate[..idx]),
        }
    } else {
        str_to_truncate.to_string()
    }
}

/// Convert a duration into fractional milliseconds for display.
///
/// # Example
/// ```rust
/// use stampede::util;
/// use std::time::Duration;
///
/// assert_eq!(util::as_millis_f64(Duration::from_micros(5_250)), 5.25);
/// ```
pub fn as_millis_f64(duration: time::Duration) -> f64 {
    duration.as_secs_f64() * 1_000.0
}

/// Helper function to determine if a host can be parsed.
///
/// # Example
/// ```rust
/// use stampede::util;
///
/// // Hostname is a valid URL.
/// assert_eq!(util::is_valid_host("http://localhost/").is_ok(), true);
///
/// // IP is a valid URL.
/// assert_eq!(util::is_valid_host("http://127.0.0.1:9999").is_ok(), true);
///
/// // Protocol is required
/// assert_eq!(util::is_valid_host("example.com/").is_ok(), false);
/// ```
pub fn is_valid_host(host: &str) -> Result<Url, StampedeError> {
    Url::parse(host).map_err(|parse_error| StampedeError::InvalidHost {
        host: host.to_string(),
        detail: "Invalid host.".to_string(),
        parse_error,
    })
}

/// Read the maximum-concurrency cap from the `MAX_REQUESTS` environment variable.
///
/// Values that don't parse as a positive integer are ignored with a warning.
pub fn max_users_from_env() -> Option<usize> {
    let value = std::env::var("MAX_REQUESTS").ok()?;
    match usize::from_str(value.trim()) {
        Ok(max) if max > 0 => Some(max),
        _ => {
            warn!("ignoring invalid MAX_REQUESTS value: {}", value);
            None
        }
    }
}

// Internal helper to configure the control-c handler. Cancel the run on the first
// ctrl-c. Exit abruptly on the second ctrl-c.
pub(crate) fn setup_ctrlc_handler(token: &CancellationToken) {
    match CTRLC_TOKEN.write() {
        Ok(mut current) => *current = Some(token.clone()),
        Err(e) => warn!("failed to register run with ctrl-c handler: {}", e),
    }

    if let Err(e) = ctrlc::set_handler(move || {
        let token = match CTRLC_TOKEN.read() {
            Ok(current) => current.clone(),
            Err(_) => None,
        };
        match token {
            // We've caught a ctrl-c, determine if it's the first time or an additional time.
            Some(token) if !token.is_cancelled() => {
                warn!("caught ctrl-c, stopping...");
                token.cancel();
            }
            _ => {
                warn!("caught another ctrl-c, exiting immediately...");
                std::process::exit(1);
            }
        }
    }) {
        // The handler is process-global, later runs only swap the token.
        info!("reusing ctrl-c handler: {}", e);
    }
}

// Internal helper to detach the finished run from the ctrl-c handler, so a later
// ctrl-c exits instead of canceling a run that is already over.
pub(crate) fn clear_ctrlc_handler() {
    match CTRLC_TOKEN.write() {
        Ok(mut current) => *current = None,
        Err(e) => warn!("failed to unregister run from ctrl-c handler: {}", e),
    }
}
