//! Utility functions used by Flock, and available when writing load tests.

use lazy_static::lazy_static;
use regex::Regex;
use std::cmp::{max, min};
use std::collections::BTreeMap;
use std::str::FromStr;
use std::time::Duration;
use url::Url;

use crate::{FlockError, CANCELED};

lazy_static! {
    static ref TIMESPAN: Regex = Regex::new(
        r"^\s*((?P<hours>\d+)h)?((?P<minutes>\d+)m)?((?P<seconds>\d+)s)?((?P<millis>\d+)ms)?\s*$"
    )
    .expect("failed to compile timespan regex");
}

/// Parse a string representing a time span and return it as a [`Duration`].
///
/// Can be specified as an integer, indicating seconds. Or can use integers
/// together with one or more of "h", "m", "s" and "ms", in that order, indicating
/// "hours", "minutes", "seconds" and "milliseconds".
///
/// Valid formats include: 20, 20s, 3m, 2h, 1h20m, 3h30m10s, 250ms, 1s500ms, etc.
///
/// # Example
/// ```rust
/// use flock::util;
/// use std::time::Duration;
///
/// // 1 hour 2 minutes and 3 seconds is 3,723 seconds.
/// assert_eq!(util::parse_timespan("1h2m3s"), Some(Duration::from_secs(3_723)));
///
/// // 45 seconds is 45 seconds.
/// assert_eq!(util::parse_timespan("45"), Some(Duration::from_secs(45)));
///
/// // Invalid value can't be parsed.
/// assert_eq!(util::parse_timespan("foo"), None);
/// ```
pub fn parse_timespan(time_str: &str) -> Option<Duration> {
    match u64::from_str(time_str.trim()) {
        // If an integer is passed in, assume it's seconds
        Ok(t) => {
            trace!("{} is integer: {} seconds", time_str, t);
            Some(Duration::from_secs(t))
        }
        // Otherwise use a regex to extract hours, minutes, seconds and milliseconds.
        Err(_) => {
            let time_matches = TIMESPAN.captures(time_str)?;
            let mut matched = false;
            let mut component = |name: &str| -> u64 {
                match time_matches.name(name) {
                    Some(value) => {
                        matched = true;
                        u64::from_str(value.as_str()).unwrap_or(0)
                    }
                    None => 0,
                }
            };
            let hours = component("hours");
            let minutes = component("minutes");
            let seconds = component("seconds");
            let millis = component("millis");
            if !matched {
                return None;
            }
            let total = Duration::from_millis(
                (hours * 60 * 60 + minutes * 60 + seconds) * 1_000 + millis,
            );
            trace!(
                "{} hours {} minutes {} seconds {} milliseconds: {:?}",
                hours,
                minutes,
                seconds,
                millis,
                total
            );
            Some(total)
        }
    }
}

/// Sleep for a specified duration, minus the time spent doing other things.
///
/// Returns a fresh drift timer to use for the next call.
pub async fn sleep_minus_drift(
    duration: Duration,
    drift: tokio::time::Instant,
) -> tokio::time::Instant {
    match duration.checked_sub(drift.elapsed()) {
        Some(delay) if delay.as_nanos() > 0 => tokio::time::sleep(delay).await,
        _ => debug!("sleep_minus_drift: drift was greater than or equal to duration, not sleeping"),
    };
    tokio::time::Instant::now()
}

/// Determine if a timer started more than `run_time` ago.
///
/// A zero `run_time` never expires.
pub fn timer_expired(started: tokio::time::Instant, run_time: Duration) -> bool {
    !run_time.is_zero() && started.elapsed() >= run_time
}

/// Calculate the greatest common divisor of two integers using binary GCD (or Stein's) algorithm.
///
/// More detail on [Wikipedia](https://en.wikipedia.org/wiki/Binary_GCD_algorithm).
///
/// # Example
/// ```rust
/// use flock::util;
///
/// // 1 and any other integer are only divisible by 1.
/// assert_eq!(util::gcd(1, 100), 1);
///
/// // 9 and 102 are both divisible by 3.
/// assert_eq!(util::gcd(9, 102), 3);
/// ```
pub fn gcd(u: usize, v: usize) -> usize {
    match ((u, v), (u & 1, v & 1)) {
        ((x, y), _) if x == y => x,
        ((0, y), _) | ((y, 0), _) => y,
        ((x, y), (0, 1)) | ((y, x), (1, 0)) => gcd(x >> 1, y),
        ((x, y), (0, 0)) => gcd(x >> 1, y >> 1) << 1,
        ((x, y), (1, 1)) => {
            let (x, y) = (min(x, y), max(x, y));
            gcd((y - x) >> 1, x)
        }
        _ => unreachable!(),
    }
}

/// Calculate median for a BTreeMap of rounded latencies.
///
/// The map holds each rounded latency on the left and the number of times it was seen on
/// the right. Because latencies are rounded, the result is clamped to the real `min`
/// and `max` seen.
///
/// # Example
/// ```rust
/// use std::collections::BTreeMap;
/// use flock::util;
///
/// let mut btree: BTreeMap<usize, usize> = BTreeMap::new();
/// btree.insert(1, 1);
/// btree.insert(99, 1);
/// btree.insert(100, 1);
///
/// // Median (middle) value in this list of 3 integers is 99.
/// assert_eq!(util::median(&btree, 3, 1, 100), 99);
/// ```
pub fn median(
    btree: &BTreeMap<usize, usize>,
    total_elements: usize,
    min: usize,
    max: usize,
) -> usize {
    let mut total_count: usize = 0;
    let half_elements: usize = (total_elements as f64 / 2.0).round() as usize;
    for (value, counter) in btree {
        total_count += counter;
        if total_count >= half_elements {
            if *value > max {
                return max;
            } else if *value < min {
                return min;
            } else {
                return *value;
            }
        }
    }
    0
}

/// Truncate strings when they're too long to display.
///
/// If a string is longer than the specified max length, this function removes extra
/// the characters and replaces the last two with a double-period ellipsis.
///
/// # Example
/// ```rust
/// use flock::util;
///
/// assert_eq!(util::truncate_string("this is a long string", 9), "this is..");
/// assert_eq!(util::truncate_string("shorter string", 15), "shorter string");
/// ```
pub fn truncate_string(str_to_truncate: &str, max_length: usize) -> String {
    if str_to_truncate.char_indices().count() > max_length {
        match str_to_truncate.char_indices().nth(max_length.saturating_sub(2)) {
            None => str_to_truncate.to_string(),
            Some((idx, _)) => format!("{}..", &str_to_truncate[..idx]),
        }
    } else {
        str_to_truncate.to_string()
    }
}

/// Helper function to determine if a url can be parsed and has a host.
///
/// # Example
/// ```rust
/// use flock::util;
///
/// assert!(util::is_valid_url("http://localhost:8080/?rnd=1").is_ok());
/// assert!(util::is_valid_url("localhost:8080/").is_err());
/// ```
pub fn is_valid_url(url: &str) -> Result<Url, FlockError> {
    let parsed = Url::parse(url).map_err(|parse_error| FlockError::InvalidUrl {
        url: url.to_string(),
        detail: "Invalid url.".to_string(),
        parse_error,
    })?;
    if !parsed.has_host() {
        return Err(FlockError::InvalidUrl {
            url: url.to_string(),
            detail: "Url has no host.".to_string(),
            parse_error: url::ParseError::EmptyHost,
        });
    }
    Ok(parsed)
}

// Internal helper to configure the control-c handler. Shutdown cleanly on the first
// ctrl-c. Exit abruptly on the second ctrl-c.
pub(crate) fn setup_ctrlc_handler() {
    // Every run starts out not canceled.
    if let Ok(mut canceled) = CANCELED.write() {
        *canceled = false;
    }

    match ctrlc::set_handler(move || {
        let already_canceled = CANCELED.read().map(|c| *c).unwrap_or(true);
        if already_canceled {
            warn!("caught another ctrl-c, exiting immediately...");
            std::process::exit(1);
        } else {
            warn!("caught ctrl-c, stopping...");
            if let Ok(mut canceled) = CANCELED.write() {
                *canceled = true;
            }
        }
    }) {
        Ok(_) => (),
        // The handler can only be installed once per process, later runs reuse it.
        Err(e) => debug!("reusing ctrl-c handler: {}", e),
    }
}

/// Returns true if ctrl-c was caught during the current run.
pub(crate) fn ctrlc_caught() -> bool {
    CANCELED.read().map(|c| *c).unwrap_or(false)
}
