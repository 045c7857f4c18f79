//! Optional request log.
//!
//! The request log is enabled with the `--request-log` command-line option, or the
//! [`FlockDefault::RequestLog`](../config/enum.FlockDefault.html#variant.RequestLog) default
//! configuration option. When enabled, a logger task is launched and every
//! [`VirtualUser`](../user/struct.VirtualUser.html) offers a copy of each
//! [`RequestOutcome`] to it over a bounded channel. The logger writes through Tokio's
//! asynchronous [`BufWriter`](https://docs.rs/tokio/*/tokio/io/struct.BufWriter.html).
//!
//! If the logger can't keep up, log lines are dropped rather than slowing down virtual users.
//! The number of dropped lines is included in the final report.
//!
//! The format is configured with `--request-format`:
//!  - `json` (default): one JSON object per line;
//!  - `csv`: comma separated values, with a header line;
//!  - `raw`: the Debug representation of each outcome.
//!
//! ```json
//! {"elapsed":12,"vu_id":0,"iteration":3,"method":"GET","name":"index","url":"http://localhost:8080/?rnd=12.5","duration_micros":1832,"status":{"Response":200},"bytes_received":2}
//! ```

use regex::RegexSet;
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use tokio::fs::File;
use tokio::io::{AsyncWriteExt, BufWriter};
use tokio::task::JoinHandle;

use crate::metrics::RequestOutcome;
use crate::FlockError;

/// How many outcomes may wait for the logger before new lines are dropped.
pub(crate) const REQUEST_LOG_CAPACITY: usize = 10_000;

/// Supported request log formats.
#[derive(Clone, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
pub enum LogFormat {
    #[default]
    Json,
    Csv,
    Raw,
}
impl FromStr for LogFormat {
    type Err = FlockError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let log_format = RegexSet::new([r"(?i)^json$", r"(?i)^csv$", r"(?i)^raw$"])
            .expect("failed to compile log_format RegexSet");
        let matches = log_format.matches(s);
        if matches.matched(0) {
            Ok(LogFormat::Json)
        } else if matches.matched(1) {
            Ok(LogFormat::Csv)
        } else if matches.matched(2) {
            Ok(LogFormat::Raw)
        } else {
            Err(FlockError::InvalidOption {
                option: "--request-format".to_string(),
                value: s.to_string(),
                detail: "Invalid request format, expected: json, csv, or raw.".to_string(),
            })
        }
    }
}

/// Format one outcome as a line of the request log, without the line feed.
pub(crate) fn format_outcome(outcome: &RequestOutcome, format: &LogFormat) -> String {
    match format {
        LogFormat::Json => match serde_json::to_string(outcome) {
            Ok(line) => line,
            Err(e) => {
                warn!("failed to serialize request outcome: {}", e);
                String::new()
            }
        },
        LogFormat::Csv => outcome.csv_row(),
        LogFormat::Raw => format!("{:?}", outcome),
    }
}

/// Create the request log file and launch the logger task.
///
/// Returns the channel virtual users send outcomes on, and the logger task. Sending `None`
/// tells the logger to flush and exit.
pub(crate) async fn setup_request_logger(
    path: &str,
    format: LogFormat,
) -> Result<
    (
        flume::Sender<Option<RequestOutcome>>,
        JoinHandle<Result<(), FlockError>>,
    ),
    FlockError,
> {
    let file = File::create(path).await.map_err(|e| {
        error!("failed to create request log ({}): {}", path, e);
        FlockError::Io(e)
    })?;
    info!("writing requests to request log: {}", path);

    let (sender, receiver) = flume::bounded(REQUEST_LOG_CAPACITY);
    let logger = tokio::spawn(logger_main(
        path.to_string(),
        format,
        BufWriter::with_capacity(64 * 1024, file),
        receiver,
    ));
    Ok((sender, logger))
}

/// Logger task, waits for outcomes from virtual users and writes them to the request log.
async fn logger_main(
    path: String,
    format: LogFormat,
    mut file: BufWriter<File>,
    receiver: flume::Receiver<Option<RequestOutcome>>,
) -> Result<(), FlockError> {
    if format == LogFormat::Csv {
        file.write_all(format!("{}\n", RequestOutcome::csv_header()).as_bytes())
            .await?;
    }

    // Loop waiting for and writing outcomes from virtual users.
    while let Ok(message) = receiver.recv_async().await {
        if let Some(outcome) = message {
            let formatted_log = format_outcome(&outcome, &format);
            if let Err(e) = file.write_all(format!("{}\n", formatted_log).as_bytes()).await {
                warn!("failed to write to {}: {}", &path, e);
            }
        } else {
            // Empty message means it's time to exit.
            break;
        }
    }

    // Cleanup and flush all logs to disk.
    info!("flushing request log: {}", &path);
    file.flush().await?;

    Ok(())
}
