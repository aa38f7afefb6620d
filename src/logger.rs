//! Optional per-request log.
//!
//! The request log is enabled with the `--request-log` command-line option, or the
//! [`StampedeDefault::RequestLog`](../config/enum.StampedeDefault.html#variant.RequestLog)
//! default configuration option. When enabled, a logger task is launched and every
//! virtual user gets a channel to it, sending a copy of each [`RequestSample`] it
//! records. The logger task writes one line per sample through Tokio's asynchronous
//! [`BufWriter`](https://docs.rs/tokio/*/tokio/io/struct.BufWriter.html), so writing the
//! log never blocks a virtual user.
//!
//! The format is selected with `--request-format`:
//!  - `json`: one JSON object per line (the default).
//!  - `csv`: comma separated values, with a header row.
//!  - `raw`: the Rust debug representation of each sample.

use serde::{Deserialize, Serialize};
use serde_json::json;
use strum_macros::{Display, EnumString};
use tokio::fs::File;
use tokio::io::{AsyncWriteExt, BufWriter};

use crate::metrics::{Outcome, RequestSample};
use crate::{StampedeConfiguration, StampedeError};

/// Sender half of the logger channel. `None` is sent to tell the logger to flush and exit.
pub(crate) type RequestLoggerTx = Option<flume::Sender<Option<RequestSample>>>;

/// Handle of the logger task, joined at the end of the run.
pub(crate) type RequestLoggerHandle = Option<tokio::task::JoinHandle<Result<(), StampedeError>>>;

/// Supported request log formats.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Display, EnumString, Serialize, Deserialize)]
#[strum(serialize_all = "lowercase", ascii_case_insensitive)]
pub enum LogFormat {
    #[default]
    Json,
    Csv,
    Raw,
}

const CSV_HEADER: &str = "started,user,latency_us,success,reason,size_bytes,clamped";

/// Render one sample as a single line, without the trailing newline.
pub(crate) fn format_sample(sample: &RequestSample, format: LogFormat) -> String {
    match format {
        // Use serde_json to create JSON.
        LogFormat::Json => json!(sample).to_string(),
        LogFormat::Csv => {
            let (success, reason) = match &sample.outcome {
                Outcome::Success => (true, String::new()),
                // Quote the reason, doubling embedded quotes.
                Outcome::Failure(reason) => (false, format!("\"{}\"", reason.replace('"', "\"\""))),
            };
            format!(
                "{},{},{},{},{},{},{}",
                sample.started.to_rfc3339(),
                sample.user,
                sample.latency.as_micros(),
                success,
                reason,
                sample
                    .size_bytes
                    .map(|s| s.to_string())
                    .unwrap_or_default(),
                sample.clamped,
            )
        }
        // Raw format is Debug output for the RequestSample structure.
        LogFormat::Raw => format!("{:?}", sample),
    }
}

impl StampedeConfiguration {
    /// Open the request log (if configured) and launch the logger task.
    ///
    /// The file is created before returning so an unwritable path fails the run
    /// before any virtual user starts.
    pub(crate) async fn setup_request_logger(
        &self,
    ) -> Result<(RequestLoggerHandle, RequestLoggerTx), StampedeError> {
        if self.request_log.is_empty() {
            return Ok((None, None));
        }

        let file = File::create(&self.request_log).await?;
        info!("writing requests to request_log: {}", &self.request_log);
        let format = self.request_format.unwrap_or_default();
        let (sender, receiver) = flume::unbounded();
        let handle = tokio::spawn(logger_main(
            self.request_log.clone(),
            format,
            BufWriter::with_capacity(64 * 1024, file),
            receiver,
        ));
        Ok((Some(handle), Some(sender)))
    }
}

/// Logger task, waits for samples from virtual users and writes them to the log.
async fn logger_main(
    path: String,
    format: LogFormat,
    mut file: BufWriter<File>,
    receiver: flume::Receiver<Option<RequestSample>>,
) -> Result<(), StampedeError> {
    if format == LogFormat::Csv {
        file.write_all(format!("{}\n", CSV_HEADER).as_bytes()).await?;
    }

    // Loop until told to exit, or until every sender is dropped.
    while let Ok(Some(sample)) = receiver.recv_async().await {
        let line = format!("{}\n", format_sample(&sample, format));
        if let Err(e) = file.write_all(line.as_bytes()).await {
            warn!("failed to write to {}: {}", &path, e);
        }
    }

    // Cleanup and flush the log to disk.
    info!("flushing request_log: {}", &path);
    file.flush().await?;
    Ok(())
}
