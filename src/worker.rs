//! Batch worker
//!
//! Reads judge requests as JSON lines, judges up to `concurrency` of them at
//! once and writes one JSON record per request as each finishes. Each request
//! gets its own orchestration run; the only thing the runs share is the
//! immutable registry and the backend.

use std::sync::Arc;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::core::error::JudgeError;
use crate::core::submission::Submission;
use crate::core::verdict::Verdict;
use crate::orchestrator::{JudgeReport, Orchestrator};

/// One line of batch input
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JudgeRequest {
    /// Caller-chosen identifier echoed in the record (defaults to the line number)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(flatten)]
    pub submission: Submission,
}

/// One line of batch output
#[derive(Debug, Serialize)]
pub struct JudgeRecord {
    pub id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub verdict: Option<Verdict>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub report: Option<JudgeReport>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl JudgeRecord {
    pub fn from_result(id: String, result: Result<JudgeReport, JudgeError>) -> Self {
        match result {
            Ok(report) => Self {
                id,
                verdict: Some(report.verdict),
                report: Some(report),
                error: None,
            },
            Err(e) => Self {
                id,
                verdict: e.verdict(),
                report: None,
                error: Some(e.to_string()),
            },
        }
    }

    fn malformed(id: String, message: String) -> Self {
        Self {
            id,
            verdict: None,
            report: None,
            error: Some(message),
        }
    }
}

/// Totals of a batch
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct BatchSummary {
    /// Requests that produced a verdict
    pub judged: usize,
    /// Requests that failed without one (malformed, unsupported, cancelled)
    pub rejected: usize,
    /// Requests that hit an infrastructure failure
    pub internal_errors: usize,
}

impl BatchSummary {
    fn record(&mut self, record: &JudgeRecord) {
        match (record.report.is_some(), record.verdict) {
            (true, _) => self.judged += 1,
            (false, Some(_)) => self.internal_errors += 1,
            (false, None) => self.rejected += 1,
        }
    }
}

pub struct Worker {
    orchestrator: Arc<Orchestrator>,
    concurrency: usize,
}

impl Worker {
    pub fn new(orchestrator: Arc<Orchestrator>, concurrency: usize) -> Self {
        Self {
            orchestrator,
            concurrency: concurrency.max(1),
        }
    }

    /// Judge every request read from `input`, writing records to `output`.
    ///
    /// Cancelling `cancel` stops reading and aborts the runs in flight; their
    /// records still get written. If reading or writing fails, the runs in
    /// flight are cancelled and awaited (tearing their sandboxes down) before
    /// the error is returned.
    pub async fn run_batch<R, W>(
        &self,
        input: R,
        mut output: W,
        cancel: &CancellationToken,
    ) -> Result<BatchSummary>
    where
        R: AsyncRead + Unpin,
        W: AsyncWrite + Unpin,
    {
        let batch = cancel.child_token();
        let mut tasks: JoinSet<JudgeRecord> = JoinSet::new();
        let mut summary = BatchSummary::default();

        info!("Judging batch with concurrency {}", self.concurrency);

        let pumped = self
            .pump(input, &mut output, &batch, &mut tasks, &mut summary)
            .await;
        if let Err(e) = pumped {
            error!(
                "Batch failed: {:#}; cancelling {} run(s) in flight",
                e,
                tasks.len()
            );
            batch.cancel();
            while let Some(joined) = tasks.join_next().await {
                match joined {
                    Ok(record) => summary.record(&record),
                    Err(join_error) => error!("Judge task failed: {}", join_error),
                }
            }
            return Err(e);
        }

        info!(
            "Batch finished: judged={}, rejected={}, internal_errors={}",
            summary.judged, summary.rejected, summary.internal_errors
        );
        Ok(summary)
    }

    /// Read, dispatch and record until the input ends or `batch` is cancelled
    async fn pump<R, W>(
        &self,
        input: R,
        output: &mut W,
        batch: &CancellationToken,
        tasks: &mut JoinSet<JudgeRecord>,
        summary: &mut BatchSummary,
    ) -> Result<()>
    where
        R: AsyncRead + Unpin,
        W: AsyncWrite + Unpin,
    {
        let semaphore = Arc::new(Semaphore::new(self.concurrency));
        let mut lines = BufReader::new(input).lines();
        let mut line_no = 0usize;

        loop {
            let line = tokio::select! {
                line = lines.next_line() => line.context("Failed to read batch input")?,
                _ = batch.cancelled() => {
                    warn!("Batch cancelled after {} request(s)", line_no);
                    break;
                }
            };
            let Some(line) = line else {
                break;
            };
            line_no += 1;
            if line.trim().is_empty() {
                continue;
            }

            let request = match serde_json::from_str::<JudgeRequest>(&line) {
                Ok(request) => request,
                Err(e) => {
                    warn!("Failed to parse request on line {}: {}", line_no, e);
                    let record =
                        JudgeRecord::malformed(format!("line-{}", line_no), e.to_string());
                    write_record(output, &record, summary).await?;
                    continue;
                }
            };

            // Wait for a slot, writing out whatever finished meanwhile
            let permit = loop {
                while let Some(joined) = tasks.try_join_next() {
                    let record = joined.context("Judge task panicked")?;
                    write_record(output, &record, summary).await?;
                }
                match Arc::clone(&semaphore).try_acquire_owned() {
                    Ok(permit) => break permit,
                    Err(_) => {
                        if let Some(joined) = tasks.join_next().await {
                            let record = joined.context("Judge task panicked")?;
                            write_record(output, &record, summary).await?;
                        }
                    }
                }
            };

            let id = request.id.unwrap_or_else(|| format!("line-{}", line_no));
            let orchestrator = Arc::clone(&self.orchestrator);
            let cancel = batch.child_token();
            tasks.spawn(async move {
                let _permit = permit;
                info!(
                    "Received judge request: id={}, language={}",
                    id, request.submission.language
                );
                let result = orchestrator.judge(&request.submission, &cancel).await;
                JudgeRecord::from_result(id, result)
            });
        }

        while let Some(joined) = tasks.join_next().await {
            let record = joined.context("Judge task panicked")?;
            write_record(output, &record, summary).await?;
        }
        output.flush().await?;
        Ok(())
    }
}

async fn write_record<W>(output: &mut W, record: &JudgeRecord, summary: &mut BatchSummary) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    match (&record.verdict, &record.error) {
        (Some(verdict), None) => info!("Judge completed: id={}, verdict={}", record.id, verdict),
        (Some(_), Some(e)) => error!("Judge failed: id={}: {}", record.id, e),
        (None, Some(e)) => warn!("Judge rejected: id={}: {}", record.id, e),
        (None, None) => {}
    }
    summary.record(record);

    let mut line = serde_json::to_vec(record)?;
    line.push(b'\n');
    output.write_all(&line).await?;
    Ok(())
}
