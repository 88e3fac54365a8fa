//! The query job currently submitted for the session.
//!
//! A job is completed by the `RUN-QUERY` milestone. The milestone handler
//! publishes the line on a watch channel; waiters either await that channel
//! directly (exact count needed) or race it against `BUFFER-STATE` polling
//! (a prefix of the results is enough).
//!
//! Counts read from `BUFFER-STATE` are provisional lower bounds. Only the
//! milestone count is final.

use std::time::Duration;

use tokio::sync::watch;
use tracing::debug;

use crate::error::{PoliqarpError, Result};
use crate::ipc::{MilestoneHandler, ServerLine};

pub(crate) struct QueryJob {
    pub query: String,
    /// Buffer capacity the job was started with.
    pub capacity: u64,
    completion: watch::Receiver<Option<ServerLine>>,
    final_count: Option<u64>,
    provisional: u64,
}

impl QueryJob {
    /// Create a job together with the handler that completes it.
    pub fn new(query: &str, capacity: u64) -> (Self, MilestoneHandler) {
        let (tx, rx) = watch::channel(None);
        let handler: MilestoneHandler = Box::new(move |line| {
            let _ = tx.send(Some(line));
        });
        let job = Self {
            query: query.to_string(),
            capacity,
            completion: rx,
            final_count: None,
            provisional: 0,
        };
        (job, handler)
    }

    pub fn is_complete(&self) -> bool {
        self.final_count.is_some()
    }

    /// Best count known so far.
    pub fn known_count(&self) -> u64 {
        self.final_count.unwrap_or(self.provisional)
    }

    /// Record a `BUFFER-STATE` count. Counts never go backwards.
    pub fn observe(&mut self, buffered: u64) {
        self.provisional = self.provisional.max(buffered);
    }

    /// Pick up the milestone if it has arrived.
    ///
    /// Returns the final count once the job is complete.
    pub fn check(&mut self) -> Result<Option<u64>> {
        if let Some(count) = self.final_count {
            return Ok(Some(count));
        }

        let milestone = self.completion.borrow_and_update().clone();
        if let Some(line) = milestone {
            let line = line.into_result()?;
            let count = milestone_count(&line)?;
            debug!("Query {:?} complete with {} results", self.query, count);
            self.final_count = Some(count);
            self.provisional = count;
            return Ok(Some(count));
        }

        if self.completion.has_changed().is_err() {
            // Handler dropped without firing: superseded by another command.
            return Err(PoliqarpError::Protocol(format!(
                "query {:?} lost its completion handler",
                self.query
            )));
        }
        Ok(None)
    }

    /// Resolve once the milestone arrives (or the handler is dropped).
    pub async fn completed(&mut self) {
        let _ = self.completion.changed().await;
    }

    /// Wait for the milestone and return the final count.
    pub async fn wait(&mut self, limit: Option<Duration>) -> Result<u64> {
        let wait = async {
            loop {
                if let Some(count) = self.check()? {
                    return Ok(count);
                }
                self.completed().await;
            }
        };
        match limit {
            Some(limit) => tokio::time::timeout(limit, wait)
                .await
                .map_err(|_| PoliqarpError::Timeout(limit))?,
            None => wait.await,
        }
    }
}

/// Result count carried by a `RUN-QUERY` milestone, e.g. `QUERY-DONE 188`.
fn milestone_count(line: &ServerLine) -> Result<u64> {
    line.payload
        .split_whitespace()
        .skip(1)
        .find_map(|field| field.parse().ok())
        .ok_or_else(|| {
            PoliqarpError::Protocol(format!("No result count in milestone {:?}", line.payload))
        })
}
