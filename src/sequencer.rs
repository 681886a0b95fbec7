//! Drives a command plan over a ready link, one request at a time.
//!
//! [`Sequencer`] is the bookkeeping: the cursor into the plan, the response
//! buffer and the frames collected so far. [`run`] is the I/O loop around it.
//! Both the write path and the notification path run on the caller's task, so
//! the buffer and cursor are never touched concurrently.

use std::mem;
use std::time::Duration;

use bluest::Uuid;
use tokio::sync::mpsc;
use tokio::time::{sleep, timeout};
use tracing::debug;

use crate::adapter::{Classification, DeviceAdapter};
use crate::ble::BleLink;
use crate::command::{CommandPlan, CommandSpec, CompletedFrame, RequestFrame};
use crate::config::SessionConfig;
use crate::error::{Error, Phase, Result, WriteError};

pub struct Sequencer<'a> {
    plan: &'a CommandPlan,
    cursor: usize,
    buffer: Vec<u8>,
    completed: Vec<CompletedFrame>,
}

impl<'a> Sequencer<'a> {
    pub fn new(plan: &'a CommandPlan) -> Self {
        Self {
            plan,
            cursor: 0,
            buffer: Vec::new(),
            completed: Vec::with_capacity(plan.len()),
        }
    }

    /// The command whose response is awaited, `None` once the plan is done.
    pub fn pending(&self) -> Option<&'a CommandSpec> {
        self.plan.get(self.cursor)
    }

    pub fn cursor(&self) -> usize {
        self.cursor
    }

    pub fn is_finished(&self) -> bool {
        self.cursor == self.plan.len()
    }

    pub fn buffered(&self) -> &[u8] {
        &self.buffer
    }

    /// Append one notification. Returns `true` when it completed the frame
    /// for the pending command, which advances the cursor.
    pub fn on_notification(&mut self, data: &[u8], adapter: &dyn DeviceAdapter) -> Result<bool> {
        let Some(pending) = self.pending() else {
            debug!(len = data.len(), "notification after plan finished, ignoring");
            return Ok(false);
        };

        self.buffer.extend_from_slice(data);
        match adapter.classify(&self.buffer, pending)? {
            Classification::Incomplete => Ok(false),
            Classification::Complete(kind) => {
                debug!(command = pending.name, ?kind, len = self.buffer.len(), "frame complete");
                self.completed.push(CompletedFrame {
                    command: pending.clone(),
                    kind,
                    bytes: mem::take(&mut self.buffer),
                });
                self.cursor += 1;
                Ok(true)
            }
        }
    }

    pub fn into_frames(self) -> Vec<CompletedFrame> {
        self.completed
    }
}

/// Send every request of `plan` in order and collect the responses.
///
/// Returns once the last response is complete; the caller then disconnects.
pub async fn run(
    link: &mut dyn BleLink,
    notifications: &mut mpsc::Receiver<Vec<u8>>,
    adapter: &dyn DeviceAdapter,
    write_uuid: Uuid,
    plan: &CommandPlan,
    config: &SessionConfig,
) -> Result<Vec<CompletedFrame>> {
    let requests = adapter.encode_plan(plan)?;
    let mut sequencer = Sequencer::new(plan);

    for request in &requests {
        let index = sequencer.cursor();
        // Duplicates of the previous response must not leak into this one.
        while let Ok(stale) = notifications.try_recv() {
            debug!(index, rx = %hex::encode(&stale), "discarding stale notification");
        }
        debug!(index, tx = %hex::encode(request.as_bytes()), "TX");
        write_with_retry(
            link,
            write_uuid,
            request,
            config.write_retry_limit,
            config.write_retry_backoff,
        )
        .await?;

        while sequencer.cursor() == index {
            let data = match timeout(config.read_timeout, notifications.recv()).await {
                Ok(Some(data)) => data,
                Ok(None) => {
                    return Err(Error::ConnectionError(
                        "notification stream ended".to_string(),
                    ))
                }
                Err(_) => {
                    let buffered = hex::encode(sequencer.buffered());
                    debug!(index, %buffered, "response timed out");
                    return Err(Error::ConnectionTimeout {
                        phase: Phase::AwaitingResponse,
                    });
                }
            };
            debug!(rx = %hex::encode(&data), "RX notification");
            sequencer.on_notification(&data, adapter)?;
        }
    }

    debug_assert!(sequencer.is_finished());
    Ok(sequencer.into_frames())
}

/// Write `request`, repeating the identical payload while the link reports
/// an operation in progress.
async fn write_with_retry(
    link: &mut dyn BleLink,
    uuid: Uuid,
    request: &RequestFrame,
    max_attempts: u32,
    backoff: Duration,
) -> Result<()> {
    let max_attempts = max_attempts.max(1);
    let mut attempts = 0;
    loop {
        attempts += 1;
        match link.write(uuid, request.as_bytes()).await {
            Ok(()) => return Ok(()),
            Err(WriteError::Busy) if attempts < max_attempts => {
                debug!(attempts, "write busy, retrying");
                sleep(backoff).await;
            }
            Err(WriteError::Busy) => return Err(Error::WriteRetriesExhausted { attempts }),
            Err(WriteError::Failed(msg)) => return Err(Error::ConnectionError(msg)),
        }
    }
}
