//! Buffered command streaming with flow control
//!
//! Implements GRBL character-counting flow control: lines are released to the
//! device only while everything in the device's receive buffer, newline
//! terminated, still fits in [`MAX_BYTES`]. Each `ok` frees the oldest line.
//!
//! # Features
//! - Console queue with priority over the job queue
//! - Job queue frozen while the job is not running
//! - Byte accounting on encoded UTF-8 length
//! - Completed command counting for progress

use grblbridge_core::JobProgress;
use std::collections::VecDeque;

/// Size of the device's serial receive buffer
pub const MAX_BYTES: usize = 127;

/// Command queues plus the lines in flight on the device
#[derive(Debug, Clone)]
pub struct CommandBuffer {
    max_bytes: usize,
    console: VecDeque<String>,
    job: VecDeque<String>,
    in_flight: VecDeque<String>,
    in_flight_bytes: usize,
    completed: usize,
    last_completed: Option<String>,
}

impl CommandBuffer {
    /// Create a buffer sized for the device's receive buffer
    pub fn new() -> Self {
        Self::with_max_bytes(MAX_BYTES)
    }

    /// Create a buffer with a custom byte budget
    pub fn with_max_bytes(max_bytes: usize) -> Self {
        Self {
            max_bytes,
            console: VecDeque::new(),
            job: VecDeque::new(),
            in_flight: VecDeque::new(),
            in_flight_bytes: 0,
            completed: 0,
            last_completed: None,
        }
    }

    /// Bytes a line occupies in the device buffer, newline included
    fn line_cost(line: &str) -> usize {
        line.len() + 1
    }

    /// Next line eligible for transmission
    ///
    /// Console lines always go first. Job lines are only eligible when
    /// `job_may_advance` is set (a job is active and running).
    pub fn next_command(&self, job_may_advance: bool) -> Option<&str> {
        if let Some(line) = self.console.front() {
            return Some(line.as_str());
        }
        if job_may_advance {
            return self.job.front().map(String::as_str);
        }
        None
    }

    fn has_room_for(&self, line: &str) -> bool {
        self.in_flight_bytes + Self::line_cost(line) <= self.max_bytes
    }

    fn dequeue(&mut self, job_may_advance: bool) -> Option<String> {
        if let Some(line) = self.console.pop_front() {
            return Some(line);
        }
        if job_may_advance {
            return self.job.pop_front();
        }
        None
    }

    /// Move as many eligible lines as fit into the in-flight list
    ///
    /// Returns the released lines in order; the caller transmits them.
    /// A line too long to ever fit is discarded and counted as completed so
    /// it cannot stall the queue.
    pub fn fill(&mut self, job_may_advance: bool) -> Vec<String> {
        let mut released = Vec::new();
        while let Some(next) = self.next_command(job_may_advance) {
            if !self.has_room_for(next) {
                if self.in_flight.is_empty() {
                    if let Some(line) = self.dequeue(job_may_advance) {
                        tracing::error!(
                            bytes = line.len(),
                            max = self.max_bytes,
                            "Dropping line longer than the device buffer: {}",
                            line
                        );
                        self.completed += 1;
                    }
                    continue;
                }
                break;
            }
            let Some(line) = self.dequeue(job_may_advance) else {
                break;
            };
            self.in_flight_bytes += Self::line_cost(&line);
            self.in_flight.push_back(line.clone());
            released.push(line);
        }
        released
    }

    /// Handle an acknowledgment: retire the oldest in-flight line
    ///
    /// Returns the retired line, or `None` when nothing was in flight.
    pub fn acknowledge(&mut self) -> Option<String> {
        let line = self.in_flight.pop_front()?;
        self.in_flight_bytes = self.in_flight_bytes.saturating_sub(Self::line_cost(&line));
        self.completed += 1;
        self.last_completed = Some(line.clone());
        Some(line)
    }

    /// Queue a console line
    pub fn push_console(&mut self, line: impl Into<String>) {
        self.console.push_back(line.into());
    }

    /// Replace the job queue and zero the completed counter
    pub fn replace_job<I, S>(&mut self, lines: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.job = lines.into_iter().map(Into::into).collect();
        self.completed = 0;
    }

    /// Clear both queues and the in-flight list
    pub fn clear_queues(&mut self) {
        self.console.clear();
        self.job.clear();
        self.in_flight.clear();
        self.in_flight_bytes = 0;
    }

    /// Clear everything including the completed counter
    pub fn reset(&mut self) {
        self.clear_queues();
        self.completed = 0;
    }

    /// Lines queued or in flight
    pub fn unprocessed(&self) -> usize {
        self.console.len() + self.job.len() + self.in_flight.len()
    }

    /// Lines acknowledged since the last job start or reset
    pub fn completed(&self) -> usize {
        self.completed
    }

    /// Completed/unprocessed snapshot
    pub fn progress(&self) -> JobProgress {
        JobProgress {
            completed: self.completed,
            unprocessed: self.unprocessed(),
        }
    }

    /// Lines currently in the device buffer, oldest first
    pub fn in_flight(&self) -> Vec<String> {
        self.in_flight.iter().cloned().collect()
    }

    /// Bytes currently committed in the device buffer
    pub fn in_flight_bytes(&self) -> usize {
        self.in_flight_bytes
    }

    /// Last line the device acknowledged
    pub fn last_completed(&self) -> Option<&str> {
        self.last_completed.as_deref()
    }

    /// Byte budget
    pub fn max_bytes(&self) -> usize {
        self.max_bytes
    }
}

impl Default for CommandBuffer {
    fn default() -> Self {
        Self::new()
    }
}
