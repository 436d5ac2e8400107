//! Per-call execution state for the attempt loop.
//!
//! One [`ExecutionState`] exists per `execute` call, owned exclusively by
//! the executor for that call's duration. It tracks which replica the
//! in-flight attempt targets, the effective location mode (which a retry
//! policy may narrow mid-operation), the retry count, and the absolute
//! operation deadline.

use std::time::Instant;

use super::command::{CommandLocationMode, LocationMode, StorageLocation};

/// Mutable coordination state for one operation.
#[derive(Debug)]
pub(crate) struct ExecutionState {
    /// Mode in effect for this operation, already narrowed by the command's
    /// hard constraint and possibly by the retry policy.
    pub effective_mode: LocationMode,
    /// Replica the current attempt targets.
    pub current_location: StorageLocation,
    /// Completed (failed) attempts so far.
    pub retry_count: u32,
    /// Absolute operation deadline, when the caller set one.
    pub expiry: Option<Instant>,
}

impl ExecutionState {
    pub(crate) fn new(effective_mode: LocationMode, expiry: Option<Instant>) -> Self {
        Self {
            effective_mode,
            current_location: effective_mode.initial_location(),
            retry_count: 0,
            expiry,
        }
    }

    /// 1-indexed number of the attempt about to run (or running).
    pub(crate) fn attempt_number(&self) -> u32 {
        self.retry_count + 1
    }

    /// Location the next attempt would target under the alternation rule.
    pub(crate) fn next_location(&self) -> StorageLocation {
        self.effective_mode.alternate(self.current_location)
    }

    /// Applies a retry decision: the policy's target and updated mode, both
    /// forced through the command's hard constraint so a policy can never
    /// route a pinned operation to the wrong replica.
    ///
    /// Returns `false` when the policy's updated mode contradicts the
    /// command constraint, which the caller treats as terminal.
    pub(crate) fn apply_retry_target(
        &mut self,
        constraint: CommandLocationMode,
        target: StorageLocation,
        updated_mode: LocationMode,
    ) -> bool {
        let Ok(mode) = constraint.apply(updated_mode) else {
            return false;
        };
        self.effective_mode = mode;
        self.current_location = constraint.force(target);
        if !self.effective_mode.permits(self.current_location) {
            self.current_location = self.effective_mode.initial_location();
        }
        self.retry_count += 1;
        true
    }

    /// Whether the operation deadline has already passed.
    pub(crate) fn expired(&self, now: Instant) -> bool {
        self.expiry.is_some_and(|expiry| expiry <= now)
    }
}
