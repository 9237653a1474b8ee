// Copyright 2023 Greptime Team
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Single-flight flush admission.

use std::sync::atomic::{AtomicBool, Ordering};

use tokio::sync::watch;

/// Admission gate serializing flushes of one shard.
///
/// A compare-and-swap on the in-flight flag is the sole admission check:
/// a flush requested while another is running is a successful no-op, not a
/// queued job. The drain counter lets close wait for an in-flight flush
/// without blocking new admission logic.
pub(crate) struct FlushGate {
    flushing: AtomicBool,
    inflight: watch::Sender<u32>,
}

impl FlushGate {
    pub(crate) fn new() -> FlushGate {
        let (inflight, _) = watch::channel(0);
        FlushGate {
            flushing: AtomicBool::new(false),
            inflight,
        }
    }

    /// Admits at most one flush at a time; returns `None` while one is
    /// in flight.
    pub(crate) fn try_acquire(&self) -> Option<FlushPermit<'_>> {
        if self
            .flushing
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return None;
        }
        self.inflight.send_modify(|n| *n += 1);
        Some(FlushPermit { gate: self })
    }

    /// Waits until no flush is in flight.
    pub(crate) async fn wait_drained(&self) {
        let mut rx = self.inflight.subscribe();
        // wait_for checks the current value before waiting, and the sender
        // cannot drop while the gate is borrowed.
        let _ = rx.wait_for(|inflight| *inflight == 0).await;
    }
}

/// Releases the gate on drop, so a flush that errors or panics still frees
/// the admission flag and the drain counter.
pub(crate) struct FlushPermit<'a> {
    gate: &'a FlushGate,
}

impl Drop for FlushPermit<'_> {
    fn drop(&mut self) {
        self.gate.inflight.send_modify(|n| *n -= 1);
        self.gate.flushing.store(false, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use super::*;

    #[test]
    fn test_single_flight_admission() {
        let gate = FlushGate::new();
        let permit = gate.try_acquire().unwrap();
        assert!(gate.try_acquire().is_none());
        drop(permit);
        assert!(gate.try_acquire().is_some());
    }

    #[tokio::test]
    async fn test_wait_drained_without_flush() {
        let gate = FlushGate::new();
        // Must return immediately when nothing is in flight.
        gate.wait_drained().await;
    }

    #[tokio::test]
    async fn test_wait_drained_blocks_until_permit_dropped() {
        let gate = Arc::new(FlushGate::new());
        let permit = gate.try_acquire().unwrap();

        let waiter = {
            let gate = gate.clone();
            tokio::spawn(async move { gate.wait_drained().await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());

        drop(permit);
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();
    }
}
