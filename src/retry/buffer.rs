//! Retry buffer accounting (§4.7): bytes reserved for every sent message that
//! might still need to be replayed on a future attempt, released in full the
//! moment the call commits.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

/// Channel-wide retry buffer budget, shared by every in-flight call.
pub(crate) struct ChannelBudget {
    limit: usize,
    used: AtomicUsize,
}

impl ChannelBudget {
    pub(crate) fn new(limit: usize) -> Arc<Self> {
        Arc::new(ChannelBudget {
            limit,
            used: AtomicUsize::new(0),
        })
    }

    fn try_reserve(&self, size: usize) -> bool {
        loop {
            let current = self.used.load(Ordering::SeqCst);
            let Some(next) = current.checked_add(size) else {
                return false;
            };
            if next > self.limit {
                return false;
            }
            if self
                .used
                .compare_exchange(current, next, Ordering::SeqCst, Ordering::SeqCst)
                .is_ok()
            {
                return true;
            }
        }
    }

    fn release(&self, size: usize) {
        self.used.fetch_sub(size, Ordering::SeqCst);
    }
}

/// Per-call retry buffer: every message sent so far for the *current*
/// attempt, retained so a retried attempt can replay them. Reserves bytes
/// against both the per-call cap and the channel-wide budget; dropping the
/// buffer (call commit or failure) releases everything it still holds.
pub(crate) struct CallBuffer {
    channel: Arc<ChannelBudget>,
    per_call_limit: usize,
    used: usize,
}

impl CallBuffer {
    pub(crate) fn new(channel: Arc<ChannelBudget>, per_call_limit: usize) -> Self {
        CallBuffer {
            channel,
            per_call_limit,
            used: 0,
        }
    }

    /// Attempts to reserve `size` bytes for a newly sent message. Returns
    /// `false` (reserving nothing) if either cap would be exceeded, in which
    /// case the caller must commit to the current attempt (§4.7 Buffering).
    pub(crate) fn try_add(&mut self, size: usize) -> bool {
        if self.used + size > self.per_call_limit {
            return false;
        }
        if !self.channel.try_reserve(size) {
            return false;
        }
        self.used += size;
        true
    }

    /// Releases every byte this call has reserved, e.g. on commit or final failure.
    pub(crate) fn release_all(&mut self) {
        if self.used > 0 {
            self.channel.release(self.used);
            self.used = 0;
        }
    }
}

impl Drop for CallBuffer {
    fn drop(&mut self) {
        self.release_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reservation_respects_per_call_cap() {
        let channel = ChannelBudget::new(1024);
        let mut buffer = CallBuffer::new(channel, 16);
        assert!(buffer.try_add(10));
        assert!(!buffer.try_add(10));
    }

    #[test]
    fn reservation_respects_channel_cap() {
        let channel = ChannelBudget::new(16);
        let mut a = CallBuffer::new(channel.clone(), 1024);
        let mut b = CallBuffer::new(channel, 1024);
        assert!(a.try_add(10));
        assert!(!b.try_add(10));
    }

    #[test]
    fn release_returns_bytes_to_the_channel() {
        let channel = ChannelBudget::new(16);
        let mut a = CallBuffer::new(channel.clone(), 1024);
        assert!(a.try_add(10));
        a.release_all();

        let mut b = CallBuffer::new(channel, 1024);
        assert!(b.try_add(10));
    }

    #[test]
    fn dropping_the_buffer_releases_its_bytes() {
        let channel = ChannelBudget::new(16);
        {
            let mut a = CallBuffer::new(channel.clone(), 1024);
            assert!(a.try_add(16));
        }
        let mut b = CallBuffer::new(channel, 1024);
        assert!(b.try_add(16));
    }
}
