//! Retry / Hedging Controller (§4.7): wraps the Call Runtime with
//! re-pick-and-reissue, channel-wide throttling, and retry buffer accounting.

mod buffer;
mod controller;
mod throttle;

pub(crate) use buffer::ChannelBudget;
pub(crate) use controller::{call_unary, RetryContext};
pub(crate) use throttle::Throttle;
