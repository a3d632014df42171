use std::time::Duration;

pub mod notifier;
pub mod subscriber;

#[cfg(test)]
mod tests;

pub use notifier::{Notifier, NotifierEvent, NotifierOptions, NotifierState, NotifierTerminationCode};
pub use subscriber::{
    Subscriber, SubscriberEvent, SubscriberOptions, SubscriberState, SubscriberTerminationCode,
};

/// RFC 6665 3.1.1: a 2xx to SUBSCRIBE must carry Expires; peers that
/// omit it get this value instead.
pub const DEFAULT_EXPIRES: u32 = 900;

/// How long the subscriber waits for the final NOTIFY after sending an
/// unsubscribe before giving up on the peer.
pub(crate) const UNSUBSCRIBE_GUARD: Duration = Duration::from_secs(30);

/// The terminated subscriber keeps its dialog registered this long so a
/// final NOTIFY crossing the unsubscribe can still be dispatched.
pub(crate) const DIALOG_LINGER: Duration = Duration::from_secs(32);

/// A shorter Subscription-State expires only reschedules the refresh
/// when it moves the deadline by more than this.
pub(crate) const RESCHEDULE_THRESHOLD: Duration = Duration::from_secs(2);

const REFRESH_WINDOW_MIN_EXPIRES: u32 = 140;
const REFRESH_TAIL_MARGIN: u32 = 70;
const SHORT_REFRESH_MARGIN: u32 = 5;

/// Delay before the next refresh SUBSCRIBE for a subscription expiring
/// in `expires` seconds.
///
/// Large expirations refresh at a uniformly random point in
/// [expires/2, expires - 70] so that a fleet of subscribers started
/// together does not refresh in lockstep; the 70 s ceiling margin and
/// the 5 s margin for short expirations absorb network delay.
pub(crate) fn refresh_delay(expires: u32) -> Duration {
    use rand::Rng;
    if expires >= REFRESH_WINDOW_MIN_EXPIRES {
        let min = expires / 2;
        let max = expires - REFRESH_TAIL_MARGIN;
        Duration::from_secs(rand::rng().random_range(min..=max) as u64)
    } else {
        Duration::from_secs(expires.saturating_sub(SHORT_REFRESH_MARGIN) as u64)
    }
}
