use chrono::{DateTime, Utc};

/// A domain event: an immutable fact recorded in a stream.
pub trait Event: Clone + core::fmt::Debug + Send + Sync + 'static {
    /// Stable dotted name, e.g. `factoring.operation.concluded`.
    fn event_type(&self) -> &'static str;

    /// Payload schema revision. Bump when a payload changes shape.
    fn version(&self) -> u32 {
        1
    }

    /// Business time of the fact, as opposed to the time it was stored.
    fn occurred_at(&self) -> DateTime<Utc>;
}
