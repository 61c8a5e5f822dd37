/// Errors that can occur during pool operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum PoolError<E: core::fmt::Debug> {
    /// The backend failed to enumerate its channels.
    Backend(E),
    /// The backend did not pass a switch command on. The channel keeps its
    /// previous state and budget slot.
    Refused(E),
    /// Enumeration finished without a single channel.
    NoDosers,
    /// `n` leases are still outstanding, the channel set cannot be replaced.
    InUse(usize),
}
