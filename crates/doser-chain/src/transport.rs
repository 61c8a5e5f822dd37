use doser_icd::Frame;

/// Shared bus between the controller and every module.
///
/// Every frame sent is seen by every other powered participant. Receiving
/// waits without limit; callers bound it with
/// [`embassy_time::with_timeout`].
#[allow(async_fn_in_trait)]
pub trait Transport {
    type Error: core::fmt::Debug;

    /// Open the reception filter to every identifier.
    fn accept_all(&self) -> Result<(), Self::Error>;

    async fn send(&self, frame: &Frame) -> Result<(), Self::Error>;

    /// Queue a frame without waiting for room in the transmit queue.
    fn try_send(&self, frame: &Frame) -> Result<(), Self::Error>;

    async fn receive(&self) -> Result<Frame, Self::Error>;

    /// Number of frames waiting in the receive queue.
    fn pending(&self) -> usize;

    /// Drop everything waiting in the receive queue.
    fn clear(&self);
}

impl<T: Transport> Transport for &T {
    type Error = T::Error;

    fn accept_all(&self) -> Result<(), Self::Error> {
        T::accept_all(self)
    }

    async fn send(&self, frame: &Frame) -> Result<(), Self::Error> {
        T::send(self, frame).await
    }

    fn try_send(&self, frame: &Frame) -> Result<(), Self::Error> {
        T::try_send(self, frame)
    }

    async fn receive(&self) -> Result<Frame, Self::Error> {
        T::receive(self).await
    }

    fn pending(&self) -> usize {
        T::pending(self)
    }

    fn clear(&self) {
        T::clear(self)
    }
}
