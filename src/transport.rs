//! Transport abstraction for exchanging APDUs with a card.

use bytes::Bytes;

use crate::Result;

/// Blocking ISO 7816-4 APDU exchange with a card.
///
/// The returned bytes carry the response payload followed by the SW1 SW2
/// trailer. Implementations enforce their own transceive timeout; the
/// protocol core performs no retries.
pub trait CardTransport {
    /// Transmit a raw command APDU and return the raw response
    fn transmit_raw(&mut self, command: &[u8]) -> Result<Bytes>;
}

impl<T: CardTransport + ?Sized> CardTransport for &mut T {
    fn transmit_raw(&mut self, command: &[u8]) -> Result<Bytes> {
        (**self).transmit_raw(command)
    }
}
