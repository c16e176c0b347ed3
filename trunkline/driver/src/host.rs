use crate::alarm::AlarmMask;
use crate::dma::CHUNK;
use crate::echo::ToneEvent;
use crate::hdlc::{HdlcAbort, HdlcChunk};

/// Samples for one channel across one DMA tick.
pub type Chunk = [u8; CHUNK];

/// The host telephony framework, as seen from a card.
///
/// Every method is called with the card's state locked, from either the
/// interrupt handler or deferred context. Implementations must not block
/// and must not call back into the card.
///
pub trait Host: Send {
    /// Received samples for an open channel.
    fn receive(&mut self, span: usize, channel: usize, chunk: &Chunk);

    /// Samples to transmit on an open channel. `chunk` holds idle code on
    /// entry.
    fn transmit(&mut self, span: usize, channel: usize, chunk: &mut Chunk);

    fn alarm_changed(&mut self, _span: usize, _mask: AlarmMask) {}

    fn signaling_changed(&mut self, _span: usize, _channel: usize, _abcd: u8) {}

    /// Part of an HDLC frame still being received.
    fn hdlc_partial(&mut self, _span: usize, _data: &[u8]) {}

    /// Final bytes of a good HDLC frame. The frame is complete.
    fn hdlc_frame(&mut self, _span: usize, _data: &[u8]) {}

    /// The frame being received is bad. Bytes passed to `hdlc_partial`
    /// since the last complete frame should be discarded.
    fn hdlc_abort(&mut self, _span: usize, _reason: HdlcAbort) {}

    /// Fill `buffer` with the next bytes to transmit. `None` when nothing
    /// is queued.
    fn hdlc_next_transmit(&mut self, _span: usize, _buffer: &mut [u8]) -> Option<HdlcChunk> {
        None
    }

    fn dsp_event(&mut self, _span: usize, _channel: usize, _event: ToneEvent) {}
}
