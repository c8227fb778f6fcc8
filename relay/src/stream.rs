//! Pumps byte chunks from a transport into frame reassembly.

use std::io::Read;

use tracing::{debug, trace};

use bytering::ByteRing;
use protocol::{Decoder, FrameSink};

use crate::Result;

/// Chunk size for transport reads. Chunks may still arrive smaller and
/// split frames anywhere; the decoder copes.
pub const CHUNK_SIZE: usize = 4096;

/// Drives a [`Decoder`] from a byte source until end of stream.
///
/// Single-threaded per stream. A protocol error tears the stream down;
/// end of stream with a buffered partial frame is reported as truncation.
pub struct StreamPump {
    decoder: Decoder,
    bytes_in: u64,
}

impl StreamPump {
    pub fn new() -> Self {
        StreamPump {
            decoder: Decoder::new(),
            bytes_in: 0,
        }
    }

    /// Read `source` to EOF, dispatching every reassembled packet to
    /// `sink`. Returns the number of bytes consumed.
    pub fn pump(&mut self, mut source: impl Read, sink: &mut impl FrameSink) -> Result<u64> {
        let mut buf = [0u8; CHUNK_SIZE];
        loop {
            match source.read(&mut buf) {
                Ok(0) => {
                    self.decoder.finish()?;
                    debug!(bytes = self.bytes_in, "stream drained");
                    return Ok(self.bytes_in);
                }
                Ok(read) => {
                    trace!(read, "feeding chunk");
                    self.bytes_in += read as u64;
                    self.decoder.feed(&buf[..read], sink)?;
                }
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            }
        }
    }

    /// Like [`pump`], but draining a [`ByteRing`] until it goes read-only
    /// and empty.
    ///
    /// [`pump`]: StreamPump::pump
    pub fn pump_ring(&mut self, ring: &ByteRing, sink: &mut impl FrameSink) -> Result<u64> {
        let mut buf = [0u8; CHUNK_SIZE];
        loop {
            let read = ring.read_some(&mut buf);
            if read == 0 {
                self.decoder.finish()?;
                debug!(bytes = self.bytes_in, "ring drained");
                return Ok(self.bytes_in);
            }
            trace!(read, "feeding ring chunk");
            self.bytes_in += read as u64;
            self.decoder.feed(&buf[..read], sink)?;
        }
    }
}

impl Default for StreamPump {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::RelayError;
    use protocol::{Packet, ProtocolError, SchedWakeup, TraceOn};

    fn encode(packets: &[Packet]) -> Vec<u8> {
        let mut bytes = Vec::new();
        for packet in packets {
            packet.encode(&mut bytes);
        }
        bytes
    }

    #[test]
    fn test_pump_reader_to_eof() {
        let packets = vec![
            Packet::TraceOn(TraceOn { tid: 10 }),
            Packet::SchedWakeup(SchedWakeup {
                timestamp_ns: 5,
                tid: 10,
                target_cpu: 0,
            }),
        ];
        let bytes = encode(&packets);

        let mut received = Vec::new();
        let mut pump = StreamPump::new();
        let consumed = pump
            .pump(&bytes[..], &mut |p: Packet| received.push(p))
            .unwrap();

        assert_eq!(consumed, bytes.len() as u64);
        assert_eq!(received, packets);
    }

    #[test]
    fn test_pump_truncated_stream_errors() {
        let bytes = encode(&[Packet::TraceOn(TraceOn { tid: 1 })]);
        let truncated = &bytes[..bytes.len() - 2];

        let mut pump = StreamPump::new();
        let err = pump.pump(truncated, &mut |_: Packet| {}).unwrap_err();
        assert!(matches!(
            err,
            RelayError::Protocol(ProtocolError::IncompleteStream(_))
        ));
    }
}
