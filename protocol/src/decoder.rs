// Copyright (C) 2025 Category Labs, Inc.
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License
// along with this program.  If not, see <http://www.gnu.org/licenses/>.

//! Frame reassembly over a stream of byte chunks of arbitrary size.

use tracing::trace;

use crate::{Packet, PacketType, ProtocolError, HEADER_SIZE, MAX_FRAME_SIZE, VERSION};

/// Receives fully reassembled packets in arrival order.
pub trait FrameSink {
    fn packet(&mut self, packet: Packet);
}

impl<F: FnMut(Packet)> FrameSink for F {
    fn packet(&mut self, packet: Packet) {
        self(packet)
    }
}

/// Stateful reassembler for one stream. Single-threaded per stream; the
/// caller serializes all feeds.
///
/// At most one partial frame is pending at a time. A protocol error is
/// fatal to the stream: the decoder cannot resynchronize on bytes of
/// unknown meaning, so the caller is expected to tear the connection down.
pub struct Decoder {
    partial: Vec<u8>,
}

impl Decoder {
    pub fn new() -> Self {
        Decoder {
            partial: Vec::with_capacity(MAX_FRAME_SIZE),
        }
    }

    /// Consume one chunk, dispatching every frame completed by it.
    ///
    /// Each loop iteration consumes at least one byte or dispatches a
    /// frame, so decoding is linear in bytes received. A frame wholly
    /// contained in `chunk` is dispatched straight out of it without
    /// touching the reassembly buffer.
    pub fn feed(
        &mut self,
        mut chunk: &[u8],
        sink: &mut impl FrameSink,
    ) -> Result<(), ProtocolError> {
        while !chunk.is_empty() {
            if self.partial.is_empty() {
                if chunk.len() < HEADER_SIZE {
                    self.partial.extend_from_slice(chunk);
                    break;
                }
                let frame_len = parse_header(chunk)?;
                if chunk.len() < frame_len {
                    self.partial.extend_from_slice(chunk);
                    break;
                }
                dispatch(&chunk[..frame_len], sink)?;
                chunk = &chunk[frame_len..];
            } else if self.partial.len() < HEADER_SIZE {
                let needed = HEADER_SIZE - self.partial.len();
                let take = needed.min(chunk.len());
                self.partial.extend_from_slice(&chunk[..take]);
                chunk = &chunk[take..];
                // Validate as soon as the header is whole, even if the
                // chunk ends here: a fatal header must not sit latent
                // until the next feed (or be masked as truncation at end
                // of stream).
                if self.partial.len() == HEADER_SIZE {
                    parse_header(&self.partial)?;
                }
            } else {
                let frame_len = parse_header(&self.partial)?;
                let missing = frame_len - self.partial.len();
                let take = missing.min(chunk.len());
                self.partial.extend_from_slice(&chunk[..take]);
                chunk = &chunk[take..];
                if self.partial.len() == frame_len {
                    dispatch(&self.partial, sink)?;
                    self.partial.clear();
                }
            }
        }
        Ok(())
    }

    /// Signal end of stream. A buffered partial frame is a truncation
    /// error, not something to discard silently.
    pub fn finish(&self) -> Result<(), ProtocolError> {
        if self.partial.is_empty() {
            Ok(())
        } else {
            Err(ProtocolError::IncompleteStream(self.partial.len()))
        }
    }

    /// Bytes of the pending partial frame, if any.
    pub fn pending(&self) -> usize {
        self.partial.len()
    }
}

impl Default for Decoder {
    fn default() -> Self {
        Self::new()
    }
}

/// Validate a complete header, returning the declared whole-frame length.
fn parse_header(header: &[u8]) -> Result<usize, ProtocolError> {
    debug_assert!(header.len() >= HEADER_SIZE);
    if header[0] != VERSION {
        return Err(ProtocolError::UnsupportedVersion(header[0]));
    }
    PacketType::from_u8(header[1])?;
    let total = u16::from_le_bytes([header[2], header[3]]);
    if (total as usize) < HEADER_SIZE || total as usize > MAX_FRAME_SIZE {
        return Err(ProtocolError::FrameLength(total));
    }
    Ok(total as usize)
}

fn dispatch(frame: &[u8], sink: &mut impl FrameSink) -> Result<(), ProtocolError> {
    let packet_type = PacketType::from_u8(frame[1])?;
    let packet = Packet::decode_payload(packet_type, &frame[HEADER_SIZE..])?;
    trace!(?packet_type, frame_len = frame.len(), "dispatching frame");
    sink.packet(packet);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{LostEvents, SchedSwitch, SchedWakeup, TraceOff, TraceOn};
    use rstest::*;

    fn sample_packets() -> Vec<Packet> {
        vec![
            Packet::TraceOn(TraceOn { tid: 901 }),
            Packet::SchedSwitch(SchedSwitch {
                timestamp_ns: 1_000_000,
                cpu: 0,
                out_tid: 901,
                in_tid: 902,
                syscall_nr: 202,
                voluntary: true,
            }),
            Packet::SchedWakeup(SchedWakeup {
                timestamp_ns: 1_000_500,
                tid: 901,
                target_cpu: 2,
            }),
            Packet::LostEvents(LostEvents { cpu: 1, count: 17 }),
            Packet::TraceOff(TraceOff { tid: 901 }),
        ]
    }

    fn encode_all(packets: &[Packet]) -> Vec<u8> {
        let mut bytes = Vec::new();
        for packet in packets {
            packet.encode(&mut bytes);
        }
        bytes
    }

    #[rstest]
    #[case(1)]
    #[case(2)]
    #[case(3)]
    #[case(5)]
    #[case(7)]
    #[case(64)]
    #[case(usize::MAX)]
    fn test_round_trip_any_chunking(#[case] chunk_size: usize) {
        let packets = sample_packets();
        let bytes = encode_all(&packets);

        let mut decoder = Decoder::new();
        let mut received = Vec::new();
        let mut sink = |packet: Packet| received.push(packet);

        for chunk in bytes.chunks(chunk_size.min(bytes.len())) {
            decoder.feed(chunk, &mut sink).unwrap();
        }
        decoder.finish().unwrap();

        assert_eq!(received, packets);
    }

    #[test]
    fn test_partial_header_then_payload_single_dispatch() {
        // Header split off first, payload arriving in two pieces: the
        // handler must fire exactly once, on the final feed.
        let packet = Packet::SchedWakeup(SchedWakeup {
            timestamp_ns: 42,
            tid: 7,
            target_cpu: 3,
        });
        let mut bytes = Vec::new();
        packet.encode(&mut bytes);
        assert_eq!(bytes.len(), 20);

        let mut decoder = Decoder::new();
        let mut fired = Vec::new();

        decoder.feed(&bytes[..4], &mut |p: Packet| fired.push(p)).unwrap();
        assert!(fired.is_empty());
        assert_eq!(decoder.pending(), 4);

        decoder.feed(&bytes[4..10], &mut |p: Packet| fired.push(p)).unwrap();
        assert!(fired.is_empty());

        decoder.feed(&bytes[10..], &mut |p: Packet| fired.push(p)).unwrap();
        assert_eq!(fired, vec![packet]);
        assert_eq!(decoder.pending(), 0);
    }

    #[test]
    fn test_header_split_mid_length_field() {
        let packet = Packet::TraceOn(TraceOn { tid: 1 });
        let mut bytes = Vec::new();
        packet.encode(&mut bytes);

        let mut decoder = Decoder::new();
        let mut fired = 0;
        let mut sink = |_: Packet| fired += 1;

        decoder.feed(&bytes[..3], &mut sink).unwrap();
        decoder.feed(&bytes[3..], &mut sink).unwrap();
        assert_eq!(fired, 1);
        decoder.finish().unwrap();
    }

    #[test]
    fn test_unknown_packet_type_is_fatal() {
        let frame = [VERSION, 0xEE, 8, 0, 0, 0, 0, 0];
        let mut decoder = Decoder::new();
        let err = decoder.feed(&frame, &mut |_: Packet| {}).unwrap_err();
        assert_eq!(err, ProtocolError::UnknownPacketType(0xEE));
    }

    #[test]
    fn test_version_mismatch_is_fatal() {
        let frame = [VERSION + 1, 0, 8, 0, 0, 0, 0, 0];
        let mut decoder = Decoder::new();
        let err = decoder.feed(&frame, &mut |_: Packet| {}).unwrap_err();
        assert_eq!(err, ProtocolError::UnsupportedVersion(VERSION + 1));
    }

    #[test]
    fn test_unknown_type_detected_in_reassembled_header() {
        let mut decoder = Decoder::new();
        decoder.feed(&[VERSION], &mut |_: Packet| {}).unwrap();
        let err = decoder
            .feed(&[0xEE, 8, 0], &mut |_: Packet| {})
            .unwrap_err();
        assert_eq!(err, ProtocolError::UnknownPacketType(0xEE));
    }

    #[test]
    fn test_fatal_header_completed_at_chunk_end_errors_immediately() {
        // The chunk ends exactly where the header becomes whole. The bad
        // type must be reported from this feed; were it deferred, a
        // stream ending here would misreport the error as truncation.
        let mut decoder = Decoder::new();
        decoder.feed(&[VERSION, 0xEE], &mut |_: Packet| {}).unwrap();
        let err = decoder.feed(&[8, 0], &mut |_: Packet| {}).unwrap_err();
        assert_eq!(err, ProtocolError::UnknownPacketType(0xEE));
    }

    #[rstest]
    #[case(0u16)]
    #[case(3u16)]
    #[case((MAX_FRAME_SIZE + 1) as u16)]
    fn test_bad_declared_length(#[case] total: u16) {
        let bytes = total.to_le_bytes();
        let frame = [VERSION, 0, bytes[0], bytes[1]];
        let mut decoder = Decoder::new();
        let err = decoder.feed(&frame, &mut |_: Packet| {}).unwrap_err();
        assert_eq!(err, ProtocolError::FrameLength(total));
    }

    #[test]
    fn test_truncated_stream_reported() {
        let packet = Packet::LostEvents(LostEvents { cpu: 0, count: 5 });
        let mut bytes = Vec::new();
        packet.encode(&mut bytes);

        let mut decoder = Decoder::new();
        decoder.feed(&bytes[..bytes.len() - 1], &mut |_: Packet| {}).unwrap();
        let err = decoder.finish().unwrap_err();
        assert_eq!(err, ProtocolError::IncompleteStream(bytes.len() - 1));
    }

    #[test]
    fn test_back_to_back_frames_in_one_chunk() {
        let packets = sample_packets();
        let bytes = encode_all(&packets);

        let mut decoder = Decoder::new();
        let mut received = Vec::new();
        decoder
            .feed(&bytes, &mut |p: Packet| received.push(p))
            .unwrap();
        assert_eq!(received, packets);
        assert_eq!(decoder.pending(), 0);
    }
}
