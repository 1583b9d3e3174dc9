use crate::command::Command;
use crate::{Error, LogIndex, Result, Term};
use serde::{Deserialize, Serialize};
use std::io::{Read, Write};

/// Discriminator written ahead of every encoded command. Non-zero so that
/// leading null-byte padding is distinguishable from the payload itself.
const COMMAND_FORMAT_V1: u8 = 0x01;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EntryKind {
    Command,
    Membership,
    Noop,
}

/// Immutable record in the replicated log. `payload` is opaque to the
/// consensus engine; only the applier decodes it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogEntry {
    pub index: LogIndex,
    pub term: Term,
    pub kind: EntryKind,
    pub payload: Vec<u8>,
}

impl LogEntry {
    pub fn noop(index: LogIndex, term: Term) -> LogEntry {
        LogEntry {
            index,
            term,
            kind: EntryKind::Noop,
            payload: Vec::new(),
        }
    }

    pub fn command(index: LogIndex, term: Term, payload: Vec<u8>) -> LogEntry {
        LogEntry {
            index,
            term,
            kind: EntryKind::Command,
            payload,
        }
    }
}

pub fn encode_command(command: &Command) -> Result<Vec<u8>> {
    let mut out = vec![COMMAND_FORMAT_V1];
    bincode::serialize_into(&mut out, command)?;
    Ok(out)
}

/// Decode a command payload, skipping any leading null-byte padding. The
/// padding is a known framing artifact and never an error by itself; an
/// undecodable remainder is.
pub fn decode_command(payload: &[u8]) -> Result<Command> {
    let start = payload.iter().position(|b| *b != 0).ok_or_else(|| {
        Error::CorruptLogEntry {
            index: 0,
            reason: "payload is empty or all padding".into(),
        }
    })?;
    let payload = &payload[start..];
    match payload[0] {
        COMMAND_FORMAT_V1 => Ok(bincode::deserialize(&payload[1..])?),
        other => Err(Error::CorruptLogEntry {
            index: 0,
            reason: format!("unknown command format tag {other:#04x}"),
        }),
    }
}

/// LZ4 frame compression used for blobs and snapshots. Streaming on both
/// sides; nothing here buffers the full uncompressed image.
pub fn compress_into<W: Write>(writer: W) -> lz4_flex::frame::FrameEncoder<W> {
    lz4_flex::frame::FrameEncoder::new(writer)
}

pub fn decompress_from<R: Read>(reader: R) -> lz4_flex::frame::FrameDecoder<R> {
    lz4_flex::frame::FrameDecoder::new(reader)
}

pub fn compress_bytes(input: &[u8]) -> Result<Vec<u8>> {
    let mut encoder = compress_into(Vec::new());
    encoder.write_all(input)?;
    encoder
        .finish()
        .map_err(|e| Error::Durability {
            reason: format!("lz4 frame finish: {e}"),
        })
}

pub fn decompress_bytes(input: &[u8]) -> Result<Vec<u8>> {
    let mut decoder = decompress_from(input);
    let mut out = Vec::new();
    decoder.read_to_end(&mut out)?;
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::Mutation;
    use crate::model::ValueType;
    use chrono::Utc;
    use proptest::prelude::*;

    fn sample_command() -> Command {
        Command::Batch(vec![
            Mutation::SetConfig {
                namespace: "prod".into(),
                key: "timeout".into(),
                value: b"5s".to_vec(),
                value_type: ValueType::String,
                author: "alice".into(),
                timestamp: Utc::now(),
            },
            Mutation::DeleteConfig {
                namespace: "prod".into(),
                key: "retries".into(),
                author: "bob".into(),
                timestamp: Utc::now(),
            },
            Mutation::SetConfigBlobRef {
                namespace: "big".into(),
                key: "bundle".into(),
                blob_id: "ab".repeat(32),
                value_type: ValueType::Binary,
                author: "carol".into(),
                timestamp: Utc::now(),
            },
        ])
    }

    #[test]
    fn command_round_trips_through_batch_nesting() {
        let command = sample_command();
        let encoded = encode_command(&command).unwrap();
        assert_eq!(decode_command(&encoded).unwrap(), command);
    }

    #[test]
    fn decode_skips_leading_null_padding() {
        let command = sample_command();
        let encoded = encode_command(&command).unwrap();
        for padding in [1usize, 7, 512] {
            let mut padded = vec![0u8; padding];
            padded.extend_from_slice(&encoded);
            assert_eq!(decode_command(&padded).unwrap(), command);
        }
    }

    #[test]
    fn all_zero_payload_is_corrupt() {
        assert!(decode_command(&[0u8; 64]).is_err());
        assert!(decode_command(&[]).is_err());
    }

    #[test]
    fn unknown_format_tag_is_corrupt() {
        let err = decode_command(&[0x7f, 1, 2, 3]).unwrap_err();
        assert!(matches!(err, Error::CorruptLogEntry { .. }));
    }

    #[test]
    fn lz4_round_trip() {
        let input: Vec<u8> = (0..100_000u32).flat_map(|i| i.to_le_bytes()).collect();
        let compressed = compress_bytes(&input).unwrap();
        assert!(compressed.len() < input.len());
        assert_eq!(decompress_bytes(&compressed).unwrap(), input);
    }

    proptest! {
        #[test]
        fn padded_decode_matches_unpadded(padding in 0usize..64, value in proptest::collection::vec(any::<u8>(), 0..512)) {
            let command = Command::Single(Mutation::SetConfig {
                namespace: "ns".into(),
                key: "k".into(),
                value,
                value_type: ValueType::Binary,
                author: "prop".into(),
                timestamp: Utc::now(),
            });
            let encoded = encode_command(&command).unwrap();
            let mut padded = vec![0u8; padding];
            padded.extend_from_slice(&encoded);
            prop_assert_eq!(decode_command(&padded).unwrap(), command);
        }
    }
}
