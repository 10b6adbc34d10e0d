//! Position Arithmetic and Upload Actions
//!
//! A [`Position`] tracks where the next chunk of journal data lands:
//! how many bytes the current part has accumulated, the running part index,
//! and the time-partition directory. [`advance`] computes the position
//! transition for a new payload and derives the [`Action`]s the consumer
//! must execute: starting objects, appending chunks, flushing parts, and
//! closing objects.
//!
//! Actions are persisted to the durable queue in a compact hand-framed
//! binary layout (tag byte, little-endian integers, length-prefixed fields)
//! so the consumer can reconstruct them after a crash. A payload that fails
//! to decode is surfaced as [`Action::Skip`] by the consumer, never written.
//!
//! ## Object keys
//!
//! `<directory>/<id>-<file_number, zero-padded to 6>.journal[.<suffix>]`
//!
//! where `file_number = part_index / max_parts_per_object`. The reverse
//! parse accepts any directory depth, so keys written under foreign
//! prefixes (other shards, other journals in the bucket) still parse.

use bytes::{BufMut, Bytes, BytesMut};
use once_cell::sync::Lazy;
use regex::Regex;

use crate::store::PartLimits;

/// Where the next chunk of journal data lands.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Position {
    /// Bytes already committed to the current open part
    pub part_bytes: u64,
    /// Part index, monotonically increasing within one directory
    pub part_index: u64,
    /// Time-partition directory, e.g. `2024/01/15`
    pub directory: String,
}

impl Position {
    pub fn new(part_bytes: u64, part_index: u64, directory: impl Into<String>) -> Self {
        Self {
            part_bytes,
            part_index,
            directory: directory.into(),
        }
    }

    /// The object this position's part belongs to.
    pub fn file_number(&self, limits: &PartLimits) -> u64 {
        self.part_index / limits.max_parts_per_object
    }

    /// 1-based part number within the object, per S3 convention.
    pub fn part_number(&self, limits: &PartLimits) -> u64 {
        self.part_index % limits.max_parts_per_object + 1
    }

    /// Part index of the first part of the object this position is in.
    pub fn first_part_of_object(&self, limits: &PartLimits) -> u64 {
        self.file_number(limits) * limits.max_parts_per_object
    }
}

/// One unit of work for the upload consumer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    /// Initiate a multipart upload for the object implied by the position
    Start(Position),
    /// Append a pending chunk to the current part of that object
    Append {
        position: Position,
        count: u64,
        payload: Bytes,
    },
    /// Flush the accumulated chunks of the current part as an S3 part
    Upload(Position),
    /// Complete (or abort) the multipart upload for the implied object
    End(Position),
    /// Close every open object
    Flush,
    /// Placeholder for a corrupted task
    Skip,
}

const TAG_START: u8 = 1;
const TAG_APPEND: u8 = 2;
const TAG_UPLOAD: u8 = 3;
const TAG_END: u8 = 4;
const TAG_FLUSH: u8 = 5;

impl Action {
    /// Serialize for the durable queue.
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::new();
        match self {
            Action::Start(position) => {
                buf.put_u8(TAG_START);
                encode_position(&mut buf, position);
            }
            Action::Append {
                position,
                count,
                payload,
            } => {
                buf.put_u8(TAG_APPEND);
                encode_position(&mut buf, position);
                buf.put_u64_le(*count);
                buf.put_u32_le(payload.len() as u32);
                buf.extend_from_slice(payload);
            }
            Action::Upload(position) => {
                buf.put_u8(TAG_UPLOAD);
                encode_position(&mut buf, position);
            }
            Action::End(position) => {
                buf.put_u8(TAG_END);
                encode_position(&mut buf, position);
            }
            Action::Flush => buf.put_u8(TAG_FLUSH),
            // Skip is a decoder artifact; persist it as an unknown tag so
            // it decodes back to a skip
            Action::Skip => buf.put_u8(0),
        }
        buf.freeze()
    }

    /// Deserialize a task payload. `None` means the payload is corrupt and
    /// the task should be skipped.
    pub fn decode(payload: &[u8]) -> Option<Action> {
        let mut reader = Reader(payload);
        let action = match reader.u8()? {
            TAG_START => Action::Start(decode_position(&mut reader)?),
            TAG_APPEND => {
                let position = decode_position(&mut reader)?;
                let count = reader.u64_le()?;
                let len = reader.u32_le()? as usize;
                let payload = Bytes::copy_from_slice(reader.bytes(len)?);
                Action::Append {
                    position,
                    count,
                    payload,
                }
            }
            TAG_UPLOAD => Action::Upload(decode_position(&mut reader)?),
            TAG_END => Action::End(decode_position(&mut reader)?),
            TAG_FLUSH => Action::Flush,
            _ => return None,
        };
        if !reader.0.is_empty() {
            return None;
        }
        Some(action)
    }
}

fn encode_position(buf: &mut BytesMut, position: &Position) {
    buf.put_u64_le(position.part_bytes);
    buf.put_u64_le(position.part_index);
    buf.put_u32_le(position.directory.len() as u32);
    buf.extend_from_slice(position.directory.as_bytes());
}

fn decode_position(reader: &mut Reader<'_>) -> Option<Position> {
    let part_bytes = reader.u64_le()?;
    let part_index = reader.u64_le()?;
    let len = reader.u32_le()? as usize;
    let directory = std::str::from_utf8(reader.bytes(len)?).ok()?.to_string();
    Some(Position {
        part_bytes,
        part_index,
        directory,
    })
}

/// Bounds-checked cursor over a task payload.
struct Reader<'a>(&'a [u8]);

impl<'a> Reader<'a> {
    fn bytes(&mut self, n: usize) -> Option<&'a [u8]> {
        if self.0.len() < n {
            return None;
        }
        let (head, tail) = self.0.split_at(n);
        self.0 = tail;
        Some(head)
    }

    fn u8(&mut self) -> Option<u8> {
        self.bytes(1).map(|b| b[0])
    }

    fn u32_le(&mut self) -> Option<u32> {
        self.bytes(4).map(|b| u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    fn u64_le(&mut self) -> Option<u64> {
        self.bytes(8).map(|b| {
            u64::from_le_bytes([b[0], b[1], b[2], b[3], b[4], b[5], b[6], b[7]])
        })
    }
}

/// Compute the position transition for a payload of `size` bytes arriving
/// while the clock renders `directory_now`.
///
/// Returns the new position and the actions to enqueue, in derivation
/// order. The caller is responsible for the queue emission order: `Start`
/// actions go in first, then the `Append` for the payload itself, then the
/// remaining `Upload`/`End` actions, so the consumer always sees an object's
/// `Start` before any reference to it and the chunk before the `Upload`
/// that flushes it.
pub fn advance(
    position: &Position,
    directory_now: &str,
    size: u64,
    limits: &PartLimits,
) -> (Position, Vec<Action>) {
    // Directory rollover: close the old object, open part 0 of a fresh one
    if directory_now != position.directory {
        let next = Position::new(size, 0, directory_now);
        let actions = vec![Action::End(position.clone()), Action::Start(next.clone())];
        return (next, actions);
    }

    let (part_bytes, part_index) = if position.part_bytes > limits.min_part_size {
        (size, position.part_index + 1)
    } else {
        (position.part_bytes + size, position.part_index)
    };
    let next = Position::new(part_bytes, part_index, position.directory.clone());

    let mut actions = Vec::new();
    if part_index != position.part_index && part_index % limits.max_parts_per_object == 0 {
        // Crossed an object boundary
        actions.push(Action::End(position.clone()));
        actions.push(Action::Start(next.clone()));
    }
    if part_bytes > limits.min_part_size {
        actions.push(Action::Upload(next.clone()));
    }

    (next, actions)
}

static KEY_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^(.*)/([^/]+)-(\d+)\.journal(?:\.[^/.]+)?$")
        .expect("object key regex is valid")
});

/// A key parsed back into its components.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedKey {
    pub directory: String,
    pub id: String,
    pub file_number: u64,
}

/// Render the object key for `file_number` of journal `id` under `directory`.
pub fn object_key(directory: &str, id: &str, file_number: u64, suffix: Option<&str>) -> String {
    match suffix {
        Some(suffix) => format!("{directory}/{id}-{file_number:06}.journal.{suffix}"),
        None => format!("{directory}/{id}-{file_number:06}.journal"),
    }
}

/// Reverse-parse an object key. Returns `None` for keys that were not
/// written by a journal.
pub fn parse_object_key(key: &str) -> Option<ParsedKey> {
    let captures = KEY_RE.captures(key)?;
    Some(ParsedKey {
        directory: captures[1].to_string(),
        id: captures[2].to_string(),
        file_number: captures[3].parse().ok()?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn limits(min: u64, parts: u64) -> PartLimits {
        PartLimits {
            min_part_size: min,
            max_part_size: 1 << 30,
            max_parts_per_object: parts,
        }
    }

    #[test]
    fn test_accumulates_below_threshold() {
        let limits = limits(16, 4);
        let p = Position::new(0, 0, "2024/01/15");

        let (next, actions) = advance(&p, "2024/01/15", 10, &limits);
        assert_eq!(next, Position::new(10, 0, "2024/01/15"));
        assert!(actions.is_empty());
    }

    #[test]
    fn test_upload_once_threshold_crossed() {
        let limits = limits(16, 4);
        let p = Position::new(10, 0, "2024/01/15");

        let (next, actions) = advance(&p, "2024/01/15", 10, &limits);
        assert_eq!(next, Position::new(20, 0, "2024/01/15"));
        assert_eq!(actions, vec![Action::Upload(next.clone())]);
    }

    #[test]
    fn test_part_advances_after_flush() {
        let limits = limits(16, 4);
        // Previous payload pushed part 0 over the threshold
        let p = Position::new(20, 0, "2024/01/15");

        let (next, actions) = advance(&p, "2024/01/15", 5, &limits);
        assert_eq!(next, Position::new(5, 1, "2024/01/15"));
        assert!(actions.is_empty());
    }

    #[test]
    fn test_object_rollover_emits_end_then_start() {
        let limits = limits(16, 4);
        // Part 3 is the last slot of object 0; it is over the threshold
        let p = Position::new(20, 3, "2024/01/15");

        let (next, actions) = advance(&p, "2024/01/15", 5, &limits);
        assert_eq!(next, Position::new(5, 4, "2024/01/15"));
        assert_eq!(
            actions,
            vec![Action::End(p.clone()), Action::Start(next.clone())]
        );
    }

    #[test]
    fn test_object_rollover_with_oversized_payload() {
        let limits = limits(16, 4);
        let p = Position::new(20, 3, "2024/01/15");

        let (next, actions) = advance(&p, "2024/01/15", 30, &limits);
        assert_eq!(next, Position::new(30, 4, "2024/01/15"));
        assert_eq!(
            actions,
            vec![
                Action::End(p.clone()),
                Action::Start(next.clone()),
                Action::Upload(next.clone()),
            ]
        );
    }

    #[test]
    fn test_directory_rollover_resets_part_index() {
        let limits = limits(16, 4);
        let p = Position::new(10, 7, "2024/01/15");

        let (next, actions) = advance(&p, "2024/01/16", 5, &limits);
        assert_eq!(next, Position::new(5, 0, "2024/01/16"));
        assert_eq!(
            actions,
            vec![Action::End(p.clone()), Action::Start(next.clone())]
        );
    }

    #[test]
    fn test_three_uploads_within_one_object() {
        // Drives the S2 shape: three threshold crossings, one object
        let limits = limits(16, 100);
        let mut p = Position::new(0, 0, "d");
        let mut uploads = Vec::new();

        for _ in 0..6 {
            let (next, actions) = advance(&p, "d", 10, &limits);
            for action in actions {
                if let Action::Upload(position) = action {
                    uploads.push(position);
                }
            }
            p = next;
        }

        assert_eq!(uploads.len(), 3);
        assert_eq!(
            uploads.iter().map(|u| u.part_number(&limits)).collect::<Vec<_>>(),
            vec![1, 2, 3]
        );
    }

    #[test]
    fn test_derived_object_coordinates() {
        let limits = limits(16, 4);
        let p = Position::new(0, 9, "d");
        assert_eq!(p.file_number(&limits), 2);
        assert_eq!(p.part_number(&limits), 2);
        assert_eq!(p.first_part_of_object(&limits), 8);
    }

    #[test]
    fn test_object_key_format() {
        assert_eq!(
            object_key("2024/01/15", "host-a", 0, None),
            "2024/01/15/host-a-000000.journal"
        );
        assert_eq!(
            object_key("p/2024/01/15", "host-a", 12, Some("gz")),
            "p/2024/01/15/host-a-000012.journal.gz"
        );
    }

    #[test]
    fn test_key_roundtrip_preserves_position() {
        let limits = limits(16, 4);
        let p = Position::new(3, 9, "a/2024/01/15");

        let key = object_key(&p.directory, "host-1", p.file_number(&limits), Some("gz"));
        let parsed = parse_object_key(&key).unwrap();

        assert_eq!(parsed.directory, p.directory);
        assert_eq!(parsed.id, "host-1");
        // part_index is preserved modulo object rounding
        assert_eq!(
            parsed.file_number * limits.max_parts_per_object,
            p.first_part_of_object(&limits)
        );
    }

    #[test]
    fn test_parse_rejects_foreign_keys() {
        assert!(parse_object_key("random/file.txt").is_none());
        assert!(parse_object_key("nojournalsuffix-000001.data").is_none());
        assert!(parse_object_key("2024/01/15/host-xyz.journal").is_none());
    }

    #[test]
    fn test_parse_accepts_ids_with_dashes() {
        let parsed = parse_object_key("2024/01/15/my-host-01-000004.journal.gz").unwrap();
        assert_eq!(parsed.id, "my-host-01");
        assert_eq!(parsed.file_number, 4);
        assert_eq!(parsed.directory, "2024/01/15");
    }

    #[test]
    fn test_action_codec_roundtrip() {
        let actions = vec![
            Action::Start(Position::new(0, 4, "2024/01/15")),
            Action::Append {
                position: Position::new(12, 4, "2024/01/15"),
                count: 3,
                payload: Bytes::from("abc\ndef\n"),
            },
            Action::Upload(Position::new(20, 4, "2024/01/15")),
            Action::End(Position::new(0, 4, "2024/01/15")),
            Action::Flush,
        ];

        for action in actions {
            let encoded = action.encode();
            assert_eq!(Action::decode(&encoded), Some(action));
        }
    }

    #[test]
    fn test_decode_rejects_corrupt_payloads() {
        assert_eq!(Action::decode(&[]), None);
        assert_eq!(Action::decode(&[99]), None);
        // Truncated append
        let encoded = Action::Append {
            position: Position::new(1, 2, "d"),
            count: 1,
            payload: Bytes::from("xyz"),
        }
        .encode();
        assert_eq!(Action::decode(&encoded[..encoded.len() - 1]), None);
        // Trailing garbage
        let mut extended = encoded.to_vec();
        extended.push(0);
        assert_eq!(Action::decode(&extended), None);
    }
}
