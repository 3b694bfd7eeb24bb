//! Expected response shapes.
//!
//! Every console command answers with a fixed sequence of bytes, which is
//! described by a small format string, e.g. `<ACK>6<CRC>` for an ACK byte,
//! followed by 6 data bytes and a 2 byte checksum. The format is compiled
//! into an [`AnswerFormat`], which knows how many bytes to wait for and how to
//! validate them.
//!
//! Tokens, matched left to right:
//!
//! | token                | bytes | meaning                                  |
//! |----------------------|-------|------------------------------------------|
//! | `<ACK>`              | 1     | must be `0x06`                           |
//! | `<LF><CR>OK<LF><CR>` | 6     | literal `\n\rOK\n\r`                     |
//! | `<LF><CR>`           | 2     | literal `\n\r`                           |
//! | `<CRC>`              | 2     | big-endian CRC of the preceding data     |
//! | `N` (decimal)        | N     | raw data bytes                           |

use std::{
    fmt::{
        self,
        Display,
    },
    str::FromStr,
};

use bytes::{
    Bytes,
    BytesMut,
};

use crate::{
    command::ACK,
    crc::crc16,
};

const TOKEN_ACK: &str = "<ACK>";
const TOKEN_OK: &str = "<LF><CR>OK<LF><CR>";
const TOKEN_LF_CR: &str = "<LF><CR>";
const TOKEN_CRC: &str = "<CRC>";

const LITERAL_OK: &[u8] = b"\n\rOK\n\r";
const LITERAL_LF_CR: &[u8] = b"\n\r";

/// One part of an expected answer.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Segment {
    /// A single `0x06` byte.
    Ack,
    /// Bytes that must match exactly.
    Literal(&'static [u8]),
    /// Raw payload bytes.
    Data(usize),
    /// Big-endian CRC over the data bytes since the previous CRC.
    Crc,
}

impl Segment {
    pub fn len(&self) -> usize {
        match self {
            Segment::Ack => 1,
            Segment::Literal(bytes) => bytes.len(),
            Segment::Data(length) => *length,
            Segment::Crc => 2,
        }
    }
}

/// A compiled answer format.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AnswerFormat {
    format: String,
    segments: Vec<Segment>,
    total_length: usize,
    data_length: usize,
    expects_crc: bool,
}

impl AnswerFormat {
    /// Compiles a format string.
    pub fn compile(format: &str) -> Result<Self, InvalidFormat> {
        let mut segments = vec![];
        let mut total_length = 0usize;
        let mut rest = format;

        while !rest.is_empty() {
            let position = format.len() - rest.len();

            let (segment, consumed) = if rest.starts_with(TOKEN_ACK) {
                (Segment::Ack, TOKEN_ACK.len())
            }
            else if rest.starts_with(TOKEN_OK) {
                (Segment::Literal(LITERAL_OK), TOKEN_OK.len())
            }
            else if rest.starts_with(TOKEN_LF_CR) {
                (Segment::Literal(LITERAL_LF_CR), TOKEN_LF_CR.len())
            }
            else if rest.starts_with(TOKEN_CRC) {
                (Segment::Crc, TOKEN_CRC.len())
            }
            else {
                let digits = rest
                    .find(|c: char| !c.is_ascii_digit())
                    .unwrap_or(rest.len());
                let length = rest[..digits]
                    .parse::<usize>()
                    .ok()
                    .filter(|length| *length > 0)
                    .ok_or_else(|| {
                        InvalidFormat {
                            format: format.to_owned(),
                            position,
                        }
                    })?;
                (Segment::Data(length), digits)
            };

            total_length = total_length.checked_add(segment.len()).ok_or_else(|| {
                InvalidFormat {
                    format: format.to_owned(),
                    position,
                }
            })?;
            segments.push(segment);
            rest = &rest[consumed..];
        }

        // bounded by `total_length`, so this can't overflow
        let data_length = segments
            .iter()
            .filter_map(|segment| {
                match segment {
                    Segment::Data(length) => Some(*length),
                    _ => None,
                }
            })
            .sum();
        let expects_crc = segments.contains(&Segment::Crc);

        Ok(Self {
            format: format.to_owned(),
            segments,
            total_length,
            data_length,
            expects_crc,
        })
    }

    pub fn segments(&self) -> &[Segment] {
        &self.segments
    }

    /// Number of bytes the full answer consists of.
    pub fn total_length(&self) -> usize {
        self.total_length
    }

    /// Number of payload bytes, i.e. the bytes covered by the CRC.
    pub fn data_length(&self) -> usize {
        self.data_length
    }

    pub fn expects_crc(&self) -> bool {
        self.expects_crc
    }

    /// Validates a complete answer and returns its payload.
    ///
    /// Segments are checked strictly in order. Nothing is validated until
    /// `buffer` holds at least [`total_length`](Self::total_length) bytes.
    pub fn validate(&self, buffer: &[u8]) -> Result<Bytes, FrameError> {
        if buffer.len() < self.total_length {
            return Err(FrameError::Incomplete {
                expected: self.total_length,
                received: buffer.len(),
            });
        }

        let mut payload = BytesMut::with_capacity(self.data_length);
        let mut crc_start = 0;
        let mut offset = 0;

        for segment in &self.segments {
            let bytes = &buffer[offset..offset + segment.len()];

            match segment {
                Segment::Ack => {
                    if bytes[0] != ACK {
                        return Err(FrameError::Mismatch {
                            offset,
                            expected: vec![ACK],
                            actual: bytes.to_vec(),
                        });
                    }
                }
                Segment::Literal(expected) => {
                    if bytes != *expected {
                        return Err(FrameError::Mismatch {
                            offset,
                            expected: expected.to_vec(),
                            actual: bytes.to_vec(),
                        });
                    }
                }
                Segment::Data(_) => {
                    payload.extend_from_slice(bytes);
                }
                Segment::Crc => {
                    let received = u16::from_be_bytes([bytes[0], bytes[1]]);
                    let calculated = crc16(&payload[crc_start..]);
                    if received != calculated {
                        return Err(FrameError::Crc {
                            received,
                            calculated,
                        });
                    }
                    crc_start = payload.len();
                }
            }

            offset += segment.len();
        }

        Ok(payload.freeze())
    }
}

impl FromStr for AnswerFormat {
    type Err = InvalidFormat;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::compile(s)
    }
}

impl Display for AnswerFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.format)
    }
}

/// The format string contains something that is not a token.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
#[error("invalid answer format {format:?} at position {position}")]
pub struct InvalidFormat {
    pub format: String,
    pub position: usize,
}

/// A received answer doesn't match its format.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum FrameError {
    #[error("answer incomplete: {received} of {expected} bytes")]
    Incomplete { expected: usize, received: usize },

    #[error(
        "unexpected bytes at offset {offset}: expected {}, got {}",
        hex::encode(expected),
        hex::encode(actual)
    )]
    Mismatch {
        offset: usize,
        expected: Vec<u8>,
        actual: Vec<u8>,
    },

    #[error("crc mismatch: received {received:04x}, calculated {calculated:04x}")]
    Crc { received: u16, calculated: u16 },
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crc::with_crc;

    #[test]
    fn it_compiles_ack_data_crc() {
        let format = AnswerFormat::compile("<ACK>6<CRC>").unwrap();
        assert_eq!(
            format.segments(),
            &[Segment::Ack, Segment::Data(6), Segment::Crc]
        );
        assert_eq!(format.total_length(), 9);
        assert_eq!(format.data_length(), 6);
        assert!(format.expects_crc());
    }

    #[test]
    fn it_prefers_the_ok_literal() {
        let format = AnswerFormat::compile("<LF><CR>OK<LF><CR>").unwrap();
        assert_eq!(format.segments(), &[Segment::Literal(LITERAL_OK)]);
        assert_eq!(format.total_length(), 6);
        assert!(!format.expects_crc());

        let format = AnswerFormat::compile("<LF><CR>").unwrap();
        assert_eq!(format.segments(), &[Segment::Literal(LITERAL_LF_CR)]);
    }

    #[test]
    fn it_reads_multi_digit_lengths() {
        let format = AnswerFormat::compile("<ACK>97<CRC>").unwrap();
        assert_eq!(format.total_length(), 100);
        assert_eq!(format.data_length(), 97);

        let format = AnswerFormat::compile("265<CRC>").unwrap();
        assert_eq!(format.total_length(), 267);
    }

    #[test]
    fn total_length_is_the_sum_of_segments() {
        for format in [
            "",
            "<ACK>",
            "<ACK>4<CRC>",
            "<LF><CR>OK<LF><CR>12<LF><CR>",
            "3<CRC>5<CRC>",
        ] {
            let compiled = AnswerFormat::compile(format).unwrap();
            let sum: usize = compiled.segments().iter().map(Segment::len).sum();
            assert_eq!(compiled.total_length(), sum);
            assert_eq!(compiled, AnswerFormat::compile(format).unwrap());
        }
    }

    #[test]
    fn it_rejects_unknown_tokens() {
        let error = AnswerFormat::compile("<ACK><NAK>").unwrap_err();
        assert_eq!(error.position, 5);

        let error = AnswerFormat::compile("OK").unwrap_err();
        assert_eq!(error.position, 0);

        assert!(AnswerFormat::compile("<ACK>0").is_err());
    }

    #[test]
    fn it_rejects_lengths_that_overflow() {
        let error = AnswerFormat::compile("18446744073709551615<CRC>").unwrap_err();
        assert_eq!(error.position, 20);

        let error = AnswerFormat::compile("<ACK>18446744073709551615").unwrap_err();
        assert_eq!(error.position, 5);
    }

    #[test]
    fn it_returns_the_payload() {
        let format = AnswerFormat::compile("<ACK>6<CRC>").unwrap();
        let mut answer = vec![ACK];
        answer.extend(with_crc(&[30, 58, 9, 27, 10, 123]));

        let payload = format.validate(&answer).unwrap();
        assert_eq!(&payload[..], &[30, 58, 9, 27, 10, 123]);
    }

    #[test]
    fn it_does_not_validate_partial_answers() {
        let format = AnswerFormat::compile("<ACK>6<CRC>").unwrap();
        // the first byte is wrong, but there aren't enough bytes yet
        assert_eq!(
            format.validate(&[0x15, 1, 2]),
            Err(FrameError::Incomplete {
                expected: 9,
                received: 3
            })
        );
    }

    #[test]
    fn it_detects_a_missing_ack() {
        let format = AnswerFormat::compile("<ACK>2").unwrap();
        assert_eq!(
            format.validate(&[0x21, 1, 2]),
            Err(FrameError::Mismatch {
                offset: 0,
                expected: vec![0x06],
                actual: vec![0x21],
            })
        );
    }

    #[test]
    fn it_detects_literal_mismatches() {
        let format = AnswerFormat::compile("<ACK><LF><CR>").unwrap();
        let error = format.validate(&[0x06, b'\n', b'\n']).unwrap_err();
        assert!(matches!(error, FrameError::Mismatch { offset: 1, .. }));
    }

    #[test]
    fn it_detects_crc_errors() {
        let format = AnswerFormat::compile("<ACK>6<CRC>").unwrap();
        let answer = [ACK, 30, 58, 9, 27, 10, 123, 0, 0];
        assert_eq!(
            format.validate(&answer),
            Err(FrameError::Crc {
                received: 0,
                calculated: 0xb0b5,
            })
        );
    }
}
