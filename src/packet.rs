//! Frame codec for the Loke download protocol
//!
//! Every exchange on the bulk pipe is framed. Outbound control frames are
//! 1024 bytes: a command family word, a request word and up to a handful of
//! operand words, zero-padded to the full frame. Inbound acknowledgements
//! are 8 bytes: the family code echoed back plus one value word. File data
//! itself travels unframed — uploads as zero-padded 128 KiB parts, downloads
//! as raw payloads of at most 500 bytes.
//!
//! All multi-byte integers on the wire are little-endian.

use byteorder::{ByteOrder, LittleEndian};

use crate::error::{Error, Result};

/// Encoded size of every outbound control frame.
pub const CONTROL_FRAME_LEN: usize = 1024;

/// Encoded size of every inbound acknowledgement frame.
pub const RESPONSE_FRAME_LEN: usize = 8;

/// Payload size of one uploaded file part.
pub const FILE_PART_LEN: usize = 131_072;

/// Largest payload of one downloaded (PIT or dump) part. Downloads are
/// variable-length: the final part of a transfer may be shorter.
pub const RECEIVE_PART_LEN: usize = 500;

/// Most file parts one flash sequence may carry.
pub const MAX_SEQUENCE_LEN: usize = 800;

const FAMILY_FILE_PART: u32 = 0x00;
const FAMILY_SESSION: u32 = 0x64;
const FAMILY_PIT: u32 = 0x65;
const FAMILY_FILE: u32 = 0x66;
const FAMILY_END_SESSION: u32 = 0x67;

const REQUEST_FLASH: u32 = 0;
const REQUEST_DUMP: u32 = 1;
const REQUEST_PART: u32 = 2;
const REQUEST_END: u32 = 3;

/// One outbound control frame.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum Command {
    /// Open a session.
    BeginSession,
    /// Query the device-type code.
    DeviceInfo,
    /// Close the session.
    EndSession,
    /// Ask the device to reboot (only valid after [`Command::EndSession`]).
    RebootDevice,
    /// Announce a partition-table upload.
    BeginPitFlash,
    /// Announce a partition-table download.
    BeginPitDump,
    /// Declare the size of the partition table about to be sent.
    FlashPitPart { file_size: u32 },
    /// Request one part of the partition table being downloaded.
    DumpPitPart { index: u32 },
    /// Finish a partition-table upload.
    EndPitUpload { file_size: u32 },
    /// Finish a partition-table download.
    EndPitDump,
    /// Announce a file upload.
    BeginFileFlash,
    /// Declare the next upload sequence. `packet_count` is twice the number
    /// of parts the sequence will carry.
    BeginSequence { packet_count: u32 },
    /// Commit an uploaded sequence to a phone partition.
    EndPhoneTransfer {
        /// Length of the trailing partial part, 0 if the last part was full.
        partial_len: u32,
        /// Twice the number of full parts in the sequence.
        last_full_index: u32,
        /// Partition identifier from the device's partition table.
        file_id: u32,
        /// Whether this was the file's final sequence.
        last_sequence: bool,
    },
    /// Commit an uploaded sequence to the modem.
    EndModemTransfer {
        partial_len: u32,
        last_full_index: u32,
        last_sequence: bool,
    },
    /// Start a raw chip dump.
    BeginDump { chip_type: u32, chip_id: u32 },
    /// Request one part of the running dump.
    DumpPart { index: u32 },
    /// Finish a file transfer or dump.
    EndFileTransfer,
}

impl Command {
    /// Encode into a full zero-padded control frame.
    pub fn encode(&self) -> [u8; CONTROL_FRAME_LEN] {
        let mut words = [0u32; 9];
        let used = self.pack(&mut words);

        let mut frame = [0u8; CONTROL_FRAME_LEN];
        for (i, word) in words[..used].iter().enumerate() {
            LittleEndian::write_u32(&mut frame[i * 4..i * 4 + 4], *word);
        }
        frame
    }

    fn pack(&self, words: &mut [u32; 9]) -> usize {
        fn fill(words: &mut [u32; 9], values: &[u32]) -> usize {
            words[..values.len()].copy_from_slice(values);
            values.len()
        }

        match *self {
            Command::BeginSession => fill(words, &[FAMILY_SESSION, 0]),
            Command::DeviceInfo => fill(words, &[FAMILY_SESSION, 1]),
            Command::EndSession => fill(words, &[FAMILY_END_SESSION, 0]),
            Command::RebootDevice => fill(words, &[FAMILY_END_SESSION, 1]),
            Command::BeginPitFlash => fill(words, &[FAMILY_PIT, REQUEST_FLASH]),
            Command::BeginPitDump => fill(words, &[FAMILY_PIT, REQUEST_DUMP]),
            Command::FlashPitPart { file_size } => {
                fill(words, &[FAMILY_PIT, REQUEST_PART, file_size])
            }
            Command::DumpPitPart { index } => fill(words, &[FAMILY_PIT, REQUEST_PART, index]),
            Command::EndPitUpload { file_size } => {
                fill(words, &[FAMILY_PIT, REQUEST_END, file_size])
            }
            Command::EndPitDump => fill(words, &[FAMILY_PIT, REQUEST_END]),
            Command::BeginFileFlash => fill(words, &[FAMILY_FILE, REQUEST_FLASH]),
            Command::BeginSequence { packet_count } => {
                fill(words, &[FAMILY_FILE, REQUEST_PART, 0, packet_count])
            }
            Command::EndPhoneTransfer {
                partial_len,
                last_full_index,
                file_id,
                last_sequence,
            } => fill(
                words,
                &[
                    FAMILY_FILE,
                    REQUEST_END,
                    crate::types::Destination::Phone.code(),
                    partial_len,
                    last_full_index,
                    0,
                    0,
                    file_id,
                    last_sequence as u32,
                ],
            ),
            Command::EndModemTransfer {
                partial_len,
                last_full_index,
                last_sequence,
            } => fill(
                words,
                &[
                    FAMILY_FILE,
                    REQUEST_END,
                    crate::types::Destination::Modem.code(),
                    partial_len,
                    last_full_index,
                    0,
                    0,
                    last_sequence as u32,
                ],
            ),
            Command::BeginDump { chip_type, chip_id } => {
                fill(words, &[FAMILY_FILE, REQUEST_DUMP, chip_type, chip_id])
            }
            Command::DumpPart { index } => fill(words, &[FAMILY_FILE, REQUEST_PART, index]),
            Command::EndFileTransfer => fill(words, &[FAMILY_FILE, REQUEST_END]),
        }
    }
}

/// Inbound frame families an operation may wait for.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum ResponseKind {
    /// Acknowledgement of one uploaded file part, echoing its index.
    FilePart,
    Session,
    Pit,
    FileTransfer,
    EndSession,
}

impl ResponseKind {
    pub fn code(self) -> u32 {
        match self {
            ResponseKind::FilePart => FAMILY_FILE_PART,
            ResponseKind::Session => FAMILY_SESSION,
            ResponseKind::Pit => FAMILY_PIT,
            ResponseKind::FileTransfer => FAMILY_FILE,
            ResponseKind::EndSession => FAMILY_END_SESSION,
        }
    }
}

/// One decoded acknowledgement frame.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct Response {
    pub kind: ResponseKind,
    /// Second frame word; its meaning depends on the exchange (file size,
    /// dump size, part index, device type, opaque status).
    pub value: u32,
}

impl Response {
    /// Decode `frame`, requiring its family code to match `expected`.
    ///
    /// A mismatch is a protocol violation: it fails the current operation
    /// but carries both codes so the caller can report what actually
    /// arrived.
    pub fn decode(expected: ResponseKind, frame: &[u8; RESPONSE_FRAME_LEN]) -> Result<Response> {
        let received = LittleEndian::read_u32(&frame[0..4]);
        if received != expected.code() {
            return Err(Error::UnexpectedResponse {
                expected: expected.code(),
                received,
            });
        }
        Ok(Response {
            kind: expected,
            value: LittleEndian::read_u32(&frame[4..8]),
        })
    }
}
