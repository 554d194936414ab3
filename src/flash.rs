//! Transfer engine: partition-table exchange, file upload, raw dumps
//!
//! Every operation is a strict ping-pong: one outbound frame, then its typed
//! acknowledgement, before anything else goes out. Uploads are chunked into
//! sequences of at most [`MAX_SEQUENCE_LEN`] parts; the device acknowledges
//! every part with its index and commits each sequence to flash when the
//! sequence-end frame arrives, which can take tens of seconds.

use std::io::{Read, Seek, SeekFrom, Write};
use std::time::Duration;

use log::{debug, info, warn};

use crate::bridge::Bridge;
use crate::error::{Error, Result};
use crate::packet::{
    Command, ResponseKind, FILE_PART_LEN, MAX_SEQUENCE_LEN, RECEIVE_PART_LEN,
};
use crate::session::{exchange, exchange_timeout, receive_response, Session, EXCHANGE_TIMEOUT};
use crate::types::{ChipType, Destination};

/// Parts buffered in memory before a dump is flushed to the writer.
const DUMP_BUFFER_PARTS: usize = 4096;

/// The device may spend this long writing a committed sequence to flash.
const SEQUENCE_COMMIT_TIMEOUT: Duration = Duration::from_secs(30);
const SEQUENCE_END_SEND_TIMEOUT: Duration = Duration::from_secs(3);

/// Extra attempts for a file part whose acknowledgement went missing.
const PART_RETRIES: u32 = 4;

impl<'a, B: Bridge> Session<'a, B> {
    /// Upload a partition table.
    pub fn send_pit(&mut self, pit: &[u8]) -> Result<()> {
        info!("uploading partition table ({} bytes)", pit.len());

        exchange(self.bridge, Command::BeginPitFlash, ResponseKind::Pit)?;
        exchange(
            self.bridge,
            Command::FlashPitPart {
                file_size: pit.len() as u32,
            },
            ResponseKind::Pit,
        )?;

        // The table travels as a single unframed part of exactly its size.
        self.bridge.send_data(pit, EXCHANGE_TIMEOUT, true)?;
        receive_response(self.bridge, ResponseKind::Pit, EXCHANGE_TIMEOUT)?;

        exchange(
            self.bridge,
            Command::EndPitUpload {
                file_size: pit.len() as u32,
            },
            ResponseKind::Pit,
        )?;
        Ok(())
    }

    /// Download the partition table.
    ///
    /// The device reports and delivers the table padded to 4 KiB.
    pub fn receive_pit(&mut self) -> Result<Vec<u8>> {
        info!("downloading partition table");

        let file_size =
            exchange(self.bridge, Command::BeginPitDump, ResponseKind::Pit)? as usize;
        debug!("partition table is {file_size} bytes");

        let parts = file_size.div_ceil(RECEIVE_PART_LEN);
        let mut table = Vec::with_capacity(file_size);
        let mut part = [0u8; RECEIVE_PART_LEN];

        for index in 0..parts {
            self.bridge.send_data(
                &Command::DumpPitPart {
                    index: index as u32,
                }
                .encode(),
                EXCHANGE_TIMEOUT,
                true,
            )?;
            let received = receive_part(self.bridge, &mut part)?;
            table.extend_from_slice(&part[..received]);
        }

        exchange(self.bridge, Command::EndPitDump, ResponseKind::Pit)?;
        Ok(table)
    }

    /// Upload a file to a flash destination.
    ///
    /// Phone uploads address a partition through `file_id`; the modem image
    /// takes no identifier. Both rules are checked before any I/O. `progress`
    /// receives integer percentages.
    pub fn send_file<R, F>(
        &mut self,
        file: &mut R,
        destination: Destination,
        file_id: Option<u32>,
        mut progress: F,
    ) -> Result<()>
    where
        R: Read + Seek,
        F: FnMut(u32),
    {
        match destination {
            Destination::Modem if file_id.is_some() => return Err(Error::ModemFileIdentifier),
            Destination::Phone if file_id.is_none() => return Err(Error::MissingFileIdentifier),
            _ => {}
        }

        let file_size = file.seek(SeekFrom::End(0))?;
        file.seek(SeekFrom::Start(0))?;
        info!("uploading {file_size} bytes ({destination:?})");

        exchange(self.bridge, Command::BeginFileFlash, ResponseKind::FileTransfer)?;

        let sequence_bytes = (MAX_SEQUENCE_LEN * FILE_PART_LEN) as u64;
        let partial_len = (file_size % FILE_PART_LEN as u64) as u32;

        let mut sequence_count = file_size / sequence_bytes;
        let mut last_sequence_len = MAX_SEQUENCE_LEN as u64;
        if file_size % sequence_bytes != 0 {
            sequence_count += 1;
            last_sequence_len = (file_size % sequence_bytes) / FILE_PART_LEN as u64;
            if partial_len != 0 {
                last_sequence_len += 1;
            }
        }

        let mut transferred: u64 = 0;
        let mut previous_percent = 0;
        progress(0);

        let mut part = vec![0u8; FILE_PART_LEN];

        for sequence_index in 0..sequence_count {
            let last_sequence = sequence_index == sequence_count - 1;
            let sequence_len = if last_sequence {
                last_sequence_len as usize
            } else {
                MAX_SEQUENCE_LEN
            };
            debug!("sequence {sequence_index}: {sequence_len} parts");

            exchange(
                self.bridge,
                Command::BeginSequence {
                    packet_count: 2 * sequence_len as u32,
                },
                ResponseKind::FileTransfer,
            )?;

            for part_index in 0..sequence_len {
                read_part(file, &mut part)?;
                self.send_part(&part, part_index as u32)?;

                transferred = (transferred + FILE_PART_LEN as u64).min(file_size);
                let percent = (100 * transferred / file_size) as u32;
                if percent != previous_percent {
                    progress(percent);
                }
                previous_percent = percent;
            }

            // The sequence-end frame counts full parts only; a trailing
            // partial part is declared through its length instead.
            let full_parts = if last_sequence && partial_len != 0 {
                sequence_len - 1
            } else {
                sequence_len
            };
            let sequence_end = match destination {
                Destination::Phone => Command::EndPhoneTransfer {
                    partial_len: if last_sequence { partial_len } else { 0 },
                    last_full_index: 2 * full_parts as u32,
                    file_id: file_id.unwrap_or(0),
                    last_sequence,
                },
                Destination::Modem => Command::EndModemTransfer {
                    partial_len: if last_sequence { partial_len } else { 0 },
                    last_full_index: 2 * full_parts as u32,
                    last_sequence,
                },
            };
            exchange_timeout(
                self.bridge,
                sequence_end,
                ResponseKind::FileTransfer,
                SEQUENCE_END_SEND_TIMEOUT,
                SEQUENCE_COMMIT_TIMEOUT,
            )?;
        }

        Ok(())
    }

    /// One file part and its acknowledgement.
    ///
    /// A lost acknowledgement retries the whole part; an acknowledgement
    /// naming a different index fails immediately.
    fn send_part(&mut self, part: &[u8], index: u32) -> Result<()> {
        self.bridge.send_data(part, EXCHANGE_TIMEOUT, true)?;
        let mut result = receive_response(self.bridge, ResponseKind::FilePart, EXCHANGE_TIMEOUT);

        for _ in 0..PART_RETRIES {
            match result {
                Err(Error::Timeout { .. }) | Err(Error::UnexpectedResponse { .. }) => {
                    warn!("no acknowledgement for file part {index}; retrying");
                    self.bridge.send_data(part, EXCHANGE_TIMEOUT, true)?;
                    result =
                        receive_response(self.bridge, ResponseKind::FilePart, EXCHANGE_TIMEOUT);
                }
                _ => break,
            }
        }

        let echoed = result?;
        if echoed != index {
            return Err(Error::PartIndexMismatch {
                sent: index,
                received: echoed,
            });
        }
        Ok(())
    }

    /// Dump a raw chip region into `out`.
    pub fn receive_dump<W: Write>(
        &mut self,
        chip_type: ChipType,
        chip_id: u32,
        out: &mut W,
    ) -> Result<()> {
        info!("dumping {chip_type:?} chip {chip_id}");

        let dump_size = exchange(
            self.bridge,
            Command::BeginDump {
                chip_type: chip_type.code(),
                chip_id,
            },
            ResponseKind::FileTransfer,
        )? as usize;
        debug!("dump size is {dump_size} bytes");

        let parts = dump_size.div_ceil(RECEIVE_PART_LEN);
        let staging_limit = DUMP_BUFFER_PARTS * RECEIVE_PART_LEN;
        let mut staging: Vec<u8> = Vec::with_capacity(staging_limit);
        let mut part = [0u8; RECEIVE_PART_LEN];

        for index in 0..parts {
            self.bridge.send_data(
                &Command::DumpPart {
                    index: index as u32,
                }
                .encode(),
                EXCHANGE_TIMEOUT,
                true,
            )?;
            let received = receive_part(self.bridge, &mut part)?;

            if staging.len() + received > staging_limit {
                out.write_all(&staging)?;
                staging.clear();
            }
            staging.extend_from_slice(&part[..received]);
        }

        if !staging.is_empty() {
            out.write_all(&staging)?;
        }

        exchange(self.bridge, Command::EndFileTransfer, ResponseKind::FileTransfer)?;
        Ok(())
    }
}

/// Wait for one variable-length download part.
fn receive_part<B: Bridge>(bridge: &mut B, dest: &mut [u8; RECEIVE_PART_LEN]) -> Result<usize> {
    let received = bridge.receive_data(dest, 1, EXCHANGE_TIMEOUT);
    if received == 0 {
        return Err(Error::Timeout { wanted: 1 });
    }
    Ok(received)
}

/// Fill `buf` from the reader, zero-padding after a final short read.
fn read_part<R: Read>(file: &mut R, buf: &mut [u8]) -> Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        let n = file.read(&mut buf[filled..])?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    buf[filled..].fill(0);
    Ok(filled)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::{ack, words, ScriptedBridge};
    use std::io::Cursor;

    const MIB: u64 = 1024 * 1024;

    /// A session whose setup acknowledgements are already queued.
    fn session(bridge: &mut ScriptedBridge) -> Session<'_, ScriptedBridge> {
        bridge.push_inbound(&ack(0x64, 0));
        bridge.push_inbound(&ack(0x64, 180));
        Session::begin(bridge).unwrap()
    }

    /// Answers upload exchanges: acknowledges control frames and echoes an
    /// incrementing per-sequence index for each file part.
    fn upload_responder() -> impl FnMut(&[u8]) -> Vec<u8> {
        let mut part_index: u32 = 0;
        move |frame: &[u8]| {
            if frame.len() == FILE_PART_LEN {
                let reply = ack(0x00, part_index);
                part_index += 1;
                return reply;
            }
            let head = words(frame, 2);
            match (head[0], head[1]) {
                (0x66, 2) => {
                    // New sequence: part indices restart.
                    part_index = 0;
                    ack(0x66, 0)
                }
                (0x66, _) => ack(0x66, 0),
                _ => Vec::new(),
            }
        }
    }

    struct CountingWriter {
        data: Vec<u8>,
        writes: usize,
    }

    impl Write for CountingWriter {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.data.extend_from_slice(buf);
            self.writes += 1;
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn test_pit_round_trip() {
        let pit: Vec<u8> = (0..3584u32).map(|i| (i % 253) as u8).collect();

        let mut bridge = ScriptedBridge::new();
        let stored = std::rc::Rc::new(std::cell::RefCell::new(Vec::new()));
        let device_pit = stored.clone();
        let mut dumping = false;
        bridge.respond_with(move |frame: &[u8]| {
            let head = words(frame, 3);
            if frame.len() != 1024 {
                // Raw table data; the device pads its copy to 4 KiB.
                let mut padded = frame.to_vec();
                padded.resize(4096, 0);
                *device_pit.borrow_mut() = padded;
                return ack(0x65, 0);
            }
            match (head[0], head[1]) {
                (0x65, 0) => ack(0x65, 0),
                (0x65, 1) => {
                    dumping = true;
                    ack(0x65, device_pit.borrow().len() as u32)
                }
                (0x65, 2) if dumping => {
                    let table = device_pit.borrow();
                    let from = head[2] as usize * RECEIVE_PART_LEN;
                    let to = (from + RECEIVE_PART_LEN).min(table.len());
                    table[from..to].to_vec()
                }
                (0x65, _) => ack(0x65, 0),
                _ => Vec::new(),
            }
        });

        let mut session = session(&mut bridge);
        session.send_pit(&pit).unwrap();
        let table = session.receive_pit().unwrap();

        assert_eq!(table.len(), 4096);
        assert_eq!(&table[..3584], &pit[..]);
        assert!(table[3584..].iter().all(|&b| b == 0));
        drop(session);

        // 4096 padded bytes arrive in nine parts.
        let dump_requests = bridge
            .sent
            .iter()
            .filter(|f| f.len == 1024 && words(&f.head, 2) == [0x65, 2])
            .count();
        // One of the [0x65, 2] frames is the upload's size declaration.
        assert_eq!(dump_requests - 1, 9);
    }

    #[test]
    fn test_pit_download_exact_part_multiple() {
        let mut bridge = ScriptedBridge::new();
        bridge.respond_with(|frame: &[u8]| {
            let head = words(frame, 3);
            match (head[0], head[1]) {
                (0x65, 1) => ack(0x65, 2000),
                (0x65, 2) => vec![0xA5; RECEIVE_PART_LEN],
                (0x65, _) => ack(0x65, 0),
                _ => Vec::new(),
            }
        });

        let mut session = session(&mut bridge);
        let table = session.receive_pit().unwrap();
        assert_eq!(table.len(), 2000);
        drop(session);

        // 2000 = 4 × 500: exactly four part requests, no ninth short one.
        let part_requests = bridge
            .sent
            .iter()
            .filter(|f| words(&f.head, 2) == [0x65, 2])
            .count();
        assert_eq!(part_requests, 4);
    }

    #[test]
    fn test_multi_sequence_upload() {
        let mut source = Cursor::new(vec![0u8; (200 * MIB) as usize]);

        let mut bridge = ScriptedBridge::new();
        bridge.respond_with(upload_responder());

        let mut percents = Vec::new();
        let mut session = session(&mut bridge);
        session
            .send_file(&mut source, Destination::Phone, Some(7), |p| {
                percents.push(p)
            })
            .unwrap();
        drop(session);

        // 200 MiB = 1600 full parts: one full sequence of 800 and one of 800.
        let begin_sequences: Vec<Vec<u32>> = bridge
            .sent
            .iter()
            .filter(|f| f.len == 1024 && words(&f.head, 2) == [0x66, 2])
            .map(|f| words(&f.head, 4))
            .collect();
        assert_eq!(
            begin_sequences,
            vec![vec![0x66, 2, 0, 1600], vec![0x66, 2, 0, 1600]]
        );

        let parts = bridge.sent.iter().filter(|f| f.len == FILE_PART_LEN).count();
        assert_eq!(parts, 1600);

        let ends: Vec<Vec<u32>> = bridge
            .sent
            .iter()
            .filter(|f| f.len == 1024 && words(&f.head, 2) == [0x66, 3])
            .map(|f| words(&f.head, 9))
            .collect();
        assert_eq!(
            ends,
            vec![
                // partial_len 0, 2×800 full parts, file id 7, not last
                vec![0x66, 3, 0, 0, 1600, 0, 0, 7, 0],
                // same, last
                vec![0x66, 3, 0, 0, 1600, 0, 0, 7, 1],
            ]
        );

        assert_eq!(percents.first(), Some(&0));
        assert_eq!(percents.last(), Some(&100));
        assert!(percents.windows(2).all(|w| w[0] < w[1]));
    }

    #[test]
    fn test_upload_with_partial_final_part() {
        let size = 2 * FILE_PART_LEN + 1000;
        let mut source = Cursor::new(vec![0x5Au8; size]);

        let mut bridge = ScriptedBridge::new();
        bridge.respond_with(upload_responder());

        let mut session = session(&mut bridge);
        session
            .send_file(&mut source, Destination::Modem, None, |_| {})
            .unwrap();
        drop(session);

        // Three parts; two are full, the third is partial.
        let parts = bridge.sent.iter().filter(|f| f.len == FILE_PART_LEN).count();
        assert_eq!(parts, 3);

        let end = bridge
            .sent
            .iter()
            .find(|f| f.len == 1024 && words(&f.head, 2) == [0x66, 3])
            .unwrap();
        // Modem layout: no file identifier word.
        assert_eq!(words(&end.head, 8), [0x66, 3, 1, 1000, 4, 0, 0, 1]);
    }

    #[test]
    fn test_zero_byte_upload_sends_no_parts() {
        let mut source = Cursor::new(Vec::new());

        let mut bridge = ScriptedBridge::new();
        bridge.respond_with(upload_responder());

        let mut session = session(&mut bridge);
        session
            .send_file(&mut source, Destination::Phone, Some(1), |_| {})
            .unwrap();
        drop(session);

        // Only the transfer bracket goes out after session setup.
        assert_eq!(bridge.sent.len(), 3);
        assert_eq!(words(&bridge.sent[2].head, 2), [0x66, 0]);
    }

    #[test]
    fn test_part_index_mismatch_fails_immediately() {
        let size = 10 * FILE_PART_LEN;
        let mut source = Cursor::new(vec![0u8; size]);

        let mut bridge = ScriptedBridge::new();
        let mut part_index: u32 = 0;
        bridge.respond_with(move |frame: &[u8]| {
            if frame.len() == FILE_PART_LEN {
                // Echo the wrong index for part 5.
                let echoed = if part_index == 5 { 4 } else { part_index };
                part_index += 1;
                return ack(0x00, echoed);
            }
            match words(frame, 2)[..] {
                [0x66, _] => ack(0x66, 0),
                _ => Vec::new(),
            }
        });

        let mut session = session(&mut bridge);
        let err = session
            .send_file(&mut source, Destination::Phone, Some(1), |_| {})
            .unwrap_err();
        match err {
            Error::PartIndexMismatch { sent, received } => {
                assert_eq!(sent, 5);
                assert_eq!(received, 4);
            }
            other => panic!("expected index mismatch, got {other:?}"),
        }
        drop(session);

        // Nothing was sent after the mismatched part.
        let parts = bridge.sent.iter().filter(|f| f.len == FILE_PART_LEN).count();
        assert_eq!(parts, 6);
        assert_ne!(words(&bridge.sent.last().unwrap().head, 2), [0x66, 3]);
    }

    #[test]
    fn test_missing_part_ack_is_retried() {
        let size = 2 * FILE_PART_LEN;
        let mut source = Cursor::new(vec![0u8; size]);

        let mut bridge = ScriptedBridge::new();
        let mut part_sends: u32 = 0;
        let mut part_index: u32 = 0;
        bridge.respond_with(move |frame: &[u8]| {
            if frame.len() == FILE_PART_LEN {
                part_sends += 1;
                // Swallow the acknowledgement of the first attempt at part 0.
                if part_sends == 1 {
                    return Vec::new();
                }
                let reply = ack(0x00, part_index);
                part_index += 1;
                return reply;
            }
            match words(frame, 2)[..] {
                [0x66, _] => ack(0x66, 0),
                _ => Vec::new(),
            }
        });

        let mut session = session(&mut bridge);
        session
            .send_file(&mut source, Destination::Phone, Some(1), |_| {})
            .unwrap();
        drop(session);

        // Part 0 went out twice.
        let parts = bridge.sent.iter().filter(|f| f.len == FILE_PART_LEN).count();
        assert_eq!(parts, 3);
    }

    #[test]
    fn test_upload_invariants_rejected_before_io() {
        let mut bridge = ScriptedBridge::new();
        let mut session = session(&mut bridge);

        let mut source = Cursor::new(vec![0u8; 16]);
        match session.send_file(&mut source, Destination::Modem, Some(1), |_| {}) {
            Err(Error::ModemFileIdentifier) => {}
            other => panic!("expected modem identifier rejection, got {other:?}"),
        }
        match session.send_file(&mut source, Destination::Phone, None, |_| {}) {
            Err(Error::MissingFileIdentifier) => {}
            other => panic!("expected missing identifier rejection, got {other:?}"),
        }
        drop(session);

        // Session setup aside, nothing went out.
        assert_eq!(bridge.sent.len(), 2);
    }

    #[test]
    fn test_dump_streams_through_staging_buffer() {
        let dump_size: usize = 64 * MIB as usize;

        let mut bridge = ScriptedBridge::new();
        bridge.respond_with(move |frame: &[u8]| {
            let head = words(frame, 3);
            match (head[0], head[1]) {
                (0x66, 1) => ack(0x66, dump_size as u32),
                (0x66, 2) => {
                    let from = head[2] as usize * RECEIVE_PART_LEN;
                    let to = (from + RECEIVE_PART_LEN).min(dump_size);
                    (from..to).map(|offset| (offset % 251) as u8).collect()
                }
                (0x66, _) => ack(0x66, 0),
                _ => Vec::new(),
            }
        });

        let mut out = CountingWriter {
            data: Vec::new(),
            writes: 0,
        };
        let mut session = session(&mut bridge);
        session.receive_dump(ChipType::Nand, 0, &mut out).unwrap();
        drop(session);

        assert_eq!(out.data.len(), dump_size);
        assert!(out
            .data
            .iter()
            .enumerate()
            .all(|(offset, &byte)| byte == (offset % 251) as u8));

        // One flush per full staging buffer plus the remainder.
        let staging = DUMP_BUFFER_PARTS * RECEIVE_PART_LEN;
        assert_eq!(out.writes, dump_size.div_ceil(staging));

        // The dump is bracketed by begin and end frames.
        assert_eq!(words(&bridge.sent[2].head, 4), [0x66, 1, 1, 0]);
        assert_eq!(
            words(&bridge.sent.last().unwrap().head, 2),
            [0x66, 3]
        );
    }
}
