use std::io::{self, BufRead};

use bstr::Finder;
use bytes::BytesMut;
use tracing::warn;

use crate::FilePosition;

/// Outcome of one buffered read attempt.
#[derive(Debug)]
pub struct ReadResult {
    /// Bytes consumed from the reader while producing a full delimited
    /// record in the caller's buffer. `None` means the input ran dry
    /// mid-record; the caller should retry once more bytes land.
    pub successfully_read: Option<usize>,
    /// How many over-long records were dropped along the way.
    pub discarded_for_size: usize,
}

/// What one call to [`assemble_record`] concluded about the input.
enum Assembly {
    /// A full delimited record of acceptable size now sits in `buf`.
    Complete,
    /// A delimiter was reached but the record had outgrown `max_size`.
    Oversized,
    /// The reader ran out of bytes before the next delimiter.
    Starved,
}

/// Read the next `delim`-terminated record of at most `max_size` bytes
/// into `buf`, advancing `position` for every byte consumed.
///
/// Records longer than `max_size` are dropped whole: their delimiter is
/// still consumed, `position` still advances past them, and the count of
/// drops is reported so the caller can account for the loss. A record cut
/// short by EOF stays in `buf` across calls; the next call picks up where
/// this one starved, which is what lets the watcher ride out writes it
/// observed halfway through.
pub fn read_until_with_max_size<R: BufRead + ?Sized>(
    reader: &mut R,
    position: &mut FilePosition,
    delim: &[u8],
    buf: &mut BytesMut,
    max_size: usize,
) -> io::Result<ReadResult> {
    let finder = Finder::new(delim);
    let mut consumed = 0usize;
    let mut discarded_for_size = 0usize;

    loop {
        match assemble_record(reader, &finder, delim.len(), position, buf, max_size, &mut consumed)?
        {
            Assembly::Complete => {
                return Ok(ReadResult {
                    successfully_read: Some(consumed),
                    discarded_for_size,
                });
            }
            Assembly::Oversized => {
                warn!(message = "Found record that exceeds max_record_bytes; discarding.");
                discarded_for_size += 1;
                buf.clear();
            }
            Assembly::Starved => {
                return Ok(ReadResult {
                    successfully_read: None,
                    discarded_for_size,
                });
            }
        }
    }
}

/// Drive `buf` toward one complete record.
///
/// The record's true length is `buf.len()` plus whatever precedes the next
/// delimiter, so oversize is decided the moment the delimiter shows up.
/// While no delimiter is in sight, fragments are buffered only as long as
/// the record still has a chance of fitting; once it cannot, the length
/// already in `buf` marks the record as doomed (a state that survives a
/// starved return, so a restart of the call cannot resurrect it) and
/// further fragments are consumed without being kept.
fn assemble_record<R: BufRead + ?Sized>(
    reader: &mut R,
    finder: &Finder<'_>,
    delim_len: usize,
    position: &mut FilePosition,
    buf: &mut BytesMut,
    max_size: usize,
    consumed: &mut usize,
) -> io::Result<Assembly> {
    loop {
        let chunk = match reader.fill_buf() {
            Ok(chunk) => chunk,
            Err(error) if error.kind() == io::ErrorKind::Interrupted => continue,
            Err(error) => return Err(error),
        };
        if chunk.is_empty() {
            return Ok(Assembly::Starved);
        }

        if let Some(at) = finder.find(chunk) {
            let fits = buf.len() + at <= max_size;
            if fits {
                buf.extend_from_slice(&chunk[..at]);
            }
            advance(reader, position, consumed, at + delim_len);
            return Ok(if fits {
                Assembly::Complete
            } else {
                Assembly::Oversized
            });
        }

        // No delimiter in this fragment. Keep it only while the record can
        // still fit; the first overshoot is retained so the record's fate
        // is visible in `buf.len()` alone.
        if buf.len() <= max_size {
            buf.extend_from_slice(chunk);
        }
        let skipped = chunk.len();
        advance(reader, position, consumed, skipped);
    }
}

fn advance<R: BufRead + ?Sized>(
    reader: &mut R,
    position: &mut FilePosition,
    consumed: &mut usize,
    amount: usize,
) {
    reader.consume(amount);
    *position += amount as u64;
    *consumed += amount;
}

#[cfg(test)]
mod test {
    use std::{io::Cursor, num::NonZeroU8};

    use bytes::BytesMut;
    use quickcheck::{QuickCheck, TestResult};

    use super::read_until_with_max_size;

    #[test]
    fn splits_at_delimiter_and_tracks_position() {
        let mut reader = Cursor::new(&b"abc\ndef\n"[..]);
        let mut position = 0;
        let mut buf = BytesMut::new();

        let result =
            read_until_with_max_size(&mut reader, &mut position, b"\n", &mut buf, 1024).unwrap();
        assert_eq!(result.successfully_read, Some(4));
        assert_eq!(&buf[..], b"abc");
        assert_eq!(position, 4);

        buf.clear();
        let result =
            read_until_with_max_size(&mut reader, &mut position, b"\n", &mut buf, 1024).unwrap();
        assert_eq!(result.successfully_read, Some(4));
        assert_eq!(&buf[..], b"def");
        assert_eq!(position, 8);
    }

    #[test]
    fn partial_record_is_retained_across_calls() {
        let mut position = 0;
        let mut buf = BytesMut::new();

        let mut reader = Cursor::new(&b"hel"[..]);
        let result =
            read_until_with_max_size(&mut reader, &mut position, b"\n", &mut buf, 1024).unwrap();
        assert_eq!(result.successfully_read, None);
        assert_eq!(position, 3);

        // The rest of the line arrives later.
        let mut reader = Cursor::new(&b"lo\n"[..]);
        let result =
            read_until_with_max_size(&mut reader, &mut position, b"\n", &mut buf, 1024).unwrap();
        assert_eq!(result.successfully_read, Some(3));
        assert_eq!(&buf[..], b"hello");
        assert_eq!(position, 6);
    }

    #[test]
    fn oversized_record_is_discarded_but_position_advances() {
        let mut reader = Cursor::new(&b"0123456789\nok\n"[..]);
        let mut position = 0;
        let mut buf = BytesMut::new();

        let result =
            read_until_with_max_size(&mut reader, &mut position, b"\n", &mut buf, 4).unwrap();
        assert_eq!(result.successfully_read, Some(14));
        assert_eq!(result.discarded_for_size, 1);
        assert_eq!(&buf[..], b"ok");
        assert_eq!(position, 14);
    }

    #[test]
    fn oversized_record_spanning_calls_is_still_discarded() {
        let mut position = 0;
        let mut buf = BytesMut::new();

        // Six bytes with no delimiter: over the cap, but starved.
        let mut reader = Cursor::new(&b"abcdef"[..]);
        let result =
            read_until_with_max_size(&mut reader, &mut position, b"\n", &mut buf, 4).unwrap();
        assert_eq!(result.successfully_read, None);

        // The record finally terminates in a later call and must be dropped
        // rather than emitted as a fresh-looking fragment.
        let mut reader = Cursor::new(&b"gh\nok\n"[..]);
        let result =
            read_until_with_max_size(&mut reader, &mut position, b"\n", &mut buf, 4).unwrap();
        assert_eq!(result.discarded_for_size, 1);
        assert_eq!(&buf[..], b"ok");
        assert_eq!(position, 12);
    }

    /// Model check: over arbitrary chunked input, the function must return
    /// the first delimiter-terminated segment that fits, leave `position`
    /// just past that segment's delimiter, and count one discard for every
    /// terminated segment it had to pass over.
    #[test]
    fn qc_first_fitting_segment_wins() {
        fn prop(chunks: Vec<Vec<u8>>, delim: u8, max_size: NonZeroU8) -> TestResult {
            let max_size = max_size.get() as usize;

            // Reference model over the fully assembled stream: segment
            // bodies between delimiters, each either fitting or not.
            let stream: Vec<u8> = chunks.concat();
            let mut segments: Vec<(usize, usize)> = Vec::new();
            let mut body_start = 0;
            for (index, byte) in stream.iter().enumerate() {
                if *byte == delim {
                    segments.push((body_start, index));
                    body_start = index + 1;
                }
            }
            let first_fitting = segments
                .iter()
                .position(|(start, end)| end - start <= max_size);

            // Drive the subject one chunk at a time, the way a tailer sees
            // a file being written.
            let mut position = 0u64;
            let mut buf = BytesMut::new();
            let mut discarded_total = 0;
            let mut completed = false;
            for chunk in &chunks {
                let mut reader = Cursor::new(chunk.as_slice());
                let result = read_until_with_max_size(
                    &mut reader,
                    &mut position,
                    &[delim],
                    &mut buf,
                    max_size,
                )
                .unwrap();
                discarded_total += result.discarded_for_size;
                if result.successfully_read.is_some() {
                    completed = true;
                    break;
                }
            }

            match first_fitting {
                Some(segment_index) => {
                    let (start, end) = segments[segment_index];
                    assert!(completed, "a fitting segment exists but was never returned");
                    assert_eq!(&buf[..], &stream[start..end]);
                    assert_eq!(position as usize, end + 1);
                    // Every earlier terminated segment was oversized.
                    assert_eq!(discarded_total, segment_index);
                }
                None => {
                    assert!(!completed, "returned a record the model rejects");
                    assert_eq!(discarded_total, segments.len());
                    assert_eq!(position as usize, stream.len());
                }
            }
            TestResult::passed()
        }

        QuickCheck::new()
            .tests(1_000)
            .quickcheck(prop as fn(Vec<Vec<u8>>, u8, NonZeroU8) -> TestResult);
    }
}
