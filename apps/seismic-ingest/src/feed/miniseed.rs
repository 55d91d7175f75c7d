//! miniSEED 2 record decoding for the waveform records carried by SeedLink.
//!
//! Only what the ingest path needs is decoded: the fixed header, blockettes
//! 1000/1001, and the integer, float and Steim data encodings.

use super::{offset_by_seconds, WaveformPacket};
use crate::error::FeedError;
use chrono::{DateTime, Duration as ChronoDuration, NaiveDate, Utc};

pub(super) const RECORD_LEN: usize = 512;
const FIXED_HEADER_LEN: usize = 48;
const STEIM_FRAME_LEN: usize = 64;
const MAX_BLOCKETTES: usize = 16;

const ENCODING_ASCII: u8 = 0;
const ENCODING_INT16: u8 = 1;
const ENCODING_INT32: u8 = 3;
const ENCODING_FLOAT32: u8 = 4;
const ENCODING_FLOAT64: u8 = 5;
const ENCODING_STEIM1: u8 = 10;
const ENCODING_STEIM2: u8 = 11;

const TIME_CORRECTION_APPLIED: u8 = 0x02;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum ByteOrder {
    Big,
    Little,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Steim {
    One,
    Two,
}

struct Reader<'a> {
    buf: &'a [u8],
    order: ByteOrder,
}

impl<'a> Reader<'a> {
    fn bytes<const N: usize>(&self, offset: usize) -> Result<[u8; N], FeedError> {
        self.buf
            .get(offset..offset + N)
            .and_then(|slice| slice.try_into().ok())
            .ok_or_else(|| protocol(format!("record truncated at byte {offset}")))
    }

    fn u8(&self, offset: usize) -> Result<u8, FeedError> {
        Ok(self.bytes::<1>(offset)?[0])
    }

    fn u16(&self, offset: usize) -> Result<u16, FeedError> {
        let raw = self.bytes::<2>(offset)?;
        Ok(match self.order {
            ByteOrder::Big => u16::from_be_bytes(raw),
            ByteOrder::Little => u16::from_le_bytes(raw),
        })
    }

    fn i16(&self, offset: usize) -> Result<i16, FeedError> {
        Ok(self.u16(offset)? as i16)
    }

    fn u32(&self, offset: usize) -> Result<u32, FeedError> {
        let raw = self.bytes::<4>(offset)?;
        Ok(match self.order {
            ByteOrder::Big => u32::from_be_bytes(raw),
            ByteOrder::Little => u32::from_le_bytes(raw),
        })
    }

    fn i32(&self, offset: usize) -> Result<i32, FeedError> {
        Ok(self.u32(offset)? as i32)
    }

    fn f32(&self, offset: usize) -> Result<f32, FeedError> {
        Ok(f32::from_bits(self.u32(offset)?))
    }

    fn f64(&self, offset: usize) -> Result<f64, FeedError> {
        let raw = self.bytes::<8>(offset)?;
        Ok(match self.order {
            ByteOrder::Big => f64::from_be_bytes(raw),
            ByteOrder::Little => f64::from_le_bytes(raw),
        })
    }

    fn text(&self, offset: usize, len: usize) -> Result<String, FeedError> {
        let raw = self
            .buf
            .get(offset..offset + len)
            .ok_or_else(|| protocol(format!("record truncated at byte {offset}")))?;
        Ok(String::from_utf8_lossy(raw).trim().to_string())
    }
}

fn protocol(message: impl Into<String>) -> FeedError {
    FeedError::Protocol(message.into())
}

/// Decodes one data record. Returns `Ok(None)` for records that carry no
/// waveform samples (log/ASCII records, zero rate or zero samples).
pub(super) fn decode_record(record: &[u8]) -> Result<Option<WaveformPacket>, FeedError> {
    if record.len() < FIXED_HEADER_LEN {
        return Err(protocol(format!(
            "record of {} bytes is shorter than the fixed header",
            record.len()
        )));
    }

    let order = detect_byte_order(record);
    let reader = Reader { buf: record, order };

    let station = reader.text(8, 5)?;
    let location = reader.text(13, 2)?;
    let channel = reader.text(15, 3)?;
    let network = reader.text(18, 2)?;

    let sample_count = reader.u16(30)? as usize;
    let rate_factor = reader.i16(32)?;
    let rate_multiplier = reader.i16(34)?;
    let activity_flags = reader.u8(36)?;
    let blockette_count = reader.u8(39)? as usize;
    let time_correction = reader.i32(40)?;
    let data_offset = reader.u16(44)? as usize;
    let first_blockette = reader.u16(46)? as usize;

    let mut data_format = None;
    let mut microseconds: i64 = 0;
    let mut offset = first_blockette;
    for _ in 0..blockette_count.min(MAX_BLOCKETTES) {
        if offset < FIXED_HEADER_LEN || offset + 4 > record.len() {
            break;
        }
        let kind = reader.u16(offset)?;
        let next = reader.u16(offset + 2)? as usize;
        match kind {
            1000 => data_format = Some((reader.u8(offset + 4)?, reader.u8(offset + 5)?)),
            1001 => microseconds = reader.u8(offset + 5)? as i8 as i64,
            _ => {}
        }
        if next <= offset {
            break;
        }
        offset = next;
    }

    let sampling_rate = sampling_rate(rate_factor, rate_multiplier);
    if sample_count == 0 || sampling_rate <= 0.0 {
        return Ok(None);
    }
    let (encoding, word_order) =
        data_format.ok_or_else(|| protocol("data record without blockette 1000"))?;
    if encoding == ENCODING_ASCII {
        return Ok(None);
    }

    let mut start = start_time(&reader)? + ChronoDuration::microseconds(microseconds);
    if activity_flags & TIME_CORRECTION_APPLIED == 0 && time_correction != 0 {
        start += ChronoDuration::microseconds(time_correction as i64 * 100);
    }

    if data_offset < FIXED_HEADER_LEN || data_offset > record.len() {
        return Err(protocol(format!("data offset {data_offset} outside record")));
    }
    // Steim frames are big-endian regardless of the declared word order.
    let data_order = match (encoding, word_order) {
        (ENCODING_STEIM1 | ENCODING_STEIM2, _) => ByteOrder::Big,
        (_, 0) => ByteOrder::Little,
        _ => ByteOrder::Big,
    };
    let data = Reader {
        buf: &record[data_offset..],
        order: data_order,
    };
    let samples = match encoding {
        ENCODING_INT16 => decode_fixed(sample_count, 2, |i| Ok(data.i16(i)? as f64))?,
        ENCODING_INT32 => decode_fixed(sample_count, 4, |i| Ok(data.i32(i)? as f64))?,
        ENCODING_FLOAT32 => decode_fixed(sample_count, 4, |i| Ok(data.f32(i)? as f64))?,
        ENCODING_FLOAT64 => decode_fixed(sample_count, 8, |i| data.f64(i))?,
        ENCODING_STEIM1 => decode_steim(&data, sample_count, Steim::One)?,
        ENCODING_STEIM2 => decode_steim(&data, sample_count, Steim::Two)?,
        other => return Err(protocol(format!("unsupported data encoding {other}"))),
    };

    let end = offset_by_seconds(start, (sample_count - 1) as f64 / sampling_rate)
        .ok_or_else(|| protocol(format!("record end time out of range at {sampling_rate} Hz")))?;

    Ok(Some(WaveformPacket::new(
        &network,
        &station,
        &location,
        &channel,
        sampling_rate,
        start,
        end,
        samples,
    )))
}

fn detect_byte_order(record: &[u8]) -> ByteOrder {
    let year = u16::from_be_bytes([record[20], record[21]]);
    if (1900..=2100).contains(&year) {
        ByteOrder::Big
    } else {
        ByteOrder::Little
    }
}

fn sampling_rate(factor: i16, multiplier: i16) -> f64 {
    let factor = factor as f64;
    let multiplier = if multiplier == 0 { 1.0 } else { multiplier as f64 };
    if factor == 0.0 {
        return 0.0;
    }
    match (factor > 0.0, multiplier > 0.0) {
        (true, true) => factor * multiplier,
        (true, false) => -factor / multiplier,
        (false, true) => -multiplier / factor,
        (false, false) => 1.0 / (factor * multiplier),
    }
}

fn start_time(reader: &Reader<'_>) -> Result<DateTime<Utc>, FeedError> {
    let year = reader.u16(20)?;
    let day_of_year = reader.u16(22)?;
    let hour = reader.u8(24)?;
    let minute = reader.u8(25)?;
    let second = reader.u8(26)?;
    let ten_thousandths = reader.u16(28)?;

    let leap = second >= 60;
    let naive = NaiveDate::from_yo_opt(year as i32, day_of_year as u32)
        .and_then(|date| date.and_hms_opt(hour as u32, minute as u32, second.min(59) as u32))
        .ok_or_else(|| {
            protocol(format!(
                "invalid start time {year}.{day_of_year} {hour}:{minute}:{second}"
            ))
        })?;
    let mut start = naive.and_utc() + ChronoDuration::microseconds(ten_thousandths as i64 * 100);
    if leap {
        start += ChronoDuration::seconds(1);
    }
    Ok(start)
}

fn decode_fixed(
    count: usize,
    width: usize,
    read: impl Fn(usize) -> Result<f64, FeedError>,
) -> Result<Vec<f64>, FeedError> {
    (0..count).map(|i| read(i * width)).collect()
}

fn sign_extend(value: u32, bits: u32) -> i32 {
    let shift = 32 - bits;
    ((value << shift) as i32) >> shift
}

fn unpack_fields(word: u32, shifts: &[u32], bits: u32, out: &mut Vec<i32>) {
    let mask = (1u32 << bits) - 1;
    for shift in shifts {
        out.push(sign_extend((word >> shift) & mask, bits));
    }
}

fn unpack_steim_word(
    word: u32,
    code: u32,
    version: Steim,
    out: &mut Vec<i32>,
) -> Result<(), FeedError> {
    match (version, code) {
        (_, 0) => {}
        (_, 1) => unpack_fields(word, &[24, 16, 8, 0], 8, out),
        (Steim::One, 2) => unpack_fields(word, &[16, 0], 16, out),
        (Steim::One, 3) => out.push(word as i32),
        (Steim::Two, 2) => match word >> 30 {
            1 => unpack_fields(word, &[0], 30, out),
            2 => unpack_fields(word, &[15, 0], 15, out),
            3 => unpack_fields(word, &[20, 10, 0], 10, out),
            _ => return Err(protocol("invalid steim2 sub-code for nibble 2")),
        },
        (Steim::Two, 3) => match word >> 30 {
            0 => unpack_fields(word, &[24, 18, 12, 6, 0], 6, out),
            1 => unpack_fields(word, &[25, 20, 15, 10, 5, 0], 5, out),
            2 => unpack_fields(word, &[24, 20, 16, 12, 8, 4, 0], 4, out),
            _ => return Err(protocol("invalid steim2 sub-code for nibble 3")),
        },
        _ => return Err(protocol(format!("invalid steim nibble {code}"))),
    }
    Ok(())
}

fn decode_steim(data: &Reader<'_>, count: usize, version: Steim) -> Result<Vec<f64>, FeedError> {
    let frames = data.buf.len() / STEIM_FRAME_LEN;
    let mut diffs: Vec<i32> = Vec::with_capacity(count + 7);
    let mut forward = None;
    let mut reverse = None;

    for frame in 0..frames {
        let base = frame * STEIM_FRAME_LEN;
        let nibbles = data.u32(base)?;
        for index in 1..16u32 {
            let word = data.u32(base + index as usize * 4)?;
            if frame == 0 && index == 1 {
                forward = Some(word as i32);
                continue;
            }
            if frame == 0 && index == 2 {
                reverse = Some(word as i32);
                continue;
            }
            let code = (nibbles >> (30 - 2 * index)) & 0x3;
            unpack_steim_word(word, code, version, &mut diffs)?;
        }
        if diffs.len() >= count {
            break;
        }
    }

    let first = forward.ok_or_else(|| protocol("steim data without integration constants"))?;
    let mut samples = Vec::with_capacity(count);
    let mut current = first;
    samples.push(current as f64);
    // The first difference is relative to the previous record and is ignored.
    for diff in diffs.iter().skip(1).take(count.saturating_sub(1)) {
        current = current.wrapping_add(*diff);
        samples.push(current as f64);
    }
    if samples.len() < count {
        return Err(protocol(format!(
            "steim frames hold {} samples, header declares {count}",
            samples.len()
        )));
    }
    if reverse.is_some_and(|last| last != current) {
        tracing::debug!(
            expected = ?reverse,
            actual = current,
            "steim reverse integration constant mismatch"
        );
    }
    Ok(samples)
}

#[cfg(test)]
pub(super) mod test_support {
    use super::*;

    pub(in crate::feed) struct RecordBuilder {
        buf: Vec<u8>,
        order: ByteOrder,
    }

    impl RecordBuilder {
        pub(in crate::feed) fn new(encoding: u8, sample_count: u16, rate_factor: i16, rate_multiplier: i16) -> Self {
            Self::with_order(ByteOrder::Big, encoding, sample_count, rate_factor, rate_multiplier)
        }

        /// Header and data words are written in `order`; blockette 1000 declares it.
        pub(super) fn with_order(
            order: ByteOrder,
            encoding: u8,
            sample_count: u16,
            rate_factor: i16,
            rate_multiplier: i16,
        ) -> Self {
            let mut builder = Self {
                buf: vec![0u8; RECORD_LEN],
                order,
            };
            builder.buf[0..6].copy_from_slice(b"000001");
            builder.buf[6] = b'D';
            builder.buf[8..13].copy_from_slice(b"ANMO ");
            builder.buf[13..15].copy_from_slice(b"00");
            builder.buf[15..18].copy_from_slice(b"BHZ");
            builder.buf[18..20].copy_from_slice(b"IU");
            builder.put_u16(20, 2024);
            builder.put_u16(22, 61);
            builder.buf[24] = 12;
            builder.buf[25] = 30;
            builder.buf[26] = 15;
            builder.put_u16(28, 2500);
            builder.put_u16(30, sample_count);
            builder.put_u16(32, rate_factor as u16);
            builder.put_u16(34, rate_multiplier as u16);
            builder.buf[39] = 1;
            builder.put_u16(44, 64);
            builder.put_u16(46, 48);
            builder.put_u16(48, 1000);
            builder.buf[52] = encoding;
            builder.buf[53] = match order {
                ByteOrder::Big => 1,
                ByteOrder::Little => 0,
            };
            builder.buf[54] = 9;
            builder
        }

        fn put(&mut self, at: usize, be: &[u8]) {
            let slot = &mut self.buf[at..at + be.len()];
            slot.copy_from_slice(be);
            if self.order == ByteOrder::Little {
                slot.reverse();
            }
        }

        fn put_u16(&mut self, at: usize, value: u16) {
            self.put(at, &value.to_be_bytes());
        }

        pub(in crate::feed) fn word(mut self, offset: usize, value: u32) -> Self {
            self.put(64 + offset, &value.to_be_bytes());
            self
        }

        pub(super) fn half(mut self, offset: usize, value: u16) -> Self {
            self.put_u16(64 + offset, value);
            self
        }

        pub(super) fn double(mut self, offset: usize, value: u64) -> Self {
            self.put(64 + offset, &value.to_be_bytes());
            self
        }

        /// Overrides the word-order byte of blockette 1000 without touching the data.
        pub(super) fn declared_word_order(mut self, byte: u8) -> Self {
            self.buf[53] = byte;
            self
        }

        /// Chains a blockette 1001 carrying a start time microsecond offset.
        pub(super) fn microseconds(mut self, offset: i8) -> Self {
            self.buf[39] = 2;
            self.put_u16(50, 56);
            self.put_u16(56, 1001);
            self.buf[61] = offset as u8;
            self
        }

        /// Sets the header time correction in units of 100 microseconds.
        pub(super) fn time_correction(mut self, correction: i32, applied: bool) -> Self {
            self.put(40, &correction.to_be_bytes());
            if applied {
                self.buf[36] |= TIME_CORRECTION_APPLIED;
            }
            self
        }

        pub(in crate::feed) fn build(self) -> Vec<u8> {
            self.buf
        }
    }

    /// A big-endian int32 record for `IU.ANMO.00.BHZ` at 2024-03-01T12:30:15.25Z.
    pub(in crate::feed) fn int32_record(samples: &[i32], rate: i16) -> Vec<u8> {
        let mut builder = RecordBuilder::new(ENCODING_INT32, samples.len() as u16, rate, 1);
        for (i, sample) in samples.iter().enumerate() {
            builder = builder.word(i * 4, *sample as u32);
        }
        builder.build()
    }
}
