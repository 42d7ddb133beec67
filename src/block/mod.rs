//! Columnar sample blocks.
//!
//! A [`Block`] holds up to [`MAX_ROWS_PER_BLOCK`] samples of one series
//! ([`Tsid`]). It is either *raw* (decoded timestamp and value arrays) or
//! *marshaled* (compressed byte runs plus a filled-in [`BlockHeader`]),
//! never both at once.
//!
//! Values are stored as scaled decimal integers (`value = v * 10^scale`)
//! so that the integer delta codecs in [`crate::encoding::codec`] apply.
//!
//! ## Block header layout (81 bytes, little-endian)
//!
//! ```text
//! [tsid 24][min_ts 8][max_ts 8][first_value 8]
//! [ts_offset 8][values_offset 8][ts_size 4][values_size 4][rows 4]
//! [scale 2][ts_marshal_type 1][values_marshal_type 1][precision_bits 1]
//! ```

pub(crate) mod dedup;

#[cfg(test)]
mod tests;

use std::cmp::Ordering;
use std::fmt;

use crate::encoding::codec::{self, MarshalType};
use crate::encoding::decimal;
use crate::encoding::{Decode, Encode, EncodingError, require};

// ------------------------------------------------------------------------------------------------
// Constants
// ------------------------------------------------------------------------------------------------

/// Maximum number of rows in a single block.
pub const MAX_ROWS_PER_BLOCK: usize = 8 * 1024;

/// Maximum size of a compressed column of a block.
pub const MAX_BLOCK_SIZE: usize = 64 * 1024;

/// Size of an encoded [`BlockHeader`].
pub const BLOCK_HEADER_SIZE: usize = 81;

/// Size of an encoded [`Tsid`].
pub const TSID_SIZE: usize = 24;

// ------------------------------------------------------------------------------------------------
// TSID
// ------------------------------------------------------------------------------------------------

/// Unique identifier of a time series.
///
/// The field order defines the storage order: series of the same metric
/// group, job and instance end up next to each other on disk.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Tsid {
    /// Identifier of the metric name group.
    pub metric_group_id: u64,
    /// Identifier of the `job` label.
    pub job_id: u32,
    /// Identifier of the `instance` label.
    pub instance_id: u32,
    /// Unique identifier of the series itself.
    pub metric_id: u64,
}

impl Tsid {
    /// A TSID that only carries a metric id.
    pub fn from_metric_id(metric_id: u64) -> Self {
        Self {
            metric_id,
            ..Self::default()
        }
    }
}

impl fmt::Display for Tsid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{{group={}, job={}, instance={}, metric={}}}",
            self.metric_group_id, self.job_id, self.instance_id, self.metric_id
        )
    }
}

impl Encode for Tsid {
    fn encode_to(&self, buf: &mut Vec<u8>) -> Result<(), EncodingError> {
        self.metric_group_id.encode_to(buf)?;
        self.job_id.encode_to(buf)?;
        self.instance_id.encode_to(buf)?;
        self.metric_id.encode_to(buf)
    }
}

impl Decode for Tsid {
    fn decode_from(buf: &[u8]) -> Result<(Self, usize), EncodingError> {
        require(buf, TSID_SIZE)?;
        let (metric_group_id, _) = u64::decode_from(buf)?;
        let (job_id, _) = u32::decode_from(&buf[8..])?;
        let (instance_id, _) = u32::decode_from(&buf[12..])?;
        let (metric_id, _) = u64::decode_from(&buf[16..])?;
        Ok((
            Self {
                metric_group_id,
                job_id,
                instance_id,
                metric_id,
            },
            TSID_SIZE,
        ))
    }
}

// ------------------------------------------------------------------------------------------------
// TimeRange
// ------------------------------------------------------------------------------------------------

/// Inclusive range of millisecond timestamps.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TimeRange {
    pub min_timestamp: i64,
    pub max_timestamp: i64,
}

impl TimeRange {
    pub fn new(min_timestamp: i64, max_timestamp: i64) -> Self {
        Self {
            min_timestamp,
            max_timestamp,
        }
    }

    /// The whole representable range.
    pub fn all() -> Self {
        Self::new(i64::MIN, i64::MAX)
    }

    #[inline]
    pub fn contains(&self, timestamp: i64) -> bool {
        timestamp >= self.min_timestamp && timestamp <= self.max_timestamp
    }

    /// True if `[min, max]` intersects this range.
    #[inline]
    pub fn overlaps(&self, min: i64, max: i64) -> bool {
        min <= self.max_timestamp && max >= self.min_timestamp
    }
}

impl fmt::Display for TimeRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}..{}]", self.min_timestamp, self.max_timestamp)
    }
}

// ------------------------------------------------------------------------------------------------
// Raw rows
// ------------------------------------------------------------------------------------------------

/// One ingested sample before it is packed into a block.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RawRow {
    pub tsid: Tsid,
    pub timestamp: i64,
    pub value: f64,
    pub precision_bits: u8,
}

// ------------------------------------------------------------------------------------------------
// BlockHeader
// ------------------------------------------------------------------------------------------------

/// Fixed-size summary of a marshaled block, stored in a part's index.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BlockHeader {
    pub tsid: Tsid,
    pub min_timestamp: i64,
    pub max_timestamp: i64,
    pub first_value: i64,
    pub timestamps_block_offset: u64,
    pub values_block_offset: u64,
    pub timestamps_block_size: u32,
    pub values_block_size: u32,
    pub rows_count: u32,
    pub scale: i16,
    pub timestamps_marshal_type: MarshalType,
    pub values_marshal_type: MarshalType,
    pub precision_bits: u8,
}

impl BlockHeader {
    /// Order used by both merge and search heaps.
    #[inline]
    pub fn cmp_position(&self, other: &Self) -> Ordering {
        self.tsid
            .cmp(&other.tsid)
            .then(self.min_timestamp.cmp(&other.min_timestamp))
    }

    fn validate(&self) -> Result<(), EncodingError> {
        if self.rows_count == 0 {
            return Err(EncodingError::Corrupted("block header has zero rows".into()));
        }
        if self.rows_count as usize > 2 * MAX_ROWS_PER_BLOCK {
            return Err(EncodingError::Corrupted(format!(
                "too many rows in block header: {}; cannot exceed {}",
                self.rows_count,
                2 * MAX_ROWS_PER_BLOCK
            )));
        }
        if self.min_timestamp > self.max_timestamp {
            return Err(EncodingError::Corrupted(format!(
                "min timestamp {} exceeds max timestamp {}",
                self.min_timestamp, self.max_timestamp
            )));
        }
        codec::check_precision_bits(self.precision_bits)?;
        if self.timestamps_block_size as usize > 2 * MAX_BLOCK_SIZE {
            return Err(EncodingError::Corrupted(format!(
                "too big timestamps block: {} bytes; cannot exceed {}",
                self.timestamps_block_size,
                2 * MAX_BLOCK_SIZE
            )));
        }
        if self.values_block_size as usize > 2 * MAX_BLOCK_SIZE {
            return Err(EncodingError::Corrupted(format!(
                "too big values block: {} bytes; cannot exceed {}",
                self.values_block_size,
                2 * MAX_BLOCK_SIZE
            )));
        }
        Ok(())
    }
}

impl Encode for BlockHeader {
    fn encode_to(&self, buf: &mut Vec<u8>) -> Result<(), EncodingError> {
        self.tsid.encode_to(buf)?;
        self.min_timestamp.encode_to(buf)?;
        self.max_timestamp.encode_to(buf)?;
        self.first_value.encode_to(buf)?;
        self.timestamps_block_offset.encode_to(buf)?;
        self.values_block_offset.encode_to(buf)?;
        self.timestamps_block_size.encode_to(buf)?;
        self.values_block_size.encode_to(buf)?;
        self.rows_count.encode_to(buf)?;
        self.scale.encode_to(buf)?;
        self.timestamps_marshal_type.as_u8().encode_to(buf)?;
        self.values_marshal_type.as_u8().encode_to(buf)?;
        self.precision_bits.encode_to(buf)
    }
}

impl Decode for BlockHeader {
    fn decode_from(buf: &[u8]) -> Result<(Self, usize), EncodingError> {
        require(buf, BLOCK_HEADER_SIZE)?;
        let mut off = 0;
        macro_rules! field {
            ($ty:ty) => {{
                let (v, n) = <$ty>::decode_from(&buf[off..])?;
                off += n;
                v
            }};
        }
        let header = Self {
            tsid: field!(Tsid),
            min_timestamp: field!(i64),
            max_timestamp: field!(i64),
            first_value: field!(i64),
            timestamps_block_offset: field!(u64),
            values_block_offset: field!(u64),
            timestamps_block_size: field!(u32),
            values_block_size: field!(u32),
            rows_count: field!(u32),
            scale: field!(i16),
            timestamps_marshal_type: MarshalType::from_u8(field!(u8))?,
            values_marshal_type: MarshalType::from_u8(field!(u8))?,
            precision_bits: field!(u8),
        };
        debug_assert_eq!(off, BLOCK_HEADER_SIZE);
        header.validate()?;
        Ok((header, off))
    }
}

/// Decode exactly `count` headers from an index block.
///
/// Headers must be sorted by TSID.
pub fn decode_block_headers(src: &[u8], count: usize) -> Result<Vec<BlockHeader>, EncodingError> {
    if src.len() != count * BLOCK_HEADER_SIZE {
        return Err(EncodingError::Corrupted(format!(
            "index block holds {} bytes; expected {count} block headers of {BLOCK_HEADER_SIZE} bytes",
            src.len()
        )));
    }
    let mut headers = Vec::with_capacity(count);
    for chunk in src.chunks_exact(BLOCK_HEADER_SIZE) {
        let (bh, _) = BlockHeader::decode_from(chunk)?;
        if let Some(prev) = headers.last().map(|h: &BlockHeader| h.tsid) {
            if bh.tsid < prev {
                return Err(EncodingError::Corrupted(format!(
                    "block headers are not sorted by TSID: {} follows {prev}",
                    bh.tsid
                )));
            }
        }
        headers.push(bh);
    }
    Ok(headers)
}

// ------------------------------------------------------------------------------------------------
// Block
// ------------------------------------------------------------------------------------------------

/// Samples of one series, either raw or marshaled.
#[derive(Debug, Clone, Default)]
pub struct Block {
    pub(crate) header: BlockHeader,

    /// Rows before this index were already consumed by a merge.
    pub(crate) next_idx: usize,

    pub(crate) timestamps: Vec<i64>,
    pub(crate) values: Vec<i64>,

    timestamps_data: Vec<u8>,
    values_data: Vec<u8>,
}

impl Block {
    /// Build a raw block from time-sorted rows.
    pub fn new(tsid: Tsid, timestamps: Vec<i64>, values: Vec<i64>, scale: i16, precision_bits: u8) -> Self {
        let mut b = Self::default();
        b.init(tsid, timestamps, values, scale, precision_bits);
        b
    }

    /// Wrap marshaled column data read from a part.
    pub(crate) fn from_marshaled(header: BlockHeader, timestamps_data: Vec<u8>, values_data: Vec<u8>) -> Self {
        Self {
            header,
            next_idx: 0,
            timestamps: Vec::new(),
            values: Vec::new(),
            timestamps_data,
            values_data,
        }
    }

    pub fn reset(&mut self) {
        self.header = BlockHeader::default();
        self.next_idx = 0;
        self.timestamps.clear();
        self.values.clear();
        self.timestamps_data.clear();
        self.values_data.clear();
    }

    /// Replace the block contents with the given rows.
    ///
    /// # Panics
    ///
    /// If the arrays differ in length or `precision_bits` is outside `1..=64`.
    pub fn init(&mut self, tsid: Tsid, timestamps: Vec<i64>, values: Vec<i64>, scale: i16, precision_bits: u8) {
        assert_eq!(
            timestamps.len(),
            values.len(),
            "BUG: timestamps and values must have equal lengths"
        );
        assert!(
            (1..=64).contains(&precision_bits),
            "BUG: invalid precision bits {precision_bits}"
        );
        self.reset();
        self.header.tsid = tsid;
        self.header.scale = scale;
        self.header.precision_bits = precision_bits;
        self.timestamps = timestamps;
        self.values = values;
        self.fixup_timestamps();
    }

    #[inline]
    pub fn header(&self) -> &BlockHeader {
        &self.header
    }

    #[inline]
    pub fn tsid(&self) -> Tsid {
        self.header.tsid
    }

    /// Marshaled blocks have their arrays cleared.
    #[inline]
    pub fn is_marshaled(&self) -> bool {
        self.values.is_empty()
    }

    /// Number of rows not yet consumed.
    pub fn rows_count(&self) -> usize {
        if self.is_marshaled() {
            self.header.rows_count as usize
        } else {
            self.values.len() - self.next_idx
        }
    }

    /// Unconsumed timestamps of a raw block.
    #[inline]
    pub fn timestamps(&self) -> &[i64] {
        &self.timestamps[self.next_idx..]
    }

    /// Unconsumed scaled values of a raw block.
    #[inline]
    pub fn values(&self) -> &[i64] {
        &self.values[self.next_idx..]
    }

    #[inline]
    pub fn timestamps_data(&self) -> &[u8] {
        &self.timestamps_data
    }

    #[inline]
    pub fn values_data(&self) -> &[u8] {
        &self.values_data
    }

    /// Recompute the header time range from the unconsumed raw rows.
    pub(crate) fn fixup_timestamps(&mut self) {
        if let (Some(&first), Some(&last)) = (self.timestamps.get(self.next_idx), self.timestamps.last()) {
            self.header.min_timestamp = first;
            self.header.max_timestamp = last;
        }
    }

    /// True when the block should not absorb more rows.
    pub fn too_big(&self) -> bool {
        if self.header.rows_count as usize >= MAX_ROWS_PER_BLOCK
            || self.values.len().saturating_sub(self.next_idx) >= MAX_ROWS_PER_BLOCK
        {
            return true;
        }
        self.values_data.len() >= MAX_BLOCK_SIZE || self.timestamps_data.len() >= MAX_BLOCK_SIZE
    }

    /// # Panics
    ///
    /// If `other` belongs to another series or uses another scale.
    pub(crate) fn assert_mergeable(&self, other: &Block) {
        assert_eq!(
            self.header.tsid, other.header.tsid,
            "BUG: cannot merge blocks of different series"
        );
        assert_eq!(
            self.header.scale, other.header.scale,
            "BUG: cannot merge blocks with unequal scale"
        );
    }

    /// Encode the unconsumed rows and fill in the header.
    ///
    /// On an already marshaled block only the offsets are updated.
    ///
    /// # Panics
    ///
    /// If a raw block has no rows left or more than twice the block limit.
    pub fn marshal_data(&mut self, timestamps_block_offset: u64, values_block_offset: u64) -> Result<(), EncodingError> {
        if self.is_marshaled() {
            assert!(self.header.rows_count > 0, "BUG: marshaled block must have rows");
            assert_eq!(
                self.header.timestamps_block_size as usize,
                self.timestamps_data.len(),
                "BUG: timestamps block size mismatch"
            );
            assert_eq!(
                self.header.values_block_size as usize,
                self.values_data.len(),
                "BUG: values block size mismatch"
            );
            self.header.timestamps_block_offset = timestamps_block_offset;
            self.header.values_block_offset = values_block_offset;
            return Ok(());
        }

        assert_eq!(
            self.timestamps.len(),
            self.values.len(),
            "BUG: timestamps and values must have equal lengths"
        );
        let rows = self.values.len() - self.next_idx;
        assert!(rows > 0, "BUG: cannot marshal a block without rows");
        assert!(
            rows <= 2 * MAX_ROWS_PER_BLOCK,
            "BUG: too many rows in block: {rows}"
        );
        self.fixup_timestamps();

        let pb = self.header.precision_bits;
        self.values_data.clear();
        let (values_mt, first_value) = codec::marshal_values(&mut self.values_data, &self.values[self.next_idx..], pb)?;
        self.timestamps_data.clear();
        let (timestamps_mt, min_timestamp) =
            codec::marshal_timestamps(&mut self.timestamps_data, &self.timestamps[self.next_idx..], pb)?;

        self.header.values_marshal_type = values_mt;
        self.header.first_value = first_value;
        self.header.values_block_offset = values_block_offset;
        self.header.values_block_size = self.values_data.len() as u32;
        self.header.timestamps_marshal_type = timestamps_mt;
        self.header.min_timestamp = min_timestamp;
        self.header.timestamps_block_offset = timestamps_block_offset;
        self.header.timestamps_block_size = self.timestamps_data.len() as u32;
        self.header.rows_count = rows as u32;

        self.timestamps.clear();
        self.values.clear();
        self.next_idx = 0;
        Ok(())
    }

    /// Decode the column data back into raw arrays. A raw block is left
    /// untouched.
    ///
    /// Timestamps decoded with full precision must be sorted and lie within
    /// the header bounds; otherwise the data is reported as corrupted.
    pub fn unmarshal_data(&mut self) -> Result<(), EncodingError> {
        if !self.is_marshaled() {
            assert!(
                self.timestamps_data.is_empty() && self.values_data.is_empty(),
                "BUG: raw block must not hold marshaled data"
            );
            return Ok(());
        }
        let bh = self.header;
        if bh.rows_count == 0 {
            return Err(EncodingError::Corrupted("rows count must be greater than 0".into()));
        }
        let rows = bh.rows_count as usize;

        let mut timestamps = Vec::with_capacity(rows);
        codec::unmarshal_timestamps(
            &mut timestamps,
            &self.timestamps_data,
            bh.timestamps_marshal_type,
            bh.min_timestamp,
            rows,
        )?;
        if bh.precision_bits < 64 {
            codec::ensure_non_decreasing(&mut timestamps, bh.min_timestamp, bh.max_timestamp);
        } else {
            check_timestamps_bounds(&timestamps, bh.min_timestamp, bh.max_timestamp)?;
        }

        let mut values = Vec::with_capacity(rows);
        codec::unmarshal_values(&mut values, &self.values_data, bh.values_marshal_type, bh.first_value, rows)?;
        if timestamps.len() != values.len() {
            return Err(EncodingError::Corrupted(format!(
                "timestamps and values count mismatch; got {} vs {}",
                timestamps.len(),
                values.len()
            )));
        }

        self.timestamps = timestamps;
        self.values = values;
        self.timestamps_data.clear();
        self.values_data.clear();
        self.next_idx = 0;
        Ok(())
    }

    /// Append rows within `tr` to the destination arrays, converting values
    /// back to floats.
    ///
    /// # Panics
    ///
    /// If the block has not been unmarshaled.
    pub fn append_rows_with_time_range_filter(&self, dst_timestamps: &mut Vec<i64>, dst_values: &mut Vec<f64>, tr: TimeRange) {
        assert!(
            !self.is_marshaled() || self.header.rows_count == 0,
            "BUG: block must be unmarshaled before reading rows"
        );
        let timestamps = self.timestamps();
        let mut i = 0;
        while i < timestamps.len() && timestamps[i] < tr.min_timestamp {
            i += 1;
        }
        let mut j = timestamps.len();
        while j > i && timestamps[j - 1] > tr.max_timestamp {
            j -= 1;
        }
        if i == j {
            return;
        }
        dst_timestamps.extend_from_slice(&timestamps[i..j]);
        decimal::append_decimal_to_float(dst_values, &self.values()[i..j], self.header.scale);
    }
}

fn check_timestamps_bounds(timestamps: &[i64], min: i64, max: i64) -> Result<(), EncodingError> {
    let (Some(&first), Some(&last)) = (timestamps.first(), timestamps.last()) else {
        return Ok(());
    };
    if first < min {
        return Err(EncodingError::Corrupted(format!(
            "timestamp {first} is smaller than the block min timestamp {min}"
        )));
    }
    if last > max {
        return Err(EncodingError::Corrupted(format!(
            "timestamp {last} is bigger than the block max timestamp {max}"
        )));
    }
    if let Some(pos) = timestamps.windows(2).position(|w| w[1] < w[0]) {
        return Err(EncodingError::Corrupted(format!(
            "timestamps are not sorted at position {}: {} follows {}",
            pos + 1,
            timestamps[pos + 1],
            timestamps[pos]
        )));
    }
    Ok(())
}
