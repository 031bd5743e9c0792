// For interpreting the TLV8 wrapper itself
use zerocopy::{Immutable, IntoBytes, KnownLayout, TryFromBytes};

use thiserror::Error;

/// Largest value that fits in a single TLV8 segment, longer values are split over consecutive segments.
pub const TLV_SEGMENT_MAX: usize = 255;

/// Number of segments a single coalesced TLV can hold, 8 * 255 = 2040 bytes of value.
pub const TLV_SEGMENTS: usize = 8;

#[derive(Error, Debug, Copy, Clone, Eq, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum TLVError {
    /// Not enough data to parse, a header or value runs past the end of the buffer.
    #[error("not enough data to parse")]
    NotEnoughData,
    /// Missing an expected entry.
    #[error("missing required entry 0x{0:0>2x}")]
    MissingEntry(u8),
    /// Parse error (like an unexpectedly sized integer)
    #[error("unexpected value")]
    UnexpectedValue,
    /// Exhausted the buffer while trying to write to it.
    #[error("buffer overrun")]
    BufferOverrun,
}

/// Reader for TLV8 sequences.
///
/// Each segment on the wire is:
///   type_id: u8,
///   length: u8,
///   data: [u8;length]
///
/// The iterator yields segments as they are, adjacent segments of the same type are NOT merged. Use
/// [`TLVReader::next_coalesced`] or [`TLVReader::coalesced`] where a fragmented value is expected.
#[derive(Debug, Clone)]
pub struct TLVReader<'a> {
    buffer: &'a [u8],
    position: usize,
}

impl<'a> TLVReader<'a> {
    pub fn new(buffer: &'a [u8]) -> Self {
        Self::new_at(buffer, 0)
    }
    pub fn new_at(buffer: &'a [u8], start: usize) -> Self {
        Self {
            position: start,
            buffer,
        }
    }

    /// Current byte offset into the buffer.
    pub fn position(&self) -> usize {
        self.position
    }

    /// Whether all data has been consumed.
    pub fn is_empty(&self) -> bool {
        self.position >= self.buffer.len()
    }

    /// Peek at the next header, as (type,length).
    fn peek_next(&self) -> Option<(u8, u8)> {
        if (self.position + 1) < self.buffer.len() {
            let type_id = self.buffer[self.position];
            let length = self.buffer[self.position + 1];
            Some((type_id, length))
        } else {
            None
        }
    }

    // HAPTLVReaderGetNext
    pub fn next_segment(&mut self) -> Option<Result<TLV<'a>, TLVError>> {
        let remaining = self.buffer.len().saturating_sub(self.position);
        if remaining == 0 {
            return None;
        }
        if remaining == 1 {
            // A lone type byte without a length.
            self.poison();
            return Some(Err(TLVError::NotEnoughData));
        }
        let type_id = self.buffer[self.position];
        let length = self.buffer[self.position + 1];
        let data_end = self.position + 2 + length as usize;
        if data_end <= self.buffer.len() {
            let data = &self.buffer[self.position + 2..data_end];
            self.position = data_end;
            Some(Ok(TLV::found(type_id, data)))
        } else {
            self.poison();
            Some(Err(TLVError::NotEnoughData))
        }
    }

    /// Ensure the reader will only ever yield None from now.
    fn poison(&mut self) {
        self.position = self.buffer.len();
    }

    /// Retrieve the next value, concatenating the segments of a fragmented value.
    ///
    /// A segment is continued by the next one if it is exactly 255 bytes long and the next segment has the same type.
    pub fn next_coalesced(&mut self) -> Option<Result<TLV<'a>, TLVError>> {
        let mut value = match self.next_segment()? {
            Ok(v) => v,
            Err(e) => return Some(Err(e)),
        };
        let mut last_length = value.len();
        while last_length == TLV_SEGMENT_MAX {
            match self.peek_next() {
                Some((type_id, _)) if type_id == value.type_id => {}
                _ => break,
            }
            let next_value = match self.next_segment()? {
                Ok(v) => v,
                Err(e) => return Some(Err(e)),
            };
            last_length = next_value.len();
            if let Err(e) = value.combine_with(&next_value) {
                return Some(Err(e));
            }
        }
        Some(Ok(value))
    }

    /// Iterator adaptor yielding coalesced values.
    pub fn coalesced(self) -> Coalesced<'a> {
        Coalesced { reader: self }
    }

    /// Populate the provided TLVs by their type id, the last occurence of a type wins.
    pub fn read_into(self, tlvs: &mut [&mut TLV<'a>]) -> Result<(), TLVError> {
        for entry in self.coalesced() {
            let entry = entry?;
            for v in tlvs.iter_mut() {
                if v.type_id == entry.type_id {
                    (**v).present = true;
                    (**v).data = entry.data.clone();
                }
            }
        }
        Ok(())
    }

    /// Like [`TLVReader::read_into`], but fails if any of the TLVs was not present.
    pub fn require_into(self, tlvs: &mut [&mut TLV<'a>]) -> Result<(), TLVError> {
        self.read_into(tlvs)?;
        for t in tlvs.iter() {
            if t.is_none() {
                return Err(TLVError::MissingEntry(t.type_id));
            }
        }
        Ok(())
    }
}

impl<'a> Iterator for TLVReader<'a> {
    type Item = Result<TLV<'a>, TLVError>;
    fn next(&mut self) -> Option<Self::Item> {
        self.next_segment()
    }
}

/// Iterator over coalesced TLV values, see [`TLVReader::next_coalesced`].
pub struct Coalesced<'a> {
    reader: TLVReader<'a>,
}
impl<'a> Iterator for Coalesced<'a> {
    type Item = Result<TLV<'a>, TLVError>;
    fn next(&mut self) -> Option<Self::Item> {
        self.reader.next_coalesced()
    }
}

/// A borrowed TLV entry, it is a thin wrapper around the segment(s) in the original buffer.
/// This may act as an optional when it was not found, but the lifetime is still tied on an original buffer.
#[derive(PartialEq, Eq, Debug, Clone)]
pub struct TLV<'a> {
    pub type_id: u8,
    present: bool,
    data: heapless::Vec<&'a [u8], TLV_SEGMENTS>,
}

impl<'a> TLV<'a> {
    /// Create a new TLV of the specified type, tied to the data buffer.
    pub fn tied<T: Into<u8>>(data: &'a [u8], type_id: T) -> Self {
        let _ = data;
        Self {
            type_id: type_id.into(),
            present: false,
            data: Default::default(),
        }
    }

    fn found(type_id: u8, data: &'a [u8]) -> Self {
        let mut slices = heapless::Vec::new();
        // Capacity is at least one, this can't fail.
        let _ = slices.push(data);
        Self {
            type_id,
            present: true,
            data: slices,
        }
    }

    fn combine_with(&mut self, other: &TLV<'a>) -> Result<(), TLVError> {
        if self.type_id != other.type_id {
            return Err(TLVError::UnexpectedValue);
        }
        for right in other.data.iter() {
            self.data.push(right).map_err(|_| TLVError::BufferOverrun)?;
        }
        Ok(())
    }

    /// The TLV was found in the buffer, its value may still be empty.
    pub fn is_some(&self) -> bool {
        self.present
    }

    /// The TLV was not found.
    pub fn is_none(&self) -> bool {
        !self.present
    }

    /// Total length of the value, over all segments.
    pub fn len(&self) -> usize {
        self.data.iter().map(|z| z.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Try to interpret the data as a zerocopy-enabled type.
    pub fn try_from<T: TryFromBytes + KnownLayout + Immutable>(&self) -> Result<&T, TLVError> {
        T::try_ref_from_prefix(self.short_data()?)
            .map_err(|_| TLVError::UnexpectedValue)
            .map(|(a, _remaining)| a)
    }

    /// The data of the first segment, this is the full value for anything shorter than 256 bytes.
    pub fn short_data(&self) -> Result<&'a [u8], TLVError> {
        if self.data.len() > 1 {
            return Err(TLVError::UnexpectedValue);
        }
        Ok(self.data.first().copied().unwrap_or(&[]))
    }

    pub fn data_slices(&self) -> heapless::Vec<&'a [u8], TLV_SEGMENTS> {
        self.data.clone()
    }

    /// Interpret the value as an unsigned integer of 1, 2, 4 or 8 bytes.
    pub fn to_u64(&self) -> Result<u64, TLVError> {
        crate::varint::decode(self.short_data()?)
    }

    pub fn to_u32(&self) -> Result<u32, TLVError> {
        u32::try_from(self.to_u64()?).map_err(|_| TLVError::UnexpectedValue)
    }

    pub fn copy_body(&self, mut output: &mut [u8]) -> Result<usize, TLVError> {
        let mut total_length = 0;
        for s in self.data.iter() {
            if s.len() > output.len() {
                return Err(TLVError::BufferOverrun);
            }
            output[0..s.len()].copy_from_slice(s);
            output = &mut output[s.len()..];
            total_length += s.len()
        }
        Ok(total_length)
    }
}

/// Writer for TLV8 sequences, values longer than 255 bytes are split into consecutive segments.
///
/// On an error the contents of the buffer are unspecified, the whole encode should be abandoned.
pub struct TLVWriter<'a> {
    position: usize,
    buffer: &'a mut [u8],
}
impl<'a> TLVWriter<'a> {
    pub fn new(buffer: &'a mut [u8]) -> Self {
        Self::new_at(buffer, 0)
    }
    pub fn new_at(buffer: &'a mut [u8], start: usize) -> Self {
        Self {
            position: start,
            buffer,
        }
    }

    pub fn end(&self) -> usize {
        self.position
    }

    /// Add an unsigned integer, using the smallest width that represents it.
    pub fn add_uint<T: Into<u8>>(mut self, t: T, value: u64) -> Result<Self, TLVError> {
        let mut bytes = [0u8; 8];
        let width = crate::varint::encode_minimal(value, &mut bytes)?;
        self.write_u8s(t.into(), &bytes[0..width])?;
        Ok(self)
    }

    pub fn add_entry<T: Into<u8>, V: IntoBytes + Immutable + ?Sized>(
        self,
        t: T,
        value: &V,
    ) -> Result<Self, TLVError> {
        self.add_slice(t, value.as_bytes())
    }

    pub fn add_slice<T: Into<u8>>(mut self, t: T, value: &[u8]) -> Result<Self, TLVError> {
        self.write_u8s(t.into(), value)?;
        Ok(self)
    }

    /// Add a zero length separator entry, used between items of a list.
    pub fn add_separator<T: Into<u8>>(self, t: T) -> Result<Self, TLVError> {
        self.add_slice(t, &[])
    }

    /// Unused space after the current position.
    ///
    /// Anything written here is overwritten by the next append.
    // HAPTLVWriterGetScratchBytes
    pub fn scratch_bytes(&mut self) -> &mut [u8] {
        &mut self.buffer[self.position..]
    }

    /// Build a structured value through a sub-writer and append it as the value of a single outer entry.
    ///
    /// The nested entries are built in the scratch space, then moved into place, inserting segment headers where
    /// the nested value exceeds 255 bytes.
    pub fn add_nested<T: Into<u8>, F>(mut self, t: T, f: F) -> Result<Self, TLVError>
    where
        F: FnOnce(TLVWriter<'_>) -> Result<usize, TLVError>,
    {
        let tt: u8 = t.into();
        let value_start = self.position + 2;
        if value_start > self.buffer.len() {
            return Err(TLVError::BufferOverrun);
        }
        let nested_length = f(TLVWriter::new(&mut self.buffer[value_start..]))?;

        let segments = nested_length.div_ceil(TLV_SEGMENT_MAX).max(1);
        let total = nested_length + 2 * segments;
        if self.position + total > self.buffer.len() {
            return Err(TLVError::BufferOverrun);
        }

        // Segment i moves up by 2*i bytes, move the last segment first so nothing is clobbered.
        for i in (0..segments).rev() {
            let src_start = value_start + i * TLV_SEGMENT_MAX;
            let this_length = (nested_length - i * TLV_SEGMENT_MAX).min(TLV_SEGMENT_MAX);
            let header = self.position + i * (TLV_SEGMENT_MAX + 2);
            self.buffer
                .copy_within(src_start..src_start + this_length, header + 2);
            self.buffer[header] = tt;
            self.buffer[header + 1] = this_length as u8;
        }
        self.position += total;
        Ok(self)
    }

    fn push_internal<T: IntoBytes + Immutable>(&mut self, value: &T) -> Result<(), TLVError> {
        let as_bytes = value.as_bytes();
        if self.position + as_bytes.len() > self.buffer.len() {
            return Err(TLVError::BufferOverrun);
        }
        self.buffer[self.position..self.position + as_bytes.len()].copy_from_slice(as_bytes);
        self.position += as_bytes.len();
        Ok(())
    }

    // HAPTLVWriterAppend
    fn write_u8s(&mut self, tt: u8, mut values: &[u8]) -> Result<(), TLVError> {
        let mut first = true;
        while !values.is_empty() || first {
            let this_length = values.len().min(TLV_SEGMENT_MAX);
            self.push_internal(&tt)?;
            self.push_internal(&(this_length as u8))?;

            if self.position + this_length > self.buffer.len() {
                return Err(TLVError::BufferOverrun);
            }
            self.buffer[self.position..self.position + this_length]
                .copy_from_slice(&values[0..this_length]);
            self.position += this_length;
            values = &values[this_length..];
            first = false;
        }
        Ok(())
    }
}

/// Helper macro to make typed newtype wrappers around TLV
#[macro_export]
macro_rules! typed_tlv {
    ( $name:ident, $tlv_type:expr  ) => {
        #[derive(PartialEq, Eq, Debug, Clone)]
        pub struct $name<'a>($crate::tlv::TLV<'a>);
        impl<'a> $name<'a> {
            pub fn tied(data: &'a [u8]) -> Self {
                Self($crate::tlv::TLV::tied(data, $tlv_type))
            }
        }
        impl<'a> core::ops::Deref for $name<'a> {
            type Target = $crate::tlv::TLV<'a>;

            fn deref(&self) -> &Self::Target {
                &self.0
            }
        }
        impl<'a> core::ops::DerefMut for $name<'a> {
            fn deref_mut(&mut self) -> &mut Self::Target {
                &mut self.0
            }
        }
    };
}
