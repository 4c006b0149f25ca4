use crate::ieee754;
use core::ops::Range;
use keel_buf::OutBuf;
use thiserror::Error;

/// Deepest nesting of arrays, maps and byte string wraps in one encoding.
/// The tracking stack is sized by this, so it must stay small enough for
/// the whole [`Encoder`] to live on the stack of a constrained caller.
pub const MAX_NESTING: usize = 10;

/// Ceiling on the number of individual items recorded against a single
/// array or map. Keeps the per-level count in 16 bits.
pub const MAX_ITEM_COUNT: u16 = u16::MAX;

mod major {
    pub const UNSIGNED: u8 = 0;
    pub const NEGATIVE: u8 = 1;
    pub const BYTES: u8 = 2;
    pub const TEXT: u8 = 3;
    pub const ARRAY: u8 = 4;
    pub const MAP: u8 = 5;
    pub const TAG: u8 = 6;
    pub const SIMPLE: u8 = 7;

    /// Not a wire value. Routes pre-encoded CBOR through the string path
    /// with no header of its own.
    pub const RAW: u8 = 9;
}

const SIMPLE_FALSE: u8 = 20;
const SIMPLE_NULL: u8 = 22;
const SIMPLE_UNDEFINED: u8 = 23;

#[derive(Error, Debug, Copy, Clone, PartialEq, Eq)]
pub enum Error {
    #[error("Output storage is larger than the addressable offset range")]
    BufferTooLarge,

    #[error("Encoded output does not fit in the output storage")]
    BufferTooSmall,

    #[error("Arrays and maps nested deeper than the supported maximum")]
    NestingTooDeep,

    #[error("Too many items added to a single array or map")]
    ArrayTooLong,

    #[error("More closes than opens")]
    TooManyCloses,

    #[error("Close type does not match the innermost open container")]
    CloseMismatch,

    #[error("An array, map or byte string wrap is still open")]
    StillOpen,

    #[error("Simple value is not one of false, true, null or undefined")]
    BadSimple,
}

/*
 * Every CBOR item starts with a type and a number: the value itself for
 * integers, the content length for strings, the item count for arrays and
 * maps, the tag number for tags. The top three bits of the initial byte
 * carry the major type; the low five carry the number when it fits below
 * 24, or one of the markers 24..=27 selecting 1, 2, 4 or 8 trailing
 * big-endian bytes.
 *
 * The ladder below always picks the narrowest representation, which is
 * what canonical CBOR requires. `min_width` forces a wider one: a float
 * whose trailing bytes happen to be zero must still be emitted at the
 * full width of its format.
 *
 * The header is built in a local array and spliced in one call, so a
 * partial header can never land in the output, and an insert anywhere
 * below the end slides the tail right.
 */
fn insert_type_and_number(buf: &mut OutBuf, major: u8, min_width: usize, number: u64, offset: usize) {
    let major = major << 5;
    let mut bytes = [0u8; 9];
    let len;
    if number > 0xFFFF_FFFF || min_width >= 8 {
        bytes[0] = major | 27;
        bytes[1..9].copy_from_slice(&number.to_be_bytes());
        len = 9;
    } else if number > 0xFFFF || min_width >= 4 {
        bytes[0] = major | 26;
        bytes[1..5].copy_from_slice(&(number as u32).to_be_bytes());
        len = 5;
    } else if number > 0xFF || min_width >= 2 {
        bytes[0] = major | 25;
        bytes[1..3].copy_from_slice(&(number as u16).to_be_bytes());
        len = 3;
    } else if number >= 24 {
        bytes[0] = major | 24;
        bytes[1] = number as u8;
        len = 2;
    } else {
        bytes[0] = major | number as u8;
        len = 1;
    }
    buf.insert(&bytes[..len], offset);
}

fn append_type_and_number(buf: &mut OutBuf, major: u8, number: u64) {
    insert_type_and_number(buf, major, 0, number, buf.len())
}

#[derive(Clone, Copy, Default)]
struct Level {
    major: u8,
    start: u32,
    count: u16,
}

/*
 * A container's count or byte length appears in its header, before its
 * contents, but the contents are streamed in first. So opening a container
 * writes nothing; it records where the container started, and the header
 * is inserted there at close time. This stack holds one record per open
 * container.
 *
 * Slot 0 is an implied array that is never emitted. It exists so items
 * added at the top level are counted through the same path as nested ones.
 */
struct Nesting {
    levels: [Level; MAX_NESTING + 1],
    depth: usize,
}

impl Nesting {
    fn new() -> Self {
        let mut levels = [Level::default(); MAX_NESTING + 1];
        levels[0].major = major::ARRAY;
        Self { levels, depth: 0 }
    }

    fn open(&mut self, major: u8, start: u32) -> Result<(), Error> {
        if self.depth == MAX_NESTING {
            return Err(Error::NestingTooDeep);
        }
        debug_assert!(start >= self.levels[self.depth].start);
        self.depth += 1;
        self.levels[self.depth] = Level {
            major,
            start,
            count: 0,
        };
        Ok(())
    }

    fn close(&mut self) {
        debug_assert!(self.depth > 0);
        self.depth -= 1;
    }

    fn increment(&mut self, n: u16) -> Result<(), Error> {
        let level = &mut self.levels[self.depth];
        if n >= MAX_ITEM_COUNT - level.count {
            return Err(Error::ArrayTooLong);
        }
        level.count += n;
        Ok(())
    }

    // The recorded count is always individual items, but a map's wire
    // field counts pairs. The map major type sits one above array, so the
    // subtraction yields the divisor without a branch: 1 for arrays and
    // byte string wraps, 2 for maps.
    fn count(&self) -> u16 {
        let level = &self.levels[self.depth];
        level.count / (level.major.saturating_sub(major::ARRAY) + 1) as u16
    }

    fn start(&self) -> u32 {
        self.levels[self.depth].start
    }

    fn major(&self) -> u8 {
        self.levels[self.depth].major
    }

    fn in_nest(&self) -> bool {
        self.depth != 0
    }
}

/// An offset range over one closed item in the output, taken so the bytes
/// can be hashed or compared while encoding continues.
///
/// Closing an outer container later slides those very bytes right, so the
/// wrap is pinned to the buffer generation it was taken at and resolves to
/// nothing once any mutation has happened since. See [`Encoder::wrapped`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Wrap {
    range: Range<usize>,
    generation: u32,
}

impl Wrap {
    pub fn range(&self) -> Range<usize> {
        self.range.clone()
    }
}

/*
 * Error tracking: errors are recorded in `err` and not reported until
 * finish(). Every operation checks the slot first and does nothing when
 * an error is already down, so a failed session never corrupts what was
 * written before the failure. Only one code survives a session; where an
 * operation deliberately writes over an earlier one it says so below.
 *
 * The buffer tracks its own overflow the same way, and is only asked at
 * finish(). That one check covers every append and insert, because the
 * buffer guarantees it never writes past the caller's storage even after
 * it has refused something.
 */
pub struct Encoder<'a> {
    buf: OutBuf<'a>,
    nesting: Nesting,
    err: Option<Error>,
}

impl<'a> Encoder<'a> {
    /// Encode into `storage`. Storage larger than the `u32` offset range
    /// used by the nesting records is rejected; the error surfaces at
    /// [`Encoder::finish`] like every other.
    pub fn new(storage: &'a mut [u8]) -> Self {
        let err = (storage.len() > u32::MAX as usize).then_some(Error::BufferTooLarge);
        Self {
            buf: OutBuf::new(storage),
            nesting: Nesting::new(),
            err,
        }
    }

    /// Current end of the written output.
    pub fn offset(&self) -> usize {
        self.buf.len()
    }

    pub fn emit_uint(&mut self, value: u64) {
        if self.err.is_some() {
            return;
        }
        append_type_and_number(&mut self.buf, major::UNSIGNED, value);
        self.count_one();
    }

    pub fn emit_int(&mut self, value: i64) {
        if self.err.is_some() {
            return;
        }
        // A negative value is encoded as the magnitude -value - 1 under
        // its own major type; -1 is 0x20.
        let (major, magnitude) = if value < 0 {
            (major::NEGATIVE, value.unsigned_abs() - 1)
        } else {
            (major::UNSIGNED, value as u64)
        };
        append_type_and_number(&mut self.buf, major, magnitude);
        self.count_one();
    }

    pub fn emit_bytes(&mut self, bytes: &[u8]) {
        self.emit_buffer(major::BYTES, bytes)
    }

    pub fn emit_text(&mut self, text: &str) {
        self.emit_buffer(major::TEXT, text.as_bytes())
    }

    /// Splice fully-formed, already-encoded CBOR in verbatim. No header is
    /// written; the fragment counts as one item of the open container.
    pub fn emit_encoded(&mut self, cbor: &[u8]) {
        self.emit_buffer(major::RAW, cbor)
    }

    fn emit_buffer(&mut self, major: u8, bytes: &[u8]) {
        // Container starts are tracked as u32 offsets, so content at or
        // over that range can never be encoded correctly. This guard runs
        // even over an earlier recorded error and writes over it.
        if bytes.len() >= u32::MAX as usize {
            self.err = Some(Error::BufferTooLarge);
            return;
        }
        if self.err.is_some() {
            return;
        }
        if major != major::RAW {
            append_type_and_number(&mut self.buf, major, bytes.len() as u64);
        }
        self.buf.append(bytes);
        self.count_one();
    }

    /// Tags attach to the item that follows, so a tag is not counted as an
    /// item of the open container.
    pub fn emit_tag(&mut self, tag: u64) {
        if self.err.is_some() {
            return;
        }
        append_type_and_number(&mut self.buf, major::TAG, tag);
    }

    /// Tag 1 epoch date.
    pub fn emit_date_epoch(&mut self, seconds: i64) {
        self.emit_tag(1);
        self.emit_int(seconds);
    }

    /// Emit a float with the fewest bytes that reproduce `value` exactly.
    pub fn emit_double(&mut self, value: f64) {
        let smallest = ieee754::smallest(value);
        self.emit_type7(smallest.width, smallest.bits);
    }

    /// One of the four assigned simple values, 20..=23. Anything else in
    /// the simple space is either a bool/null/undefined with a dedicated
    /// method here, reserved, or unassigned, and is refused. Like the
    /// oversized-buffer guard, the refusal writes over an earlier error.
    pub fn emit_simple(&mut self, value: u8) {
        if !(SIMPLE_FALSE..=SIMPLE_UNDEFINED).contains(&value) {
            self.err = Some(Error::BadSimple);
            return;
        }
        self.emit_type7(0, value as u64);
    }

    pub fn emit_bool(&mut self, value: bool) {
        self.emit_simple(SIMPLE_FALSE + value as u8)
    }

    pub fn emit_null(&mut self) {
        self.emit_simple(SIMPLE_NULL)
    }

    pub fn emit_undefined(&mut self) {
        self.emit_simple(SIMPLE_UNDEFINED)
    }

    fn emit_type7(&mut self, min_width: usize, bits: u64) {
        if self.err.is_some() {
            return;
        }
        let end = self.buf.len();
        insert_type_and_number(&mut self.buf, major::SIMPLE, min_width, bits, end);
        self.count_one();
    }

    pub fn open_array(&mut self) {
        self.open(major::ARRAY)
    }

    pub fn open_map(&mut self) {
        self.open(major::MAP)
    }

    /// Open a byte string whose content is whatever is encoded until the
    /// matching [`Encoder::close_bytes`]. The closed span can then be
    /// hashed or signed as an opaque blob and re-hashed verbatim by a
    /// verifier.
    pub fn open_bytes(&mut self) {
        self.open(major::BYTES)
    }

    fn open(&mut self, major: u8) {
        if self.err.is_some() {
            return;
        }
        // The new container is one item from where its parent stands.
        if let Err(e) = self.nesting.increment(1) {
            self.err = Some(e);
            return;
        }
        // Nothing is written yet. The count or byte length is unknown
        // until close, so only the start offset is recorded; the header
        // is inserted there later.
        if let Err(e) = self.nesting.open(major, self.buf.len() as u32) {
            self.err = Some(e);
        }
    }

    pub fn close_array(&mut self) {
        self.close(major::ARRAY);
    }

    pub fn close_map(&mut self) {
        self.close(major::MAP);
    }

    /// Close a byte string wrap, returning the offsets of the complete
    /// item, header included. `None` means the close did not happen or the
    /// output is already known to be incomplete; the reason surfaces at
    /// [`Encoder::finish`].
    pub fn close_bytes(&mut self) -> Option<Wrap> {
        self.close(major::BYTES)
    }

    fn close(&mut self, major: u8) -> Option<Wrap> {
        if self.err.is_some() {
            return None;
        }
        if !self.nesting.in_nest() {
            self.err = Some(Error::TooManyCloses);
            return None;
        }
        if self.nesting.major() != major {
            self.err = Some(Error::CloseMismatch);
            return None;
        }

        let start = self.nesting.start() as usize;
        let end = self.buf.len();
        let span = end - start;

        // A byte string wrap takes the exact byte span of its content;
        // arrays and maps take the item or pair count.
        let length = if major == major::BYTES {
            span as u64
        } else {
            self.nesting.count() as u64
        };

        // Everything written since the open slides right to make room.
        insert_type_and_number(&mut self.buf, major, 0, length, start);
        self.nesting.close();

        if self.buf.has_overflowed() {
            return None;
        }
        let header = self.buf.len() - end;
        Some(Wrap {
            range: start..start + header + span,
            generation: self.buf.generation(),
        })
    }

    /// Resolve a [`Wrap`] against the live output. `None` once any later
    /// call has moved the bytes it addressed.
    pub fn wrapped(&self, wrap: &Wrap) -> Option<&[u8]> {
        if wrap.generation != self.buf.generation() {
            return None;
        }
        self.buf.as_ref().get(wrap.range())
    }

    fn count_one(&mut self) {
        if let Err(e) = self.nesting.increment(1) {
            self.err = Some(e);
        }
    }

    /// The finished encoding. This is where a session's one recorded
    /// error comes out: anything recorded during encoding first, then
    /// unbalanced opens, then the buffer's overflow flag.
    pub fn finish(self) -> Result<&'a [u8], Error> {
        if let Some(err) = self.err {
            return Err(err);
        }
        if self.nesting.in_nest() {
            return Err(Error::StillOpen);
        }
        if self.buf.has_overflowed() {
            return Err(Error::BufferTooSmall);
        }
        let (storage, len) = self.buf.into_inner();
        Ok(&storage[..len])
    }

    /// [`Encoder::finish`], discarding everything but the length.
    pub fn finish_len(self) -> Result<usize, Error> {
        self.finish().map(<[u8]>::len)
    }
}
