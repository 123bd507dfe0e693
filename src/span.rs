use core::ops::Range;

/// Represents an interval of memory `[base, acme)`.
///
/// The heap uses a [`Span`] to track the extent of its arena, and
/// [`SpanSource`](crate::source::SpanSource) uses one to describe the
/// memory it hands out.
///
/// # Empty Spans
/// Where `base >= acme`, the [`Span`] is empty, in which case
/// the specific values of `base` and `acme` are considered meaningless.
/// * Empty spans contain nothing.
/// * Empty spans are equal to each other.
#[derive(Clone, Copy, Hash)]
pub struct Span {
    base: *mut u8,
    acme: *mut u8,
}

unsafe impl Send for Span {}

impl Default for Span {
    fn default() -> Self {
        Self::empty()
    }
}

impl core::fmt::Debug for Span {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_fmt(format_args!("{:p}..[{}]..{:p}", self.base, self.size(), self.acme))
    }
}

impl core::fmt::Display for Span {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self.get_base_acme() {
            Some((base, acme)) => f.write_fmt(format_args!("{:p}..{:p}", base, acme)),
            None => f.write_str("Empty Span"),
        }
    }
}

impl From<Range<*mut u8>> for Span {
    fn from(value: Range<*mut u8>) -> Self {
        Self { base: value.start, acme: value.end }
    }
}

impl From<&mut [u8]> for Span {
    fn from(value: &mut [u8]) -> Self {
        Self::from(value.as_mut_ptr_range())
    }
}

impl From<*mut [u8]> for Span {
    fn from(value: *mut [u8]) -> Self {
        let base = value.cast::<u8>();
        Self { base, acme: base.wrapping_add(value.len()) }
    }
}

impl PartialEq for Span {
    fn eq(&self, other: &Self) -> bool {
        self.is_empty() && other.is_empty() || self.base == other.base && self.acme == other.acme
    }
}
impl Eq for Span {}

impl Span {
    /// Create an empty span.
    #[inline]
    pub const fn empty() -> Self {
        Self { base: core::ptr::null_mut(), acme: core::ptr::null_mut() }
    }

    /// Create a new span.
    #[inline]
    pub const fn new(base: *mut u8, acme: *mut u8) -> Self {
        Self { base, acme }
    }

    /// Creates a [`Span`] given a `base` and a `size`.
    ///
    /// If `base + size` overflows, the result is empty.
    #[inline]
    pub fn from_base_size(base: *mut u8, size: usize) -> Self {
        match (base as usize).checked_add(size) {
            Some(_) => Self { base, acme: base.wrapping_add(size) },
            None => Self::empty(),
        }
    }

    /// Returns whether `base >= acme`.
    #[inline]
    pub fn is_empty(self) -> bool {
        self.acme <= self.base
    }

    /// Returns the size of the span, else zero if `base >= acme`.
    #[inline]
    pub fn size(self) -> usize {
        if self.is_empty() { 0 } else { self.acme as usize - self.base as usize }
    }

    /// If `self` isn't empty, returns `(base, acme)`.
    #[inline]
    pub fn get_base_acme(self) -> Option<(*mut u8, *mut u8)> {
        if self.is_empty() { None } else { Some((self.base, self.acme)) }
    }

    #[inline]
    pub const fn base(self) -> *mut u8 {
        self.base
    }

    #[inline]
    pub const fn acme(self) -> *mut u8 {
        self.acme
    }

    /// Returns whether `self` contains `ptr`.
    #[inline]
    pub fn contains(self, ptr: *const u8) -> bool {
        !self.is_empty() && self.base as usize <= ptr as usize && (ptr as usize) < self.acme as usize
    }

    /// Returns the offset of `ptr` from `base`, if `self` contains `ptr`.
    #[inline]
    pub fn offset_of(self, ptr: *const u8) -> Option<usize> {
        if self.contains(ptr) { Some(ptr as usize - self.base as usize) } else { None }
    }

    /// Moves `acme` up by `size` bytes.
    #[inline]
    pub fn extend(self, size: usize) -> Self {
        Self { base: self.base, acme: self.acme.wrapping_add(size) }
    }

    /// Moves `acme` down by `size` bytes.
    #[inline]
    pub fn truncate(self, size: usize) -> Self {
        Self { base: self.base, acme: self.acme.wrapping_sub(size) }
    }
}
