//! Managed object model: type descriptors, object headers and references.
//!
//! A user-visible object starts with an [`ObjHeader`], an array with an
//! [`ArrayHeader`]. Both begin with the type descriptor pointer, so any
//! reference can be inspected as an `ObjHeader` to find out which it is.
//! Collector bookkeeping ([`ObjectData`]) lives in front of the header, out of
//! the user's sight; see [`crate::factory`].

use std::fmt;
use std::mem;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicU8, Ordering};

/// Alignment of every user-visible header and of every allocation payload.
pub const OBJECT_ALIGNMENT: usize = 8;

// ============================================================================
// Color / ObjectData
// ============================================================================

/// Mark state of an object.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[repr(u8)]
pub enum Color {
    /// Not (yet) proven reachable. Every object is white between cycles.
    #[default]
    White = 0,
    /// Reached by the current mark phase.
    Black = 1,
}

impl Color {
    const fn from_u8(value: u8) -> Self {
        match value {
            0 => Self::White,
            _ => Self::Black,
        }
    }
}

/// Per-object collector data, stored in front of the object header.
#[derive(Debug, Default)]
#[repr(C)]
pub struct ObjectData {
    color: AtomicU8,
}

impl ObjectData {
    /// Fresh data: white.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            color: AtomicU8::new(Color::White as u8),
        }
    }

    /// Current color.
    #[inline]
    #[must_use]
    pub fn color(&self) -> Color {
        Color::from_u8(self.color.load(Ordering::Relaxed))
    }

    /// Overwrites the color.
    #[inline]
    pub fn set_color(&self, color: Color) {
        self.color.store(color as u8, Ordering::Relaxed);
    }

    /// Turns a white object black. Returns `false` if it already was black.
    #[inline]
    pub fn try_mark_black(&self) -> bool {
        self.color
            .compare_exchange(
                Color::White as u8,
                Color::Black as u8,
                Ordering::Relaxed,
                Ordering::Relaxed,
            )
            .is_ok()
    }
}

// ============================================================================
// TypeInfo
// ============================================================================

/// Finalizer attached to a type. Receives the dying object, which must not be
/// stored anywhere reachable.
pub type FinalizerFn = fn(ObjRef);

/// Shape of instances of a type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InstanceLayout {
    /// A fixed-size object.
    Object {
        /// Size of an instance, header included.
        instance_size: usize,
        /// Byte offsets (from the header) of reference slots.
        reference_offsets: &'static [usize],
        /// Byte offsets of weak reference slots. They are not traced, and are
        /// cleared when their target dies.
        weak_offsets: &'static [usize],
    },
    /// An array of `count` elements of `element_size` bytes.
    Array {
        /// Size of one element.
        element_size: usize,
        /// Whether every element is a reference slot.
        references: bool,
    },
}

/// Type descriptor. Objects point at a `'static` one.
///
/// ```
/// use cms_gc::{ObjHeader, TypeInfo};
///
/// const SLOT: usize = std::mem::size_of::<ObjHeader>();
/// const PAIR_REFS: &[usize] = &[SLOT, SLOT + 8];
/// static PAIR: TypeInfo = TypeInfo::object("Pair", SLOT + 16).with_references(PAIR_REFS);
/// static BYTES: TypeInfo = TypeInfo::array("ByteArray", 1);
///
/// assert!(!PAIR.is_array());
/// assert!(BYTES.is_array());
/// ```
#[derive(Debug, Clone, Copy)]
pub struct TypeInfo {
    name: &'static str,
    layout: InstanceLayout,
    finalizer: Option<FinalizerFn>,
}

impl TypeInfo {
    /// An object type of `instance_size` bytes, header included.
    ///
    /// # Panics
    ///
    /// Panics if `instance_size` is smaller than the header.
    #[must_use]
    pub const fn object(name: &'static str, instance_size: usize) -> Self {
        assert!(
            instance_size >= mem::size_of::<ObjHeader>(),
            "instance size is smaller than the object header"
        );
        Self {
            name,
            layout: InstanceLayout::Object {
                instance_size,
                reference_offsets: &[],
                weak_offsets: &[],
            },
            finalizer: None,
        }
    }

    /// An array type with plain (non-reference) elements.
    #[must_use]
    pub const fn array(name: &'static str, element_size: usize) -> Self {
        Self {
            name,
            layout: InstanceLayout::Array {
                element_size,
                references: false,
            },
            finalizer: None,
        }
    }

    /// An array type whose elements are references.
    #[must_use]
    pub const fn reference_array(name: &'static str) -> Self {
        Self {
            name,
            layout: InstanceLayout::Array {
                element_size: mem::size_of::<Option<ObjRef>>(),
                references: true,
            },
            finalizer: None,
        }
    }

    /// Declares the reference slots of an object type.
    ///
    /// # Panics
    ///
    /// Panics on array types, or if a slot is misaligned or out of bounds.
    #[must_use]
    pub const fn with_references(mut self, offsets: &'static [usize]) -> Self {
        match &mut self.layout {
            InstanceLayout::Object {
                instance_size,
                reference_offsets,
                ..
            } => {
                check_slots(offsets, *instance_size);
                *reference_offsets = offsets;
            }
            InstanceLayout::Array { .. } => panic!("array types describe references per element"),
        }
        self
    }

    /// Declares the weak reference slots of an object type.
    ///
    /// A weak slot does not keep its target alive. When the target is found
    /// unreachable, the collector stores `None` into the slot before any
    /// mutator resumes.
    ///
    /// # Panics
    ///
    /// Panics on array types, or if a slot is misaligned or out of bounds.
    #[must_use]
    pub const fn with_weak_references(mut self, offsets: &'static [usize]) -> Self {
        match &mut self.layout {
            InstanceLayout::Object {
                instance_size,
                weak_offsets,
                ..
            } => {
                check_slots(offsets, *instance_size);
                *weak_offsets = offsets;
            }
            InstanceLayout::Array { .. } => panic!("array types have no weak elements"),
        }
        self
    }

    /// Attaches a finalizer.
    #[must_use]
    pub const fn with_finalizer(mut self, finalizer: FinalizerFn) -> Self {
        self.finalizer = Some(finalizer);
        self
    }

    /// Name, for diagnostics.
    #[must_use]
    pub const fn name(&self) -> &'static str {
        self.name
    }

    /// Instance shape.
    #[must_use]
    pub const fn layout(&self) -> &InstanceLayout {
        &self.layout
    }

    /// Weak reference slots; empty for arrays.
    #[must_use]
    pub const fn weak_offsets(&self) -> &'static [usize] {
        match self.layout {
            InstanceLayout::Object { weak_offsets, .. } => weak_offsets,
            InstanceLayout::Array { .. } => &[],
        }
    }

    /// Returns `true` for array types.
    #[must_use]
    pub const fn is_array(&self) -> bool {
        matches!(self.layout, InstanceLayout::Array { .. })
    }

    /// Returns `true` if instances need finalization.
    #[must_use]
    pub const fn has_finalizer(&self) -> bool {
        self.finalizer.is_some()
    }

    /// The finalizer, if any.
    #[must_use]
    pub const fn finalizer(&self) -> Option<FinalizerFn> {
        self.finalizer
    }
}

const fn check_slots(offsets: &[usize], instance_size: usize) {
    let mut i = 0;
    while i < offsets.len() {
        let offset = offsets[i];
        assert!(
            offset >= mem::size_of::<ObjHeader>(),
            "reference slot overlaps the header"
        );
        assert!(
            offset % mem::align_of::<Option<ObjRef>>() == 0,
            "reference slot is misaligned"
        );
        assert!(
            offset + mem::size_of::<Option<ObjRef>>() <= instance_size,
            "reference slot is out of bounds"
        );
        i += 1;
    }
}

// ============================================================================
// Headers
// ============================================================================

/// Tag in the type pointer of objects living outside the heap.
const PERMANENT_TAG: usize = 1;

const _: () = assert!(mem::align_of::<TypeInfo>() > PERMANENT_TAG);

fn untag(type_info: *const TypeInfo) -> &'static TypeInfo {
    // SAFETY: headers are only constructed from `&'static TypeInfo`, possibly
    // tagged in the low bit.
    unsafe { &*type_info.map_addr(|addr| addr & !PERMANENT_TAG) }
}

/// Header of a user-visible object.
///
/// Objects created by a factory get their header from it. A permanent object
/// lives outside the heap, typically in leaked or static storage, and is never
/// marked, traced, or freed; it may hold references to other permanent objects
/// only, or to heap objects that are rooted some other way.
///
/// ```
/// use std::ptr::NonNull;
/// use cms_gc::{ObjHeader, ObjRef, TypeInfo};
///
/// static UNIT: TypeInfo = TypeInfo::object("Unit", std::mem::size_of::<ObjHeader>());
///
/// let header: &'static mut ObjHeader = Box::leak(Box::new(ObjHeader::permanent(&UNIT)));
/// let unit = unsafe { ObjRef::from_raw(NonNull::from(header)) };
/// assert!(unsafe { unit.header() }.is_permanent());
/// assert_eq!(unsafe { unit.type_info() }.name(), "Unit");
/// ```
#[repr(C, align(8))]
pub struct ObjHeader {
    type_info: *const TypeInfo,
}

/// Header of a user-visible array. Elements follow at
/// `size_of::<ArrayHeader>()`.
#[repr(C, align(8))]
pub struct ArrayHeader {
    type_info: *const TypeInfo,
    count: u32,
}

const _: () = {
    assert!(mem::offset_of!(ObjHeader, type_info) == mem::offset_of!(ArrayHeader, type_info));
    assert!(mem::align_of::<ObjHeader>() == OBJECT_ALIGNMENT);
    assert!(mem::align_of::<ArrayHeader>() == OBJECT_ALIGNMENT);
};

impl ObjHeader {
    pub(crate) const fn new(type_info: &'static TypeInfo) -> Self {
        Self { type_info }
    }

    /// Header of a permanent object of `type_info`.
    ///
    /// # Panics
    ///
    /// Panics if `type_info` is an array type.
    #[must_use]
    pub fn permanent(type_info: &'static TypeInfo) -> Self {
        assert!(!type_info.is_array(), "{} is an array type", type_info.name());
        let type_info: *const TypeInfo = type_info;
        Self {
            type_info: type_info.map_addr(|addr| addr | PERMANENT_TAG),
        }
    }

    /// The object's type.
    #[must_use]
    pub fn type_info(&self) -> &'static TypeInfo {
        untag(self.type_info)
    }

    /// Returns `true` if the object lives outside the heap.
    #[must_use]
    pub fn is_permanent(&self) -> bool {
        self.type_info.addr() & PERMANENT_TAG != 0
    }
}

impl ArrayHeader {
    pub(crate) const fn new(type_info: &'static TypeInfo, count: u32) -> Self {
        Self { type_info, count }
    }

    /// The array's type.
    #[must_use]
    pub fn type_info(&self) -> &'static TypeInfo {
        untag(self.type_info)
    }

    /// Number of elements.
    #[must_use]
    pub const fn count(&self) -> u32 {
        self.count
    }
}

// ============================================================================
// References
// ============================================================================

/// Untyped reference to a managed object or array.
///
/// `ObjRef` is a plain pointer: it does not keep its target alive. Anything the
/// program still needs must be reachable from the roots reported to the
/// collector.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct ObjRef(NonNull<ObjHeader>);

// SAFETY: an `ObjRef` is an address; dereferencing it is unsafe and the caller
// takes responsibility for liveness.
unsafe impl Send for ObjRef {}
// SAFETY: see above.
unsafe impl Sync for ObjRef {}

impl fmt::Debug for ObjRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ObjRef({:p})", self.0)
    }
}

impl ObjRef {
    /// Wraps a raw header pointer.
    ///
    /// # Safety
    ///
    /// `ptr` must point at the header of an object created by this crate.
    #[must_use]
    pub const unsafe fn from_raw(ptr: NonNull<ObjHeader>) -> Self {
        Self(ptr)
    }

    /// Raw header pointer.
    #[must_use]
    pub const fn as_ptr(self) -> *mut ObjHeader {
        self.0.as_ptr()
    }

    /// Shared view of the header.
    ///
    /// # Safety
    ///
    /// The object must be alive.
    #[must_use]
    pub unsafe fn header<'a>(self) -> &'a ObjHeader {
        // SAFETY: guaranteed by the caller.
        unsafe { self.0.as_ref() }
    }

    /// The object's type.
    ///
    /// # Safety
    ///
    /// The object must be alive.
    #[must_use]
    pub unsafe fn type_info(self) -> &'static TypeInfo {
        // SAFETY: guaranteed by the caller.
        unsafe { self.header().type_info() }
    }

    /// Returns `true` if the object is an array.
    ///
    /// # Safety
    ///
    /// The object must be alive.
    #[must_use]
    pub unsafe fn is_array(self) -> bool {
        // SAFETY: guaranteed by the caller.
        unsafe { self.type_info().is_array() }
    }

    /// Views the object as an array.
    ///
    /// # Safety
    ///
    /// The object must be alive.
    ///
    /// # Panics
    ///
    /// Panics if the object is not an array.
    #[must_use]
    pub unsafe fn as_array(self) -> ArrayRef {
        // SAFETY: guaranteed by the caller.
        assert!(unsafe { self.is_array() }, "{self:?} is not an array");
        ArrayRef(self.0.cast())
    }

    /// Reads the reference slot at `offset` bytes from the header.
    ///
    /// # Safety
    ///
    /// The object must be alive and `offset` must be one of its type's
    /// reference or weak offsets.
    #[must_use]
    pub unsafe fn field(self, offset: usize) -> Option<Self> {
        // SAFETY: guaranteed by the caller; slots are aligned by `with_references`.
        unsafe { self.slot(offset).read() }
    }

    /// Writes the reference slot at `offset` bytes from the header.
    ///
    /// # Safety
    ///
    /// Same as [`ObjRef::field`]. Mutators may only write while runnable.
    pub unsafe fn set_field(self, offset: usize, value: Option<Self>) {
        // SAFETY: guaranteed by the caller.
        unsafe { self.slot(offset).write(value) };
    }

    /// Address of the object body (the first byte after the header).
    #[must_use]
    pub fn body(self) -> NonNull<u8> {
        // SAFETY: every instance is at least header-sized.
        unsafe { self.0.cast::<u8>().add(mem::size_of::<ObjHeader>()) }
    }

    unsafe fn slot(self, offset: usize) -> *mut Option<Self> {
        debug_assert_eq!(offset % mem::align_of::<Option<Self>>(), 0);
        // SAFETY: caller keeps `offset` inside the instance.
        unsafe { self.0.as_ptr().cast::<u8>().add(offset).cast::<Option<Self>>() }
    }
}

/// Reference to a managed array.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct ArrayRef(NonNull<ArrayHeader>);

// SAFETY: same reasoning as `ObjRef`.
unsafe impl Send for ArrayRef {}
// SAFETY: same reasoning as `ObjRef`.
unsafe impl Sync for ArrayRef {}

impl fmt::Debug for ArrayRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ArrayRef({:p})", self.0)
    }
}

impl ArrayRef {
    /// Wraps a raw array header pointer.
    ///
    /// # Safety
    ///
    /// `ptr` must point at the header of an array created by this crate.
    #[must_use]
    pub const unsafe fn from_raw(ptr: NonNull<ArrayHeader>) -> Self {
        Self(ptr)
    }

    /// Raw header pointer.
    #[must_use]
    pub const fn as_ptr(self) -> *mut ArrayHeader {
        self.0.as_ptr()
    }

    /// The same array as an untyped reference.
    #[must_use]
    pub const fn as_obj(self) -> ObjRef {
        ObjRef(self.0.cast())
    }

    /// Shared view of the header.
    ///
    /// # Safety
    ///
    /// The array must be alive.
    #[must_use]
    pub unsafe fn header<'a>(self) -> &'a ArrayHeader {
        // SAFETY: guaranteed by the caller.
        unsafe { self.0.as_ref() }
    }

    /// Number of elements.
    ///
    /// # Safety
    ///
    /// The array must be alive.
    #[must_use]
    pub unsafe fn count(self) -> u32 {
        // SAFETY: guaranteed by the caller.
        unsafe { self.header().count() }
    }

    /// Address of element `index`.
    ///
    /// # Safety
    ///
    /// The array must be alive.
    ///
    /// # Panics
    ///
    /// Panics if `index` is out of bounds.
    #[must_use]
    pub unsafe fn element(self, index: usize) -> NonNull<u8> {
        // SAFETY: guaranteed by the caller.
        let header = unsafe { self.header() };
        assert!(
            index < header.count() as usize,
            "index {index} out of bounds for array of {}",
            header.count()
        );
        let element_size = match header.type_info().layout() {
            InstanceLayout::Array { element_size, .. } => *element_size,
            InstanceLayout::Object { .. } => unreachable!("array header with object type"),
        };
        // SAFETY: the element lies inside the allocation sized for `count` elements.
        unsafe {
            self.0
                .cast::<u8>()
                .add(mem::size_of::<ArrayHeader>() + index * element_size)
        }
    }

    /// Reads reference element `index`.
    ///
    /// # Safety
    ///
    /// The array must be alive and of a reference-array type.
    #[must_use]
    pub unsafe fn get(self, index: usize) -> Option<ObjRef> {
        // SAFETY: guaranteed by the caller.
        unsafe { self.element(index).cast::<Option<ObjRef>>().read() }
    }

    /// Writes reference element `index`.
    ///
    /// # Safety
    ///
    /// Same as [`ArrayRef::get`].
    pub unsafe fn set(self, index: usize, value: Option<ObjRef>) {
        // SAFETY: guaranteed by the caller.
        unsafe { self.element(index).cast::<Option<ObjRef>>().write(value) };
    }
}

/// Calls `visit` for every non-null reference stored in `object`, as described
/// by its [`TypeInfo`].
///
/// # Safety
///
/// `object` must be alive.
pub unsafe fn for_each_field_reference(object: ObjRef, visit: &mut dyn FnMut(ObjRef)) {
    // SAFETY: guaranteed by the caller.
    let type_info = unsafe { object.type_info() };
    match type_info.layout() {
        InstanceLayout::Object {
            reference_offsets, ..
        } => {
            for &offset in *reference_offsets {
                // SAFETY: `offset` is a declared reference slot.
                if let Some(target) = unsafe { object.field(offset) } {
                    visit(target);
                }
            }
        }
        InstanceLayout::Array {
            references: true, ..
        } => {
            // SAFETY: guaranteed by the caller.
            let array = unsafe { object.as_array() };
            // SAFETY: guaranteed by the caller.
            for index in 0..unsafe { array.count() } as usize {
                // SAFETY: reference array, in-bounds index.
                if let Some(target) = unsafe { array.get(index) } {
                    visit(target);
                }
            }
        }
        InstanceLayout::Array {
            references: false, ..
        } => {}
    }
}
