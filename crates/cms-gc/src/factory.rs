//! Object factory: typed allocation on top of [`crate::storage`].
//!
//! Every payload starts with collector data followed by the user-visible
//! header:
//!
//! ```text
//! Node | HeapObjHeader  { gc_data, ObjHeader   } | fields...
//! Node | HeapArrayHeader{ gc_data, ArrayHeader } | elements...
//! ```
//!
//! Both heap headers place `gc_data` and the user header at the same offsets,
//! so a [`NodeRef`] recovered from either kind of reference reads its color the
//! same way.

use std::marker::PhantomData;
use std::mem::{self, offset_of};
use std::ptr::{self, NonNull};
use std::sync::Arc;

use crate::alloc::{align_up, AlignedAllocator, ByteAllocator};
use crate::gc::finalizer::FinalizerHooks;
use crate::object::{
    ArrayHeader, ArrayRef, InstanceLayout, ObjHeader, ObjRef, ObjectData, TypeInfo,
    OBJECT_ALIGNMENT,
};
use crate::storage::{self, Consumer, NodePtr, ObjectFactoryStorage, Producer};

/// Storage specialised for heap objects.
pub type Storage<A = AlignedAllocator> = ObjectFactoryStorage<OBJECT_ALIGNMENT, A>;

#[repr(C)]
struct HeapObjHeader {
    gc_data: ObjectData,
    object: ObjHeader,
}

#[repr(C)]
struct HeapArrayHeader {
    gc_data: ObjectData,
    array: ArrayHeader,
}

const _: () = {
    assert!(offset_of!(HeapObjHeader, gc_data) == offset_of!(HeapArrayHeader, gc_data));
    assert!(offset_of!(HeapObjHeader, object) == offset_of!(HeapArrayHeader, array));
    assert!(mem::align_of::<HeapObjHeader>() <= OBJECT_ALIGNMENT);
    assert!(mem::align_of::<HeapArrayHeader>() <= OBJECT_ALIGNMENT);
};

/// Offset of the user-visible header inside a payload.
const HEADER_OFFSET: usize = offset_of!(HeapObjHeader, object);

// ============================================================================
// NodeRef
// ============================================================================

/// Handle to the node behind a managed object or array.
///
/// The lifetime is the borrow of the list the node was reached through (a
/// thread queue, the locked heap, or a finalizer queue). Nothing can free the
/// node while that borrow lasts.
///
/// ```
/// use cms_gc::{AlignedAllocator, ObjHeader, ObjectFactory, ThreadQueue, TypeInfo};
///
/// static CELL: TypeInfo = TypeInfo::object("Cell", std::mem::size_of::<ObjHeader>());
///
/// let factory = ObjectFactory::<AlignedAllocator>::new();
/// let mut queue = ThreadQueue::new(&factory);
/// let cell = queue.create_object(&CELL);
/// let node = queue.iter().next().unwrap();
/// assert_eq!(node.as_obj(), cell);
/// queue.publish();
/// ```
///
/// A handle cannot outlive the borrow, so the queue cannot change under it:
///
/// ```compile_fail
/// use cms_gc::{AlignedAllocator, ObjHeader, ObjectFactory, ThreadQueue, TypeInfo};
///
/// static CELL: TypeInfo = TypeInfo::object("Cell", std::mem::size_of::<ObjHeader>());
///
/// let factory = ObjectFactory::<AlignedAllocator>::new();
/// let mut queue = ThreadQueue::new(&factory);
/// queue.create_object(&CELL);
/// let node = queue.iter().next().unwrap();
/// queue.publish();
/// node.is_array();
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NodeRef<'a> {
    node: NodePtr<OBJECT_ALIGNMENT>,
    _list: PhantomData<&'a ()>,
}

impl NodeRef<'_> {
    const fn new(node: NodePtr<OBJECT_ALIGNMENT>) -> Self {
        Self {
            node,
            _list: PhantomData,
        }
    }

    /// Recovers the node of an object.
    ///
    /// Works for arrays too, since both header shapes agree on the offset.
    ///
    /// # Safety
    ///
    /// `object` must have been created by an [`ObjectFactory`], and its node
    /// must stay allocated for as long as the returned handle is used.
    #[must_use]
    pub unsafe fn from_object(object: ObjRef) -> Self {
        // SAFETY: the user header sits `HEADER_OFFSET` bytes into a payload.
        let data = unsafe {
            NonNull::new_unchecked(object.as_ptr().cast::<u8>()).sub(HEADER_OFFSET)
        };
        // SAFETY: `data` is the payload of a live node.
        let node = Self::new(unsafe { NodePtr::from_data(data) });
        assert!(
            ptr::eq(node.object_ptr(), object.as_ptr()),
            "object header layout has broken"
        );
        node
    }

    /// Recovers the node of an array.
    ///
    /// # Safety
    ///
    /// Same as [`NodeRef::from_object`].
    #[must_use]
    pub unsafe fn from_array(array: ArrayRef) -> Self {
        // SAFETY: forwarded.
        unsafe { Self::from_object(array.as_obj()) }
    }

    /// Collector data, read the same way for objects and arrays.
    #[must_use]
    pub fn gc_object_data(&self) -> &ObjectData {
        // SAFETY: `gc_data` is at offset 0 of both heap headers.
        unsafe { &(*self.heap_object()).gc_data }
    }

    /// Returns `true` if the node holds an array.
    #[must_use]
    pub fn is_array(&self) -> bool {
        // SAFETY: the node holds a constructed header.
        unsafe { self.as_obj().is_array() }
    }

    /// Reference to the object or array, as an untyped object.
    #[must_use]
    pub fn as_obj(&self) -> ObjRef {
        // SAFETY: the pointer is inside a live payload, hence non-null.
        unsafe { ObjRef::from_raw(NonNull::new_unchecked(self.object_ptr())) }
    }

    /// The object header.
    ///
    /// # Panics
    ///
    /// Panics if the node holds an array.
    #[must_use]
    pub fn obj_header(&self) -> ObjRef {
        assert!(!self.is_array(), "node holds an array");
        self.as_obj()
    }

    /// The array header.
    ///
    /// # Panics
    ///
    /// Panics if the node holds an object.
    #[must_use]
    pub fn array_header(&self) -> ArrayRef {
        // SAFETY: the node holds a constructed header.
        unsafe { self.as_obj().as_array() }
    }

    /// The underlying storage node.
    #[must_use]
    pub const fn node(&self) -> NodePtr<OBJECT_ALIGNMENT> {
        self.node
    }

    fn heap_object(&self) -> *mut HeapObjHeader {
        self.node.data().cast::<HeapObjHeader>().as_ptr()
    }

    fn object_ptr(&self) -> *mut ObjHeader {
        // SAFETY: offset inside the payload.
        unsafe { self.node.data().as_ptr().add(HEADER_OFFSET).cast::<ObjHeader>() }
    }
}

// ============================================================================
// ObjectFactory
// ============================================================================

/// The global heap. Cheap to share: all handles point at one storage.
pub struct ObjectFactory<A: ByteAllocator = AlignedAllocator> {
    storage: Arc<Storage<A>>,
}

impl<A: ByteAllocator> ObjectFactory<A> {
    /// Creates an empty heap.
    #[must_use]
    pub fn new() -> Self {
        Self {
            storage: Arc::new(Storage::new()),
        }
    }

    /// Locks the heap for iteration. Publishing blocks meanwhile.
    pub fn lock_for_iter(&self) -> FactoryIterable<'_, A> {
        FactoryIterable {
            inner: self.storage.lock_for_iter(),
        }
    }

    /// Number of published objects and arrays.
    #[must_use]
    pub fn len(&self) -> usize {
        self.storage.len()
    }

    /// Returns `true` if no object is published.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.storage.is_empty()
    }

    /// Frees every published node without finalization.
    #[cfg(any(test, feature = "test-util"))]
    pub fn clear_for_tests(&self) {
        self.storage.clear_for_tests();
    }
}

impl<A: ByteAllocator> Default for ObjectFactory<A> {
    fn default() -> Self {
        Self::new()
    }
}

/// Locked view of the heap.
pub struct FactoryIterable<'a, A: ByteAllocator> {
    inner: storage::Iterable<'a, OBJECT_ALIGNMENT, A>,
}

impl<A: ByteAllocator> FactoryIterable<'_, A> {
    /// Number of published nodes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.len()
    }

    /// Returns `true` if the heap is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }

    /// Read-only iteration.
    pub fn iter(&self) -> impl Iterator<Item = NodeRef<'_>> + '_ {
        self.inner.iter().map(NodeRef::new)
    }

    /// Cursor supporting in-place removal.
    pub fn cursor(&mut self) -> FactoryCursor<'_, A> {
        FactoryCursor {
            inner: self.inner.cursor(),
        }
    }
}

/// Cursor over a locked heap.
pub struct FactoryCursor<'b, A: ByteAllocator> {
    inner: storage::Cursor<'b, OBJECT_ALIGNMENT, A>,
}

impl<A: ByteAllocator> FactoryCursor<'_, A> {
    /// The node under the cursor.
    #[must_use]
    pub fn current(&self) -> Option<NodeRef<'_>> {
        self.inner.current().map(NodeRef::new)
    }

    /// Steps to the next node.
    pub fn advance(&mut self) {
        self.inner.advance();
    }

    /// Frees the current node and steps past it.
    pub fn erase_and_advance(&mut self) {
        self.inner.erase_and_advance();
    }

    /// Moves the current node into `queue` and steps past it.
    pub fn move_and_advance(&mut self, queue: &mut FinalizerQueue<A>) {
        self.inner.move_and_advance(&mut queue.consumer);
    }
}

// ============================================================================
// ThreadQueue
// ============================================================================

/// Per-thread allocation queue.
pub struct ThreadQueue<A: ByteAllocator = AlignedAllocator> {
    producer: Producer<OBJECT_ALIGNMENT, A>,
}

impl<A: ByteAllocator> ThreadQueue<A> {
    /// Creates an empty queue publishing into `owner`.
    #[must_use]
    pub fn new(owner: &ObjectFactory<A>) -> Self {
        Self {
            producer: Producer::new(Arc::clone(&owner.storage)),
        }
    }

    /// Node size an object of `type_info` occupies.
    #[must_use]
    pub fn object_allocated_size(type_info: &TypeInfo) -> usize {
        storage::Node::<OBJECT_ALIGNMENT>::size_and_alignment_for_data_size(
            Self::object_allocated_data_size(type_info),
        )
        .0
    }

    /// Node size an array of `count` elements of `type_info` occupies.
    #[must_use]
    pub fn array_allocated_size(type_info: &TypeInfo, count: u32) -> usize {
        storage::Node::<OBJECT_ALIGNMENT>::size_and_alignment_for_data_size(
            Self::array_allocated_data_size(type_info, count),
        )
        .0
    }

    /// Allocates an object, or returns `None` if the allocator is exhausted.
    ///
    /// # Panics
    ///
    /// Panics if `type_info` describes an array.
    pub fn try_create_object(&mut self, type_info: &'static TypeInfo) -> Option<ObjRef> {
        let size = Self::object_allocated_data_size(type_info);
        let node = self.producer.try_insert(size)?;
        Some(Self::construct_object(node, type_info, size))
    }

    /// Allocates an object. Allocator exhaustion is fatal.
    ///
    /// # Panics
    ///
    /// Panics if `type_info` describes an array.
    pub fn create_object(&mut self, type_info: &'static TypeInfo) -> ObjRef {
        let size = Self::object_allocated_data_size(type_info);
        let node = self.producer.insert(size);
        Self::construct_object(node, type_info, size)
    }

    /// Allocates an array, or returns `None` if the allocator is exhausted.
    ///
    /// # Panics
    ///
    /// Panics if `type_info` does not describe an array.
    pub fn try_create_array(
        &mut self,
        type_info: &'static TypeInfo,
        count: u32,
    ) -> Option<ArrayRef> {
        let size = Self::array_allocated_data_size(type_info, count);
        let node = self.producer.try_insert(size)?;
        Some(Self::construct_array(node, type_info, count, size))
    }

    /// Allocates an array. Allocator exhaustion is fatal.
    ///
    /// # Panics
    ///
    /// Panics if `type_info` does not describe an array.
    pub fn create_array(&mut self, type_info: &'static TypeInfo, count: u32) -> ArrayRef {
        let size = Self::array_allocated_data_size(type_info, count);
        let node = self.producer.insert(size);
        Self::construct_array(node, type_info, count, size)
    }

    /// Makes every allocation of this queue visible to the collector.
    pub fn publish(&mut self) {
        self.producer.publish();
    }

    /// Number of unpublished allocations.
    #[must_use]
    pub const fn len(&self) -> usize {
        self.producer.len()
    }

    /// Returns `true` if nothing awaits publishing.
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.producer.is_empty()
    }

    /// Iterates the unpublished allocations, oldest first.
    pub fn iter(&self) -> impl Iterator<Item = NodeRef<'_>> + '_ {
        self.producer.iter().map(NodeRef::new)
    }

    /// Frees the unpublished allocations without finalization.
    #[cfg(any(test, feature = "test-util"))]
    pub fn clear_for_tests(&mut self) {
        self.producer.clear_for_tests();
    }

    fn object_allocated_data_size(type_info: &TypeInfo) -> usize {
        let InstanceLayout::Object { instance_size, .. } = *type_info.layout() else {
            panic!("Must not be an array: {}", type_info.name());
        };
        let members_size = instance_size - mem::size_of::<ObjHeader>();
        align_up(mem::size_of::<HeapObjHeader>() + members_size, OBJECT_ALIGNMENT)
    }

    fn array_allocated_data_size(type_info: &TypeInfo, count: u32) -> usize {
        let InstanceLayout::Array { element_size, .. } = *type_info.layout() else {
            panic!("Must be an array: {}", type_info.name());
        };
        let elements_size = element_size
            .checked_mul(count as usize)
            .and_then(|size| size.checked_add(mem::size_of::<HeapArrayHeader>()))
            .unwrap_or_else(|| panic!("array of {count} x {element_size} bytes overflows"));
        align_up(elements_size, OBJECT_ALIGNMENT)
    }

    fn construct_object(
        node: NodePtr<OBJECT_ALIGNMENT>,
        type_info: &'static TypeInfo,
        size: usize,
    ) -> ObjRef {
        let heap = node.data().cast::<HeapObjHeader>().as_ptr();
        // SAFETY: the payload holds at least `size` bytes, aligned for the header.
        unsafe {
            ptr::write_bytes(node.data().as_ptr(), 0, size);
            heap.write(HeapObjHeader {
                gc_data: ObjectData::new(),
                object: ObjHeader::new(type_info),
            });
            ObjRef::from_raw(NonNull::new_unchecked(ptr::addr_of_mut!((*heap).object)))
        }
    }

    fn construct_array(
        node: NodePtr<OBJECT_ALIGNMENT>,
        type_info: &'static TypeInfo,
        count: u32,
        size: usize,
    ) -> ArrayRef {
        let heap = node.data().cast::<HeapArrayHeader>().as_ptr();
        // SAFETY: the payload holds at least `size` bytes, aligned for the header.
        unsafe {
            ptr::write_bytes(node.data().as_ptr(), 0, size);
            heap.write(HeapArrayHeader {
                gc_data: ObjectData::new(),
                array: ArrayHeader::new(type_info, count),
            });
            ArrayRef::from_raw(NonNull::new_unchecked(ptr::addr_of_mut!((*heap).array)))
        }
    }
}

// ============================================================================
// FinalizerQueue
// ============================================================================

/// Garbage nodes awaiting finalization. Dropping the queue frees them.
pub struct FinalizerQueue<A: ByteAllocator = AlignedAllocator> {
    consumer: Consumer<OBJECT_ALIGNMENT, A>,
}

impl<A: ByteAllocator> FinalizerQueue<A> {
    /// Creates an empty queue.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            consumer: Consumer::new(),
        }
    }

    /// Number of queued nodes.
    #[must_use]
    pub const fn len(&self) -> usize {
        self.consumer.len()
    }

    /// Returns `true` if nothing is queued.
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.consumer.is_empty()
    }

    /// Appends `other` after the nodes already queued.
    pub fn merge_with(&mut self, other: Self) {
        self.consumer.merge_with(other.consumer);
    }

    /// Runs the finalizer of every queued object, in queue order. Returns how
    /// many ran. Memory is released when the queue is dropped.
    pub fn finalize(&self, hooks: &dyn FinalizerHooks) -> usize {
        let mut finalized = 0;
        for node in self.iter() {
            let object = node.as_obj();
            if hooks.has_finalizer(object) {
                hooks.run_finalizer(object);
                finalized += 1;
            }
        }
        finalized
    }

    /// Iterates the queued nodes.
    pub fn iter(&self) -> impl Iterator<Item = NodeRef<'_>> + '_ {
        self.consumer.iter().map(NodeRef::new)
    }
}

impl<A: ByteAllocator> Default for FinalizerQueue<A> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::object::Color;

    const SLOT: usize = mem::size_of::<ObjHeader>();

    static POINT: TypeInfo = TypeInfo::object("Point", SLOT + 16);
    static EMPTY: TypeInfo = TypeInfo::object("Empty", SLOT);
    static BYTES: TypeInfo = TypeInfo::array("ByteArray", 1);
    static LONGS: TypeInfo = TypeInfo::array("LongArray", 8);

    #[test]
    fn test_allocated_sizes() {
        // Node (8) + gc data padded to 8 + header (8) + members.
        assert_eq!(ThreadQueue::<AlignedAllocator>::object_allocated_size(&EMPTY), 24);
        assert_eq!(ThreadQueue::<AlignedAllocator>::object_allocated_size(&POINT), 40);
        // Node (8) + gc data (8) + array header (16) + elements, rounded to 8.
        assert_eq!(ThreadQueue::<AlignedAllocator>::array_allocated_size(&BYTES, 0), 32);
        assert_eq!(ThreadQueue::<AlignedAllocator>::array_allocated_size(&BYTES, 3), 40);
        assert_eq!(ThreadQueue::<AlignedAllocator>::array_allocated_size(&LONGS, 3), 56);
    }

    #[test]
    fn test_create_object_roundtrip() {
        let factory = ObjectFactory::<AlignedAllocator>::new();
        let mut queue = ThreadQueue::new(&factory);
        let object = queue.create_object(&POINT);
        let node = queue.iter().next().unwrap();

        assert_eq!(unsafe { NodeRef::from_object(object) }, node);
        assert_eq!(node.obj_header(), object);
        assert!(!node.is_array());
        assert!(std::ptr::eq(unsafe { object.type_info() }, &POINT));
        assert_eq!(node.gc_object_data().color(), Color::White);

        // The body is zeroed.
        let body = unsafe { std::slice::from_raw_parts(object.body().as_ptr(), 16) };
        assert!(body.iter().all(|&b| b == 0));
    }

    #[test]
    fn test_create_array_roundtrip() {
        let factory = ObjectFactory::<AlignedAllocator>::new();
        let mut queue = ThreadQueue::new(&factory);
        let array = queue.create_array(&LONGS, 5);
        let node = queue.iter().next().unwrap();

        assert_eq!(unsafe { NodeRef::from_array(array) }, node);
        assert_eq!(unsafe { NodeRef::from_object(array.as_obj()) }, node);
        assert!(node.is_array());
        assert_eq!(node.array_header(), array);
        assert_eq!(unsafe { array.count() }, 5);
        let fourth = unsafe { array.element(4) };
        assert_eq!(unsafe { *fourth.cast::<u64>().as_ptr() }, 0);
    }

    #[test]
    fn test_gc_data_is_shared_between_shapes() {
        let factory = ObjectFactory::<AlignedAllocator>::new();
        let mut queue = ThreadQueue::new(&factory);
        let object = queue.create_object(&POINT);
        let array = queue.create_array(&BYTES, 2);

        let object_node = unsafe { NodeRef::from_object(object) };
        let array_node = unsafe { NodeRef::from_array(array) };
        object_node.gc_object_data().set_color(Color::Black);
        assert_eq!(array_node.gc_object_data().color(), Color::White);
        array_node.gc_object_data().set_color(Color::Black);

        queue.publish();
        let colors: Vec<Color> = factory
            .lock_for_iter()
            .iter()
            .map(|node| node.gc_object_data().color())
            .collect();
        assert_eq!(colors, vec![Color::Black, Color::Black]);
    }

    #[test]
    #[should_panic(expected = "Must not be an array")]
    fn test_create_object_with_array_type() {
        let factory = ObjectFactory::<AlignedAllocator>::new();
        let mut queue = ThreadQueue::new(&factory);
        let _ = queue.create_object(&BYTES);
    }

    #[test]
    #[should_panic(expected = "Must be an array")]
    fn test_create_array_with_object_type() {
        let factory = ObjectFactory::<AlignedAllocator>::new();
        let mut queue = ThreadQueue::new(&factory);
        let _ = queue.create_array(&POINT, 1);
    }

    #[test]
    #[should_panic(expected = "node holds an array")]
    fn test_obj_header_on_array() {
        let factory = ObjectFactory::<AlignedAllocator>::new();
        let mut queue = ThreadQueue::new(&factory);
        let array = queue.create_array(&BYTES, 1);
        let _ = unsafe { NodeRef::from_array(array) }.obj_header();
    }

    #[test]
    fn test_publish_and_iterate() {
        let factory = ObjectFactory::<AlignedAllocator>::new();
        let mut first = ThreadQueue::new(&factory);
        let mut second = ThreadQueue::new(&factory);
        let a = first.create_object(&POINT);
        let b = second.create_array(&BYTES, 8);
        let c = first.create_object(&EMPTY);

        assert_eq!(first.len(), 2);
        assert!(factory.is_empty());
        first.publish();
        second.publish();
        assert!(first.is_empty());

        let objects: Vec<ObjRef> = factory.lock_for_iter().iter().map(|n| n.as_obj()).collect();
        assert_eq!(objects, vec![a, c, b.as_obj()]);
    }

    #[test]
    fn test_cursor_moves_into_finalizer_queue() {
        let factory = ObjectFactory::<AlignedAllocator>::new();
        let mut queue = ThreadQueue::new(&factory);
        let keep = queue.create_object(&POINT);
        let doomed = queue.create_object(&EMPTY);
        let freed = queue.create_array(&BYTES, 4);
        queue.publish();

        let mut finalizers = FinalizerQueue::new();
        {
            let mut iter = factory.lock_for_iter();
            let mut cursor = iter.cursor();
            while let Some(node) = cursor.current() {
                let object = node.as_obj();
                if object == doomed {
                    cursor.move_and_advance(&mut finalizers);
                } else if object == freed.as_obj() {
                    cursor.erase_and_advance();
                } else {
                    cursor.advance();
                }
            }
        }

        let remaining: Vec<ObjRef> = factory.lock_for_iter().iter().map(|n| n.as_obj()).collect();
        assert_eq!(remaining, vec![keep]);
        let queued: Vec<ObjRef> = finalizers.iter().map(|n| n.as_obj()).collect();
        assert_eq!(queued, vec![doomed]);
    }

    #[test]
    fn test_clear_for_tests() {
        let factory = ObjectFactory::<AlignedAllocator>::new();
        let mut queue = ThreadQueue::new(&factory);
        queue.create_object(&POINT);
        queue.publish();
        queue.create_object(&POINT);

        factory.clear_for_tests();
        queue.clear_for_tests();
        assert!(factory.is_empty());
        assert!(queue.is_empty());
    }
}
