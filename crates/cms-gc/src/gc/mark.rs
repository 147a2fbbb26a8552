//! Mark phase: roots, object graph traversal, the gray stack, and weak
//! reference clearing.

use parking_lot::Mutex;

use crate::factory::NodeRef;
use crate::object::{for_each_field_reference, Color, ObjRef};

/// The object graph as seen by the collector.
///
/// `for_each_root` must report every reference the program can still use
/// without going through another managed object: globals, stacks, handles.
/// It is called while every attached mutator is stopped.
pub trait ObjectGraph: Send + Sync + 'static {
    /// Calls `visit` once per root reference.
    fn for_each_root(&self, visit: &mut dyn FnMut(ObjRef));

    /// Calls `visit` once per reference held by `object`.
    ///
    /// The default walks the reference slots described by the object's
    /// [`TypeInfo`](crate::TypeInfo).
    fn for_each_reference(&self, object: ObjRef, visit: &mut dyn FnMut(ObjRef)) {
        // SAFETY: the collector only traces objects reached this cycle.
        unsafe { for_each_field_reference(object, visit) };
    }
}

/// A lock-protected list of root references.
///
/// ```
/// use cms_gc::RootSet;
///
/// let roots = RootSet::new();
/// assert!(roots.is_empty());
/// ```
#[derive(Debug, Default)]
pub struct RootSet {
    roots: Mutex<Vec<ObjRef>>,
}

impl RootSet {
    /// Creates an empty root set.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            roots: Mutex::new(Vec::new()),
        }
    }

    /// Adds a root. A reference added twice must be removed twice.
    pub fn add(&self, object: ObjRef) {
        self.roots.lock().push(object);
    }

    /// Removes one occurrence of `object`. Returns `false` if it was absent.
    pub fn remove(&self, object: ObjRef) -> bool {
        let mut roots = self.roots.lock();
        roots
            .iter()
            .rposition(|&root| root == object)
            .map(|index| roots.swap_remove(index))
            .is_some()
    }

    /// Returns `true` if `object` is a root.
    #[must_use]
    pub fn contains(&self, object: ObjRef) -> bool {
        self.roots.lock().contains(&object)
    }

    /// Number of roots.
    #[must_use]
    pub fn len(&self) -> usize {
        self.roots.lock().len()
    }

    /// Returns `true` if there are no roots.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.roots.lock().is_empty()
    }

    /// Removes every root.
    pub fn clear(&self) {
        self.roots.lock().clear();
    }
}

impl ObjectGraph for RootSet {
    fn for_each_root(&self, visit: &mut dyn FnMut(ObjRef)) {
        for &root in self.roots.lock().iter() {
            visit(root);
        }
    }
}

/// Result of a mark phase.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MarkStats {
    /// Objects turned black.
    pub objects_marked: usize,
    /// Largest size the gray stack reached.
    pub max_gray_stack: usize,
    /// Weak slots set to `None` because their target stayed white.
    pub weak_references_cleared: usize,
}

/// Marks everything reachable from the roots of `graph` black.
///
/// Every object is pushed on the gray stack at most once: it turns black when
/// first reached. Permanent objects are neither colored nor traced. Once the
/// graph is exhausted, weak slots of black objects pointing at white objects
/// are cleared.
///
/// # Safety
///
/// The world must be stopped and every published allocation must be in the
/// heap: references reported by `graph` are dereferenced.
pub(crate) unsafe fn mark(graph: &dyn ObjectGraph) -> MarkStats {
    let mut gray: Vec<ObjRef> = Vec::new();
    let mut weak_holders: Vec<ObjRef> = Vec::new();
    let mut stats = MarkStats::default();

    let shade = |object: ObjRef, gray: &mut Vec<ObjRef>, stats: &mut MarkStats| {
        // SAFETY: reachable objects are alive while the world is stopped.
        if unsafe { object.header() }.is_permanent() {
            return;
        }
        // SAFETY: non-permanent objects were created by a factory.
        let node = unsafe { NodeRef::from_object(object) };
        if node.gc_object_data().try_mark_black() {
            stats.objects_marked += 1;
            gray.push(object);
            stats.max_gray_stack = stats.max_gray_stack.max(gray.len());
        }
    };

    graph.for_each_root(&mut |root| shade(root, &mut gray, &mut stats));
    while let Some(object) = gray.pop() {
        // SAFETY: gray objects are alive.
        if !unsafe { object.type_info() }.weak_offsets().is_empty() {
            weak_holders.push(object);
        }
        graph.for_each_reference(object, &mut |target| shade(target, &mut gray, &mut stats));
    }
    // SAFETY: marking is complete and nothing was swept yet.
    stats.weak_references_cleared = unsafe { clear_dead_weak_references(&weak_holders) };
    stats
}

/// Stores `None` into every weak slot of `holders` whose target is white.
///
/// # Safety
///
/// Marking must be complete, with the world still stopped and the heap not
/// yet swept.
unsafe fn clear_dead_weak_references(holders: &[ObjRef]) -> usize {
    let mut cleared = 0;
    for &holder in holders {
        // SAFETY: holders were marked this cycle.
        for &offset in unsafe { holder.type_info() }.weak_offsets() {
            // SAFETY: declared weak slot of a live object.
            let Some(target) = (unsafe { holder.field(offset) }) else {
                continue;
            };
            // SAFETY: white objects stay allocated until sweep.
            if unsafe { target.header() }.is_permanent() {
                continue;
            }
            // SAFETY: as above.
            let node = unsafe { NodeRef::from_object(target) };
            if node.gc_object_data().color() == Color::White {
                // SAFETY: declared weak slot; mutators are stopped.
                unsafe { holder.set_field(offset, None) };
                cleared += 1;
            }
        }
    }
    cleared
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alloc::AlignedAllocator;
    use crate::factory::{ObjectFactory, ThreadQueue};
    use crate::object::{ObjHeader, TypeInfo};
    use std::mem;
    use std::ptr::NonNull;

    const SLOT: usize = mem::size_of::<ObjHeader>();
    const NEXT: usize = SLOT;
    const NODE_REFS: &[usize] = &[NEXT];
    const REFERRED: usize = SLOT;
    const WEAK_REFS: &[usize] = &[REFERRED];

    static NODE: TypeInfo = TypeInfo::object("Node", SLOT + 8).with_references(NODE_REFS);
    static REFS: TypeInfo = TypeInfo::reference_array("Array<Any>");
    static WEAK: TypeInfo = TypeInfo::object("Weak", SLOT + 8).with_weak_references(WEAK_REFS);

    #[allow(dead_code)]
    #[repr(C)]
    struct StaticNode {
        header: ObjHeader,
        next: Option<ObjRef>,
    }

    fn permanent_node() -> ObjRef {
        let node = Box::leak(Box::new(StaticNode {
            header: ObjHeader::permanent(&NODE),
            next: None,
        }));
        unsafe { ObjRef::from_raw(NonNull::from(node).cast()) }
    }

    fn color(object: ObjRef) -> Color {
        unsafe { NodeRef::from_object(object) }.gc_object_data().color()
    }

    #[test]
    fn test_root_set_add_remove() {
        let factory = ObjectFactory::<AlignedAllocator>::new();
        let mut queue = ThreadQueue::new(&factory);
        let a = queue.create_object(&NODE);
        let roots = RootSet::new();
        roots.add(a);
        roots.add(a);
        assert_eq!(roots.len(), 2);
        assert!(roots.remove(a));
        assert!(roots.contains(a));
        assert!(roots.remove(a));
        assert!(!roots.remove(a));
        assert!(roots.is_empty());
    }

    #[test]
    fn test_mark_follows_fields_and_arrays() {
        let factory = ObjectFactory::<AlignedAllocator>::new();
        let mut queue = ThreadQueue::new(&factory);
        let head = queue.create_object(&NODE);
        let tail = queue.create_object(&NODE);
        let array = queue.create_array(&REFS, 3);
        let in_array = queue.create_object(&NODE);
        let garbage = queue.create_object(&NODE);
        unsafe {
            head.set_field(NEXT, Some(array.as_obj()));
            array.set(1, Some(tail));
            array.set(2, Some(in_array));
            garbage.set_field(NEXT, Some(head));
        }
        queue.publish();

        let roots = RootSet::new();
        roots.add(head);
        let stats = unsafe { mark(&roots) };

        assert_eq!(stats.objects_marked, 4);
        for object in [head, tail, array.as_obj(), in_array] {
            assert_eq!(color(object), Color::Black);
        }
        assert_eq!(color(garbage), Color::White);
    }

    #[test]
    fn test_mark_terminates_on_cycles() {
        let factory = ObjectFactory::<AlignedAllocator>::new();
        let mut queue = ThreadQueue::new(&factory);
        let a = queue.create_object(&NODE);
        let b = queue.create_object(&NODE);
        unsafe {
            a.set_field(NEXT, Some(b));
            b.set_field(NEXT, Some(a));
        }
        queue.publish();

        let roots = RootSet::new();
        roots.add(a);
        roots.add(b);
        let stats = unsafe { mark(&roots) };
        assert_eq!(stats.objects_marked, 2);
        assert!(stats.max_gray_stack <= 2);
    }

    #[test]
    fn test_mark_clears_weak_to_white() {
        let factory = ObjectFactory::<AlignedAllocator>::new();
        let mut queue = ThreadQueue::new(&factory);
        let dead = queue.create_object(&NODE);
        let alive = queue.create_object(&NODE);
        let weak_to_dead = queue.create_object(&WEAK);
        let weak_to_alive = queue.create_object(&WEAK);
        let unreachable_weak = queue.create_object(&WEAK);
        unsafe {
            weak_to_dead.set_field(REFERRED, Some(dead));
            weak_to_alive.set_field(REFERRED, Some(alive));
            unreachable_weak.set_field(REFERRED, Some(alive));
        }
        queue.publish();

        let roots = RootSet::new();
        roots.add(weak_to_dead);
        roots.add(weak_to_alive);
        roots.add(alive);
        let stats = unsafe { mark(&roots) };

        assert_eq!(stats.objects_marked, 3);
        assert_eq!(stats.weak_references_cleared, 1);
        assert_eq!(color(dead), Color::White);
        assert_eq!(unsafe { weak_to_dead.field(REFERRED) }, None);
        assert_eq!(unsafe { weak_to_alive.field(REFERRED) }, Some(alive));
        assert_eq!(unsafe { unreachable_weak.field(REFERRED) }, Some(alive));
    }

    #[test]
    fn test_mark_skips_permanent_objects() {
        let factory = ObjectFactory::<AlignedAllocator>::new();
        let mut queue = ThreadQueue::new(&factory);
        let heap_object = queue.create_object(&NODE);
        let weak = queue.create_object(&WEAK);
        queue.publish();

        let first = permanent_node();
        let second = permanent_node();
        unsafe {
            first.set_field(NEXT, Some(second));
            heap_object.set_field(NEXT, Some(first));
            weak.set_field(REFERRED, Some(second));
        }

        let roots = RootSet::new();
        roots.add(heap_object);
        roots.add(first);
        roots.add(weak);
        let stats = unsafe { mark(&roots) };

        assert_eq!(stats.objects_marked, 2);
        assert_eq!(stats.weak_references_cleared, 0);
        assert_eq!(color(heap_object), Color::Black);
        assert_eq!(unsafe { weak.field(REFERRED) }, Some(second));
    }

    #[test]
    fn test_custom_graph() {
        struct Everything(Vec<ObjRef>);

        impl ObjectGraph for Everything {
            fn for_each_root(&self, visit: &mut dyn FnMut(ObjRef)) {
                self.0.iter().copied().for_each(visit);
            }

            fn for_each_reference(&self, _: ObjRef, _: &mut dyn FnMut(ObjRef)) {}
        }

        let factory = ObjectFactory::<AlignedAllocator>::new();
        let mut queue = ThreadQueue::new(&factory);
        let a = queue.create_object(&NODE);
        let b = queue.create_object(&NODE);
        unsafe { a.set_field(NEXT, Some(b)) };

        let stats = unsafe { mark(&Everything(vec![a])) };
        assert_eq!(stats.objects_marked, 1);
        assert_eq!(color(b), Color::White);
    }
}
