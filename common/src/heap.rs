//! Index-addressed arenas. Records live in a `Vec` and are referred to by
//! typed `usize` ids instead of pointers, so ownership of the thing an id
//! names can be moved around freely without aliasing the storage.

use std::marker::PhantomData;

pub trait UsizeId:
    From<usize> + Into<usize> + Eq + PartialOrd + Ord + std::hash::Hash + Copy + Default
{
}

#[macro_export]
macro_rules! define_usize_id {
    ($name:ident) => {
        #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
        pub struct $name(usize);
        impl From<usize> for $name {
            fn from(value: usize) -> Self {
                Self(value)
            }
        }
        impl From<$name> for usize {
            fn from(value: $name) -> Self {
                value.0
            }
        }
        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                write!(f, "{}#{}", stringify!($name), self.0)
            }
        }
        impl $crate::heap::UsizeId for $name {}
    };
}

/// Hands out consecutive ids without storing anything.
#[derive(Debug, Clone)]
pub struct IdAllocator<I>(usize, PhantomData<I>);

impl<I: UsizeId> IdAllocator<I> {
    pub fn new() -> Self {
        Self(0, PhantomData)
    }

    pub fn alloc(&mut self) -> I {
        let r = I::from(self.0);
        self.0 += 1;
        r
    }

    /// Number of ids handed out so far.
    pub fn issued(&self) -> usize {
        self.0
    }
}

impl<I: UsizeId> Default for IdAllocator<I> {
    fn default() -> Self {
        Self::new()
    }
}

/// Append-only arena. Entries are never removed, so an id stays valid for
/// the lifetime of the heap.
#[derive(Debug, Clone)]
pub struct Heap<I, T>(Vec<T>, PhantomData<I>);

const PANIC_MSG: &str = "id does not belong to this heap";

impl<I: UsizeId, T> std::ops::Index<I> for Heap<I, T> {
    type Output = T;
    fn index(&self, index: I) -> &Self::Output {
        self.0.get(index.into()).expect(PANIC_MSG)
    }
}

impl<I: UsizeId, T> std::ops::IndexMut<I> for Heap<I, T> {
    fn index_mut(&mut self, index: I) -> &mut Self::Output {
        self.0.get_mut(index.into()).expect(PANIC_MSG)
    }
}

impl<I: UsizeId, T> Heap<I, T> {
    pub fn push(&mut self, t: T) -> I {
        let id = self.0.len().into();
        self.0.push(t);
        id
    }

    pub fn get(&self, id: I) -> Option<&T> {
        self.0.get(id.into())
    }

    pub fn iter_with_id(&self) -> impl Iterator<Item = (I, &T)> {
        self.0.iter().enumerate().map(|(i, x)| (i.into(), x))
    }

    pub fn ids(&self) -> impl Iterator<Item = I> {
        (0..self.len()).map(|i| i.into())
    }
}

impl<I, T> Heap<I, T> {
    pub fn new() -> Self {
        Self(Vec::new(), PhantomData)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &T> {
        self.0.iter()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut T> {
        self.0.iter_mut()
    }
}

impl<I, T> Default for Heap<I, T> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    crate::define_usize_id!(SlotId);

    #[test]
    fn ids_follow_insertion_order() {
        let mut heap: Heap<SlotId, &str> = Heap::new();
        let a = heap.push("a");
        let b = heap.push("b");
        assert_eq!(usize::from(a), 0);
        assert_eq!(usize::from(b), 1);
        assert_eq!(heap[b], "b");
        heap[a] = "z";
        assert_eq!(heap.iter().copied().collect::<Vec<_>>(), vec!["z", "b"]);
        assert_eq!(heap.ids().collect::<Vec<_>>(), vec![a, b]);
    }

    #[test]
    fn get_out_of_bounds_is_none() {
        let heap: Heap<SlotId, u8> = Heap::new();
        assert!(heap.get(SlotId::from(3)).is_none());
        assert!(heap.is_empty());
    }

    #[test]
    fn id_allocator_counts() {
        let mut ids: IdAllocator<SlotId> = IdAllocator::new();
        assert_eq!(ids.alloc(), SlotId::from(0));
        assert_eq!(ids.alloc(), SlotId::from(1));
        assert_eq!(ids.issued(), 2);
        assert_eq!(SlotId::from(1).to_string(), "SlotId#1");
    }
}
