//! Doubly linked lists threaded through arena slots by index.

use std::ops::IndexMut;

/// Prev/next links stored inside a node.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub(crate) struct Links {
    prev: Option<usize>,
    next: Option<usize>,
}

pub(crate) trait Linked {
    fn links(&mut self) -> &mut Links;
}

/// Head of an index-linked list. O(1) push and removal at a known index.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub(crate) struct ListHead {
    first: Option<usize>,
    last: Option<usize>,
    len: usize,
}

impl ListHead {
    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn push_back<N, A>(&mut self, nodes: &mut A, idx: usize)
    where
        N: Linked,
        A: IndexMut<usize, Output = N> + ?Sized,
    {
        *nodes[idx].links() = Links {
            prev: self.last,
            next: None,
        };
        match self.last {
            Some(last) => nodes[last].links().next = Some(idx),
            None => self.first = Some(idx),
        }
        self.last = Some(idx);
        self.len += 1;
    }

    /// Unlink `idx`, which must be on this list.
    pub fn remove<N, A>(&mut self, nodes: &mut A, idx: usize)
    where
        N: Linked,
        A: IndexMut<usize, Output = N> + ?Sized,
    {
        let Links { prev, next } = std::mem::take(nodes[idx].links());
        match prev {
            Some(p) => nodes[p].links().next = next,
            None => self.first = next,
        }
        match next {
            Some(n) => nodes[n].links().prev = prev,
            None => self.last = prev,
        }
        self.len -= 1;
    }

    pub fn pop_front<N, A>(&mut self, nodes: &mut A) -> Option<usize>
    where
        N: Linked,
        A: IndexMut<usize, Output = N> + ?Sized,
    {
        let idx = self.first?;
        self.remove(nodes, idx);
        Some(idx)
    }

    /// Collect the indices in list order.
    pub fn indices<N, A>(&self, nodes: &mut A) -> Vec<usize>
    where
        N: Linked,
        A: IndexMut<usize, Output = N> + ?Sized,
    {
        let mut out = Vec::with_capacity(self.len);
        let mut cur = self.first;
        while let Some(idx) = cur {
            out.push(idx);
            cur = nodes[idx].links().next;
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Default)]
    struct Node(Links);

    impl Linked for Node {
        fn links(&mut self) -> &mut Links {
            &mut self.0
        }
    }

    #[test]
    fn push_remove_iterate() {
        let mut nodes: Vec<Node> = (0..5).map(|_| Node::default()).collect();
        let mut list = ListHead::default();
        for i in [4, 0, 1, 2, 3] {
            list.push_back(&mut nodes, i);
        }
        assert_eq!(list.indices(&mut nodes), vec![4, 0, 1, 2, 3]);

        list.remove(&mut nodes, 1);
        list.remove(&mut nodes, 4);
        list.remove(&mut nodes, 3);
        assert_eq!(list.indices(&mut nodes), vec![0, 2]);
        assert_eq!(list.len(), 2);

        assert_eq!(list.pop_front(&mut nodes), Some(0));
        assert_eq!(list.pop_front(&mut nodes), Some(2));
        assert_eq!(list.pop_front(&mut nodes), None);
        assert!(list.is_empty());
    }
}
