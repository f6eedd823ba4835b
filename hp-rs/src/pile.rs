use core::ptr::null_mut;
use core::sync::atomic::{AtomicPtr, Ordering};

/// A lock-free pile, which we can push an element or pop all elements.
#[derive(Debug)]
pub(crate) struct Pile<T> {
    head: AtomicPtr<Node<T>>,
}

#[derive(Debug)]
struct Node<T> {
    data: T,
    next: *mut Node<T>,
}

// The pile hands its elements over between threads.
unsafe impl<T: Send> Send for Pile<T> {}
unsafe impl<T: Send> Sync for Pile<T> {}

impl<T> Pile<T> {
    pub(crate) const fn new() -> Self {
        Self {
            head: AtomicPtr::new(null_mut()),
        }
    }

    /// Pushes a value on top of the pile.
    pub(crate) fn push(&self, data: T) {
        let new = Box::leak(Box::new(Node {
            data,
            next: null_mut(),
        }));

        let mut head = self.head.load(Ordering::Relaxed);
        loop {
            new.next = head;
            match self
                .head
                .compare_exchange(head, new, Ordering::Release, Ordering::Relaxed)
            {
                Ok(_) => return,
                Err(head_new) => head = head_new,
            }
        }
    }

    /// Pops and returns all elements from the pile.
    #[must_use]
    pub(crate) fn pop_all(&self) -> Vec<T> {
        let mut cur = self.head.swap(null_mut(), Ordering::Acquire);
        let mut result = Vec::new();
        while !cur.is_null() {
            let node = unsafe { Box::from_raw(cur) };
            cur = node.next;
            result.push(node.data);
        }
        result
    }

    #[cfg(test)]
    pub(crate) fn is_empty(&self) -> bool {
        self.head.load(Ordering::Relaxed).is_null()
    }
}

impl<T> Drop for Pile<T> {
    fn drop(&mut self) {
        drop(self.pop_all());
    }
}

#[cfg(test)]
mod tests {
    use super::Pile;
    use std::thread::scope;

    #[test]
    fn seq_push_pop() {
        let pile = Pile::new();
        assert!(pile.is_empty());
        pile.push(1);
        pile.push(2);
        pile.push(3);
        assert!(!pile.is_empty());
        assert_eq!(pile.pop_all(), vec![3, 2, 1]);
        assert!(pile.is_empty());
    }

    #[test]
    fn con_push_pop() {
        const THREADS: usize = 16;
        const PUSH_COUNT: usize = 1000;

        let pile = Pile::new();

        scope(|s| {
            for i in 0..THREADS {
                let pile = &pile;
                s.spawn(move || {
                    for j in 0..PUSH_COUNT {
                        pile.push(i * PUSH_COUNT + j);
                    }
                });
            }

            let mut appeared = vec![false; THREADS * PUSH_COUNT];
            while appeared.iter().any(|v| !*v) {
                for v in pile.pop_all() {
                    assert!(!appeared[v]);
                    appeared[v] = true;
                }
            }
        });
    }
}
