// SPDX-License-Identifier: MIT

//! FIFO-backed tag data for types with the queue bit set.

use std::collections::VecDeque;

/// A ring of fixed-size elements. Writes enqueue a full element; reads
/// dequeue from the head.
#[derive(Debug)]
pub struct Queue {
    element_size: usize,
    items: VecDeque<Vec<u8>>,
}

impl Queue {
    pub fn new(element_size: usize) -> Self {
        Queue {
            element_size,
            items: VecDeque::new(),
        }
    }

    pub fn element_size(&self) -> usize {
        self.element_size
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn enqueue(&mut self, data: &[u8]) {
        self.items.push_back(data.to_vec());
    }

    pub fn dequeue(&mut self) -> Option<Vec<u8>> {
        self.items.pop_front()
    }
}
