//! Event heap for the Gillespie engine.
//!
//! A binary heap ordered on soonest `time_of_event`, with FIFO resolution
//! of exact ties. Every routine that moves a node reports the node's new
//! index through a writeback closure, so the per-cell slot table stays
//! consistent without embedded pointers; the invariant lives here and is
//! checkable after every mutation.

use crate::location::Cell;
use serde::{Deserialize, Serialize};

/// What a scheduled event does when it fires.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EventType {
    /// Speciation, coalescence or dispersal within one cell.
    Cell,
    /// A landscape epoch boundary.
    MapUpdate,
    /// A temporal sampling point injecting new tips.
    Sample,
}

/// One scheduled event.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct EventNode {
    pub cell: Cell,
    pub time: f64,
    pub event: EventType,
    seq: u64,
}

impl EventNode {
    /// Heap ordering: earlier time wins, insertion order breaks ties.
    #[inline]
    fn before(&self, other: &EventNode) -> bool {
        self.time < other.time || (self.time == other.time && self.seq < other.seq)
    }
}

/// Min-heap on `(time, seq)` with index writeback.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EventHeap {
    nodes: Vec<EventNode>,
    next_seq: u64,
}

impl EventHeap {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn clear(&mut self) {
        self.nodes.clear();
    }

    #[must_use]
    pub fn peek(&self) -> Option<&EventNode> {
        self.nodes.first()
    }

    #[must_use]
    pub fn node(&self, index: usize) -> &EventNode {
        &self.nodes[index]
    }

    pub fn iter(&self) -> impl Iterator<Item = &EventNode> {
        self.nodes.iter()
    }

    /// Insert an event; `on_move` receives every node that changes index,
    /// including the new one.
    pub fn push(
        &mut self,
        cell: Cell,
        time: f64,
        event: EventType,
        on_move: &mut dyn FnMut(&EventNode, usize),
    ) {
        let node = EventNode {
            cell,
            time,
            event,
            seq: self.next_seq,
        };
        self.next_seq += 1;
        self.nodes.push(node);
        let index = self.nodes.len() - 1;
        on_move(&self.nodes[index], index);
        self.sift_up(index, on_move);
    }

    /// Remove and return the soonest event. Nodes displaced by the
    /// removal are reported through `on_move`; clearing the popped node's
    /// own slot is the caller's responsibility.
    pub fn pop(&mut self, on_move: &mut dyn FnMut(&EventNode, usize)) -> Option<EventNode> {
        if self.nodes.is_empty() {
            return None;
        }
        let last = self.nodes.len() - 1;
        self.nodes.swap(0, last);
        let top = self.nodes.pop().expect("nonempty");
        if !self.nodes.is_empty() {
            on_move(&self.nodes[0], 0);
            self.sift_down(0, on_move);
        }
        Some(top)
    }

    /// Change the firing time of the node at `index` and restore the heap
    /// property, sifting in whichever direction the new key requires.
    pub fn update_time(
        &mut self,
        index: usize,
        time: f64,
        on_move: &mut dyn FnMut(&EventNode, usize),
    ) {
        self.nodes[index].time = time;
        let moved = self.sift_up(index, on_move);
        if moved == index {
            self.sift_down(index, on_move);
        }
    }

    fn sift_up(&mut self, mut index: usize, on_move: &mut dyn FnMut(&EventNode, usize)) -> usize {
        while index > 0 {
            let parent = (index - 1) / 2;
            if self.nodes[index].before(&self.nodes[parent]) {
                self.nodes.swap(index, parent);
                on_move(&self.nodes[index], index);
                index = parent;
                on_move(&self.nodes[index], index);
            } else {
                break;
            }
        }
        index
    }

    fn sift_down(&mut self, mut index: usize, on_move: &mut dyn FnMut(&EventNode, usize)) {
        loop {
            let left = 2 * index + 1;
            let right = left + 1;
            let mut smallest = index;
            if left < self.nodes.len() && self.nodes[left].before(&self.nodes[smallest]) {
                smallest = left;
            }
            if right < self.nodes.len() && self.nodes[right].before(&self.nodes[smallest]) {
                smallest = right;
            }
            if smallest == index {
                break;
            }
            self.nodes.swap(index, smallest);
            on_move(&self.nodes[index], index);
            on_move(&self.nodes[smallest], smallest);
            index = smallest;
        }
    }

    /// Whether the heap property holds everywhere.
    #[must_use]
    pub fn is_valid(&self) -> bool {
        (1..self.nodes.len()).all(|i| !self.nodes[i].before(&self.nodes[(i - 1) / 2]))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rng::RandomSource;
    use std::collections::HashMap;

    fn tracking_heap(times: &[f64]) -> (EventHeap, HashMap<(usize, usize), usize>) {
        let mut heap = EventHeap::new();
        let mut slots: HashMap<(usize, usize), usize> = HashMap::new();
        for (i, &t) in times.iter().enumerate() {
            let cell = Cell::new(i, 0);
            heap.push(cell, t, EventType::Cell, &mut |node, index| {
                slots.insert((node.cell.x, node.cell.y), index);
            });
        }
        (heap, slots)
    }

    fn slots_consistent(heap: &EventHeap, slots: &HashMap<(usize, usize), usize>) -> bool {
        heap.iter().enumerate().all(|(index, node)| {
            slots.get(&(node.cell.x, node.cell.y)) == Some(&index)
        })
    }

    #[test]
    fn pops_in_time_order() {
        let (mut heap, mut slots) = tracking_heap(&[5.0, 1.0, 3.0, 0.5, 4.0]);
        assert!(heap.is_valid());
        let mut order = Vec::new();
        while let Some(node) = heap.pop(&mut |node, index| {
            slots.insert((node.cell.x, node.cell.y), index);
        }) {
            slots.remove(&(node.cell.x, node.cell.y));
            order.push(node.time);
            assert!(heap.is_valid());
            assert!(slots_consistent(&heap, &slots));
        }
        assert_eq!(order, vec![0.5, 1.0, 3.0, 4.0, 5.0]);
    }

    #[test]
    fn equal_times_resolve_fifo() {
        let (mut heap, mut slots) = tracking_heap(&[2.0, 2.0, 2.0]);
        let mut cells = Vec::new();
        while let Some(node) = heap.pop(&mut |node, index| {
            slots.insert((node.cell.x, node.cell.y), index);
        }) {
            cells.push(node.cell.x);
        }
        assert_eq!(cells, vec![0, 1, 2]);
    }

    #[test]
    fn update_resifts_in_both_directions() {
        let (mut heap, mut slots) = tracking_heap(&[1.0, 2.0, 3.0, 4.0, 5.0]);
        let mut on_move = |node: &EventNode, index: usize| {
            slots.insert((node.cell.x, node.cell.y), index);
        };
        // Push the root down.
        heap.update_time(0, 10.0, &mut on_move);
        assert!(heap.is_valid());
        // Pull a leaf up.
        let leaf = heap.len() - 1;
        heap.update_time(leaf, 0.1, &mut on_move);
        assert!(heap.is_valid());
        assert!(slots_consistent(&heap, &slots));
        assert_eq!(heap.peek().unwrap().time, 0.1);
    }

    #[test]
    fn writeback_survives_random_churn() {
        let mut rng = RandomSource::with_seed(77);
        let (mut heap, mut slots) = tracking_heap(&[]);
        let mut next_cell = 0usize;
        for _ in 0..2000 {
            let action = rng.uint_in(2);
            let mut on_move = |node: &EventNode, index: usize| {
                slots.insert((node.cell.x, node.cell.y), index);
            };
            match action {
                0 => {
                    heap.push(
                        Cell::new(next_cell, 1),
                        rng.uniform01() * 100.0,
                        EventType::Cell,
                        &mut on_move,
                    );
                    next_cell += 1;
                }
                1 => {
                    if let Some(node) = heap.pop(&mut on_move) {
                        slots.remove(&(node.cell.x, node.cell.y));
                    }
                }
                _ => {
                    if !heap.is_empty() {
                        let index = rng.uint_in(heap.len() as u64 - 1) as usize;
                        let time = rng.uniform01() * 100.0;
                        heap.update_time(index, time, &mut on_move);
                    }
                }
            }
            assert!(heap.is_valid());
            assert!(slots_consistent(&heap, &slots));
        }
    }
}
