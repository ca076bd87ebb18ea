use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Handle identifying one transfer worker.
///
/// Slots are recycled by [`WorkerArena`]; the generation distinguishes a new
/// occupant from a stale handle that pointed at the same index.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct WorkerId {
    index: u32,
    generation: u32,
}

impl WorkerId {
    /// Builds a handle without an arena, for callers that manage identities themselves.
    pub const fn from_parts(index: u32, generation: u32) -> Self {
        Self { index, generation }
    }

    pub fn index(self) -> u32 {
        self.index
    }

    pub fn generation(self) -> u32 {
        self.generation
    }
}

impl fmt::Display for WorkerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "worker-{}.{}", self.index, self.generation)
    }
}

#[derive(Debug, Default)]
struct Slots {
    generations: Vec<u32>,
    live: Vec<bool>,
    free: Vec<u32>,
}

/// Issues [`WorkerId`] handles with stable indices.
#[derive(Debug, Default)]
pub struct WorkerArena {
    slots: Mutex<Slots>,
}

impl WorkerArena {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn acquire(&self) -> WorkerId {
        let mut slots = self.slots.lock();
        if let Some(index) = slots.free.pop() {
            let i = index as usize;
            slots.generations[i] = slots.generations[i].wrapping_add(1);
            slots.live[i] = true;
            return WorkerId::from_parts(index, slots.generations[i]);
        }
        let index = slots.generations.len() as u32;
        slots.generations.push(0);
        slots.live.push(true);
        WorkerId::from_parts(index, 0)
    }

    /// Returns the slot to the pool. Stale or unknown handles are ignored.
    pub fn release(&self, id: WorkerId) -> bool {
        let mut slots = self.slots.lock();
        let i = id.index as usize;
        match (slots.generations.get(i), slots.live.get(i)) {
            (Some(&generation), Some(&true)) if generation == id.generation => {
                slots.live[i] = false;
                slots.free.push(id.index);
                true
            }
            _ => false,
        }
    }

    pub fn is_live(&self, id: WorkerId) -> bool {
        let slots = self.slots.lock();
        let i = id.index as usize;
        slots.live.get(i).copied().unwrap_or(false) && slots.generations[i] == id.generation
    }

    pub fn live_count(&self) -> usize {
        self.slots.lock().live.iter().filter(|l| **l).count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn released_slots_are_reused_with_a_new_generation() {
        let arena = WorkerArena::new();
        let a = arena.acquire();
        let b = arena.acquire();
        assert_ne!(a, b);
        assert_eq!(arena.live_count(), 2);

        assert!(arena.release(a));
        assert!(!arena.is_live(a));
        let c = arena.acquire();
        assert_eq!(c.index(), a.index());
        assert_eq!(c.generation(), a.generation() + 1);
        assert!(arena.is_live(c));
        assert!(!arena.is_live(a), "stale handle must not alias the new worker");
    }

    #[test]
    fn releasing_twice_or_stale_is_a_no_op() {
        let arena = WorkerArena::new();
        let a = arena.acquire();
        assert!(arena.release(a));
        assert!(!arena.release(a));
        assert!(!arena.release(WorkerId::from_parts(42, 0)));
        assert_eq!(arena.live_count(), 0);
    }

    #[test]
    fn display_includes_index_and_generation() {
        assert_eq!(WorkerId::from_parts(3, 1).to_string(), "worker-3.1");
    }
}
