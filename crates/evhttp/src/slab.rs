//! Connection table: slots addressed by `generation << 32 | index`.
//!
//! Freeing a slot bumps its generation, so a token that outlives its
//! connection (a late reactor event, a queued close notice, a fired timer)
//! no longer matches anything even after the slot is reused.

use evhttp_core::Token;

struct Slot<T> {
    generation: u32,
    value: Option<T>,
}

pub(crate) struct ConnSlab<T> {
    slots: Vec<Slot<T>>,
    free: Vec<u32>,
    len: usize,
}

fn split(token: Token) -> (u32, usize) {
    ((token.0 >> 32) as u32, (token.0 & u64::from(u32::MAX)) as usize)
}

fn join(generation: u32, index: usize) -> Token {
    Token(u64::from(generation) << 32 | index as u64)
}

impl<T> ConnSlab<T> {
    pub(crate) fn new() -> Self {
        Self { slots: Vec::new(), free: Vec::new(), len: 0 }
    }

    pub(crate) fn insert(&mut self, value: T) -> Token {
        self.len += 1;
        if let Some(index) = self.free.pop() {
            let slot = &mut self.slots[index as usize];
            slot.value = Some(value);
            return join(slot.generation, index as usize);
        }
        let index = self.slots.len();
        self.slots.push(Slot { generation: 0, value: Some(value) });
        join(0, index)
    }

    pub(crate) fn get(&self, token: Token) -> Option<&T> {
        let (generation, index) = split(token);
        self.slots
            .get(index)
            .filter(|s| s.generation == generation)
            .and_then(|s| s.value.as_ref())
    }

    /// `None` if the token is stale or already removed.
    pub(crate) fn remove(&mut self, token: Token) -> Option<T> {
        let (generation, index) = split(token);
        let slot = self.slots.get_mut(index).filter(|s| s.generation == generation)?;
        let value = slot.value.take()?;
        slot.generation = slot.generation.wrapping_add(1);
        self.free.push(index as u32);
        self.len -= 1;
        Some(value)
    }

    pub(crate) fn len(&self) -> usize {
        self.len
    }

    /// Empty the table, returning every live value.
    pub(crate) fn drain(&mut self) -> Vec<T> {
        let values = self.slots.iter_mut().filter_map(|s| s.value.take()).collect();
        self.slots.clear();
        self.free.clear();
        self.len = 0;
        values
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_insert_get_remove() {
        let mut slab = ConnSlab::new();
        let a = slab.insert("a");
        let b = slab.insert("b");
        assert_ne!(a, b);
        assert_eq!(slab.get(a), Some(&"a"));
        assert_eq!(slab.len(), 2);
        assert_eq!(slab.remove(a), Some("a"));
        assert_eq!(slab.remove(a), None);
        assert_eq!(slab.get(a), None);
        assert_eq!(slab.len(), 1);
    }

    #[test]
    fn test_stale_token_after_reuse() {
        let mut slab = ConnSlab::new();
        let old = slab.insert(1);
        slab.remove(old);
        let new = slab.insert(2);
        // Same slot, new generation.
        assert_eq!(split(old).1, split(new).1);
        assert_ne!(old, new);
        assert_eq!(slab.get(old), None);
        assert_eq!(slab.remove(old), None);
        assert_eq!(slab.get(new), Some(&2));
    }

    #[test]
    fn test_drain() {
        let mut slab = ConnSlab::new();
        for i in 0..5 {
            slab.insert(i);
        }
        let mut all = slab.drain();
        all.sort();
        assert_eq!(all, vec![0, 1, 2, 3, 4]);
        assert_eq!(slab.len(), 0);
    }
}
