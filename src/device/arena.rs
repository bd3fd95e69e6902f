/*
 * MIT License
 *
 * Copyright (c) 2025 Matthew Abbott
 *
 * Permission is hereby granted, free of charge, to any person obtaining a copy
 * of this software and associated documentation files (the "Software"), to deal
 * in the Software without restriction, including without limitation the rights
 * to use, copy, modify, merge, publish, distribute, sublicense, and/or sell
 * copies of the Software, and to permit persons to whom the Software is
 * furnished to do so, subject to the following conditions:
 *
 * The above copyright notice and this permission notice shall be included in all
 * copies or substantial portions of the Software.
 *
 * THE SOFTWARE IS PROVIDED "AS IS", WITHOUT WARRANTY OF ANY KIND, EXPRESS OR
 * IMPLIED, INCLUDING BUT NOT LIMITED TO THE WARRANTIES OF MERCHANTABILITY,
 * FITNESS FOR A PARTICULAR PURPOSE AND NONINFRINGEMENT. IN NO EVENT SHALL THE
 * AUTHORS OR COPYRIGHT HOLDERS BE LIABLE FOR ANY CLAIM, DAMAGES OR OTHER
 * LIABILITY, WHETHER IN AN ACTION OF CONTRACT, TORT OR OTHERWISE, ARISING FROM,
 * OUT OF OR IN CONNECTION WITH THE SOFTWARE OR THE USE OR OTHER DEALINGS IN THE
 * SOFTWARE.
 */

use super::BufferId;
use crate::error::{Error, Result};

struct Slot<T> {
    generation: u32,
    value: Option<T>,
}

/// Generational arena backing device buffers. Released slots are reused with
/// a bumped generation so old handles stay invalid.
pub struct Arena<T> {
    slots: Vec<Slot<T>>,
    free: Vec<u32>,
}

impl<T> Default for Arena<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Arena<T> {
    pub fn new() -> Self {
        Self {
            slots: Vec::new(),
            free: Vec::new(),
        }
    }

    pub fn insert(&mut self, value: T) -> BufferId {
        if let Some(index) = self.free.pop() {
            let slot = &mut self.slots[index as usize];
            slot.value = Some(value);
            return BufferId {
                index,
                generation: slot.generation,
            };
        }
        let index = self.slots.len() as u32;
        self.slots.push(Slot {
            generation: 0,
            value: Some(value),
        });
        BufferId {
            index,
            generation: 0,
        }
    }

    pub fn remove(&mut self, id: BufferId) -> Result<T> {
        let slot = self.slot_mut(id)?;
        let value = slot.value.take().ok_or(Error::StaleBuffer(id))?;
        slot.generation = slot.generation.wrapping_add(1);
        self.free.push(id.index);
        Ok(value)
    }

    pub fn get(&self, id: BufferId) -> Result<&T> {
        self.slots
            .get(id.index as usize)
            .filter(|slot| slot.generation == id.generation)
            .and_then(|slot| slot.value.as_ref())
            .ok_or(Error::StaleBuffer(id))
    }

    pub fn get_mut(&mut self, id: BufferId) -> Result<&mut T> {
        self.slot_mut(id)?
            .value
            .as_mut()
            .ok_or(Error::StaleBuffer(id))
    }

    pub fn contains(&self, id: BufferId) -> bool {
        self.get(id).is_ok()
    }

    /// Number of live entries.
    pub fn live(&self) -> usize {
        self.slots.iter().filter(|s| s.value.is_some()).count()
    }

    fn slot_mut(&mut self, id: BufferId) -> Result<&mut Slot<T>> {
        self.slots
            .get_mut(id.index as usize)
            .filter(|slot| slot.generation == id.generation)
            .ok_or(Error::StaleBuffer(id))
    }
}

impl<T: Default> Arena<T> {
    /// Moves the value out, leaving a default in place. Pair with [`Arena::put`].
    pub fn take(&mut self, id: BufferId) -> Result<T> {
        Ok(std::mem::take(self.get_mut(id)?))
    }

    pub fn put(&mut self, id: BufferId, value: T) -> Result<()> {
        *self.get_mut(id)? = value;
        Ok(())
    }

    /// Runs `f` on the value at `id` while it is moved out, so `f` can read
    /// other slots. The value goes back even when `f` fails.
    pub fn with_taken<R>(
        &mut self,
        id: BufferId,
        f: impl FnOnce(&Self, &mut T) -> Result<R>,
    ) -> Result<R> {
        let mut value = self.take(id)?;
        let res = f(self, &mut value);
        self.put(id, value)?;
        res
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn released_handles_stay_invalid_after_reuse() {
        let mut arena = Arena::new();
        let a = arena.insert(vec![1.0f32]);
        arena.remove(a).unwrap();
        let b = arena.insert(vec![2.0f32]);

        assert_eq!(a.index, b.index);
        assert!(matches!(arena.get(a), Err(Error::StaleBuffer(_))));
        assert_eq!(arena.get(b).unwrap(), &vec![2.0]);
        assert_eq!(arena.live(), 1);
    }

    #[test]
    fn double_release_is_rejected() {
        let mut arena = Arena::new();
        let a = arena.insert(0u8);
        arena.remove(a).unwrap();
        assert!(arena.remove(a).is_err());
    }

    #[test]
    fn take_and_put_round_trip() {
        let mut arena = Arena::new();
        let a = arena.insert(vec![3.0f32, 4.0]);
        let v = arena.take(a).unwrap();
        assert!(arena.get(a).unwrap().is_empty());
        arena.put(a, v).unwrap();
        assert_eq!(arena.get(a).unwrap(), &vec![3.0, 4.0]);
    }

    #[test]
    fn failed_borrow_puts_the_value_back() {
        let mut arena = Arena::new();
        let a = arena.insert(vec![1.0f32, 2.0]);
        let gone = arena.insert(vec![0.0f32]);
        arena.remove(gone).unwrap();

        let res = arena.with_taken(a, |arena, _| arena.get(gone).map(|_| ()));
        assert!(matches!(res, Err(Error::StaleBuffer(_))));
        assert_eq!(arena.get(a).unwrap(), &vec![1.0, 2.0]);
    }
}
