//! Fixed-capacity history of the most recent generations.
//!
//! Logical ids are 1-based and only ever grow; `0` means "empty". The
//! physical slot of id `i` is `i % N`, so a slot is reused every `N`
//! generations while its id never is.

/// Called with a slot's old value right before the slot is overwritten.
pub type EvictHook<T> = Box<dyn FnMut(T) + Send>;

pub struct GenerationalBuffer<T, const N: usize> {
    start: u64,
    position: u64,
    storage: [Option<T>; N],
    on_evict: EvictHook<T>,
}

impl<T, const N: usize> GenerationalBuffer<T, N> {
    const NON_EMPTY: () = assert!(N >= 1, "GenerationalBuffer needs at least one slot");

    /// An empty buffer. The first [`push`](Self::push) gets id 1.
    pub fn new(on_evict: EvictHook<T>) -> Self {
        let () = Self::NON_EMPTY;
        Self {
            start: 0,
            position: 0,
            storage: std::array::from_fn(|_| None),
            on_evict,
        }
    }

    /// A buffer holding `seed` as generation `start_id`.
    ///
    /// # Panics
    ///
    /// Panics if `start_id` is 0, which is reserved for "empty".
    pub fn with_seed(start_id: u64, seed: T, on_evict: EvictHook<T>) -> Self {
        assert!(start_id > 0, "generation ids are 1-based");
        let mut buffer = Self::new(on_evict);
        buffer.start = start_id;
        buffer.position = start_id;
        let slot = buffer.slot_of(start_id);
        buffer.storage[slot] = Some(seed);
        buffer
    }

    #[inline]
    fn slot_of(&self, id: u64) -> usize {
        // N fits in usize, so the remainder does too.
        #[allow(clippy::cast_possible_truncation)]
        {
            (id % N as u64) as usize
        }
    }

    /// Append `value` as the next generation, evicting the oldest one once
    /// the buffer is full.
    pub fn push(&mut self, value: T) {
        if self.start == 0 {
            self.start = 1;
        }
        self.position += 1;
        if self.position - self.start >= N as u64 {
            self.start += 1;
        }
        let slot = self.slot_of(self.position);
        if let Some(old) = self.storage[slot].take() {
            (self.on_evict)(old);
        }
        self.storage[slot] = Some(value);
    }

    /// Relabel the oldest slot as the newest generation without touching
    /// its value or firing the eviction hook.
    ///
    /// The caller must have reset the oldest value to a state fit to serve
    /// as the current generation.
    pub fn slide(&mut self) {
        debug_assert!(self.is_full(), "slide on a buffer that is not full");
        self.start += 1;
        self.position += 1;
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.start == 0
    }

    #[inline]
    pub fn is_full(&self) -> bool {
        self.count() == N
    }

    #[inline]
    pub fn count(&self) -> usize {
        if self.is_empty() {
            return 0;
        }
        #[allow(clippy::cast_possible_truncation)]
        {
            (self.position - self.start + 1) as usize
        }
    }

    #[inline]
    pub const fn capacity(&self) -> usize {
        N
    }

    /// Id of the oldest retained generation (0 when empty).
    #[inline]
    pub fn start(&self) -> u64 {
        self.start
    }

    /// Id of the newest generation (0 when empty).
    #[inline]
    pub fn position(&self) -> u64 {
        self.position
    }

    pub fn current(&self) -> Option<&T> {
        self.previous(0)
    }

    pub fn current_mut(&mut self) -> Option<&mut T> {
        self.previous_mut(0)
    }

    /// The generation `back` steps behind the newest one.
    pub fn previous(&self, back: usize) -> Option<&T> {
        let slot = self.slot_back(back)?;
        self.storage[slot].as_ref()
    }

    pub fn previous_mut(&mut self, back: usize) -> Option<&mut T> {
        let slot = self.slot_back(back)?;
        self.storage[slot].as_mut()
    }

    fn slot_back(&self, back: usize) -> Option<usize> {
        if back >= self.count() || back >= N {
            return None;
        }
        Some(self.slot_of(self.position - back as u64))
    }

    /// The generation with logical id `id`, if it is still retained.
    pub fn by_id(&self, id: u64) -> Option<&T> {
        if self.is_empty() || id < self.start || id > self.position {
            return None;
        }
        self.storage[self.slot_of(id)].as_ref()
    }

    /// Retained generations, oldest first, with their ids.
    pub fn iter(&self) -> impl Iterator<Item = (u64, &T)> {
        let range = if self.is_empty() {
            1..=0
        } else {
            self.start..=self.position
        };
        range.filter_map(move |id| self.by_id(id).map(|value| (id, value)))
    }
}

impl<T: std::fmt::Debug, const N: usize> std::fmt::Debug for GenerationalBuffer<T, N> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GenerationalBuffer")
            .field("start", &self.start)
            .field("position", &self.position)
            .field("storage", &self.storage)
            .finish_non_exhaustive()
    }
}
