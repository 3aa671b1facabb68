use parking_lot::{Mutex, RwLock};
use std::{
    fmt,
    sync::{
        atomic::{AtomicU32, Ordering},
        Arc, Weak,
    },
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SlotIndex(u32);

impl SlotIndex {
    pub fn get(self) -> u32 {
        self.0
    }
}

impl fmt::Display for SlotIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

enum Occupancy<T> {
    Vacant,
    Reserved,
    Occupied(Weak<T>),
}

struct CellState<T> {
    generation: u32,
    occupancy: Occupancy<T>,
}

struct SlotCell<T> {
    state: RwLock<CellState<T>>,
}

impl<T> SlotCell<T> {
    fn new() -> Self {
        Self {
            state: RwLock::new(CellState {
                generation: 0,
                occupancy: Occupancy::Vacant,
            }),
        }
    }
}

type Bank<T> = Arc<[SlotCell<T>]>;

/// A long-lived handle to one cell of a [`SlotPool`].
///
/// The cell it points at never moves. Once the cell is recycled for a new
/// occupant the reservation reads back nothing.
pub struct Reservation<T> {
    index: SlotIndex,
    generation: u32,
    bank: Bank<T>,
}

impl<T> Reservation<T> {
    pub fn index(&self) -> SlotIndex {
        self.index
    }

    fn cell(&self) -> &SlotCell<T> {
        &self.bank[self.index.0 as usize % self.bank.len()]
    }

    pub fn set(&self, occupant: &Arc<T>) {
        let mut state = self.cell().state.write();
        assert_eq!(state.generation, self.generation, "slot was recycled while reserved");
        state.occupancy = Occupancy::Occupied(Arc::downgrade(occupant));
    }

    pub fn get(&self) -> Option<Arc<T>> {
        let state = self.cell().state.read();
        if state.generation != self.generation {
            return None;
        }
        match &state.occupancy {
            Occupancy::Occupied(weak) => weak.upgrade(),
            _ => None,
        }
    }

    /// Hands the cell back without ever storing an occupant; the next purge
    /// recycles it.
    fn abandon(self) {
        let mut state = self.cell().state.write();
        if state.generation == self.generation {
            state.occupancy = Occupancy::Occupied(Weak::new());
        }
    }

    #[cfg(test)]
    fn cell_ptr(&self) -> *const () {
        self.cell() as *const SlotCell<T> as *const ()
    }
}

/// A growable, thread-safe arena of weak references.
///
/// Cells are allocated in fixed size banks. Looking up a cell in an existing
/// bank only takes the bank list's read lock; adding a bank takes the write
/// lock after the read lock has been released. Banks are never moved or
/// freed while the pool is alive.
pub struct SlotPool<T> {
    granularity: usize,
    banks: RwLock<Vec<Bank<T>>>,
    next_index: AtomicU32,
    free_list: Mutex<Vec<u32>>,
    required_storage_count: AtomicU32,
}

impl<T> SlotPool<T> {
    pub fn new(granularity: usize) -> Self {
        assert!(granularity > 0, "slot pool granularity must be non-zero");
        Self {
            granularity,
            banks: RwLock::new(Vec::new()),
            next_index: AtomicU32::new(0),
            free_list: Mutex::new(Vec::new()),
            required_storage_count: AtomicU32::new(0),
        }
    }

    fn new_bank(granularity: usize) -> Bank<T> {
        (0..granularity).map(|_| SlotCell::new()).collect::<Vec<_>>().into()
    }

    fn bank_for(&self, index: u32) -> Bank<T> {
        let bank_index = index as usize / self.granularity;
        {
            let banks = self.banks.read();
            if let Some(bank) = banks.get(bank_index) {
                return Arc::clone(bank);
            }
        }
        let mut banks = self.banks.write();
        while banks.len() <= bank_index {
            banks.push(Self::new_bank(self.granularity));
        }
        Arc::clone(&banks[bank_index])
    }

    pub fn reserve(&self) -> Reservation<T> {
        let index = self
            .free_list
            .lock()
            .pop()
            .unwrap_or_else(|| self.next_index.fetch_add(1, Ordering::Relaxed));
        let bank = self.bank_for(index);
        let generation = {
            let mut state = bank[index as usize % self.granularity].state.write();
            state.generation = state.generation.wrapping_add(1);
            state.occupancy = Occupancy::Reserved;
            state.generation
        };
        Reservation {
            index: SlotIndex(index),
            generation,
            bank,
        }
    }

    /// Reserves a cell and stores a new occupant built from its index.
    pub fn try_create<E>(&self, f: impl FnOnce(SlotIndex) -> Result<T, E>) -> Result<Arc<T>, E> {
        let reservation = self.reserve();
        match f(reservation.index()) {
            Ok(value) => {
                let occupant = Arc::new(value);
                reservation.set(&occupant);
                Ok(occupant)
            }
            Err(err) => {
                reservation.abandon();
                Err(err)
            }
        }
    }

    pub fn create(&self, f: impl FnOnce(SlotIndex) -> T) -> Arc<T> {
        let reservation = self.reserve();
        let occupant = Arc::new(f(reservation.index()));
        reservation.set(&occupant);
        occupant
    }

    /// Visits every live occupant in index order.
    ///
    /// Cells whose occupant has been dropped are recycled as a side effect.
    /// Returns the number of cells recycled.
    pub fn iterate(&self, mut visitor: impl FnMut(SlotIndex, &Arc<T>)) -> usize {
        let banks: Vec<Bank<T>> = self.banks.read().clone();
        let issued = self.next_index.load(Ordering::Relaxed) as usize;
        let mut recycled = Vec::new();
        let mut required_storage_count = 0;
        for (bank_index, bank) in banks.iter().enumerate() {
            for (offset, cell) in bank.iter().enumerate() {
                let index = bank_index * self.granularity + offset;
                if index >= issued {
                    break;
                }
                let occupant = match &cell.state.read().occupancy {
                    Occupancy::Occupied(weak) => weak.upgrade().ok_or(()),
                    Occupancy::Reserved => {
                        required_storage_count = index + 1;
                        continue;
                    }
                    Occupancy::Vacant => continue,
                };
                match occupant {
                    Ok(occupant) => {
                        required_storage_count = index + 1;
                        visitor(SlotIndex(index as u32), &occupant);
                    }
                    Err(()) => {
                        let mut state = cell.state.write();
                        if let Occupancy::Occupied(weak) = &state.occupancy {
                            if weak.strong_count() == 0 {
                                state.occupancy = Occupancy::Vacant;
                                recycled.push(index as u32);
                            }
                        }
                    }
                }
            }
        }
        self.required_storage_count
            .store(required_storage_count as u32, Ordering::Relaxed);
        let recycled_count = recycled.len();
        if recycled_count != 0 {
            // reuse the lowest indices first
            let mut free_list = self.free_list.lock();
            free_list.extend(recycled.into_iter().rev());
        }
        recycled_count
    }

    pub fn collect_live(&self) -> (Vec<Arc<T>>, usize) {
        let mut live = Vec::new();
        let recycled = self.iterate(|_, occupant| live.push(Arc::clone(occupant)));
        (live, recycled)
    }

    /// One past the highest index seen live by the last [`iterate`](Self::iterate).
    pub fn required_storage_count(&self) -> usize {
        self.required_storage_count.load(Ordering::Relaxed) as usize
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rayon::prelude::*;
    use std::collections::HashSet;

    #[test]
    fn reservations_keep_their_cells_across_growth() {
        let pool = SlotPool::<u32>::new(4);
        let first: Vec<_> = (0..4).map(|_| pool.reserve()).collect();
        let ptrs: Vec<_> = first.iter().map(|r| r.cell_ptr()).collect();
        let values: Vec<_> = (0..4).map(Arc::new).collect();
        for (reservation, value) in first.iter().zip(&values) {
            reservation.set(value);
        }

        let more: Vec<_> = (0..20).map(|_| pool.reserve()).collect();
        for (reservation, ptr) in first.iter().zip(&ptrs) {
            assert_eq!(reservation.cell_ptr(), *ptr);
        }
        for (i, reservation) in first.iter().enumerate() {
            assert_eq!(reservation.get().as_deref(), Some(&(i as u32)));
        }

        let all: HashSet<_> = first.iter().chain(more.iter()).map(|r| r.cell_ptr()).collect();
        assert_eq!(all.len(), 24);
    }

    #[test]
    fn iterate_skips_dropped_occupants() {
        let pool = SlotPool::new(2);
        let a = pool.create(|_| "a");
        let b = pool.create(|_| "b");
        let c = pool.create(|_| "c");
        drop(b);

        let mut seen = Vec::new();
        let recycled = pool.iterate(|index, value| seen.push((index.get(), **value)));
        assert_eq!(seen, vec![(0, "a"), (2, "c")]);
        assert_eq!(recycled, 1);

        let mut seen_again = Vec::new();
        assert_eq!(pool.iterate(|_, value| seen_again.push(**value)), 0);
        assert_eq!(seen_again, vec!["a", "c"]);
        drop((a, c));
    }

    #[test]
    fn recycled_cells_invalidate_stale_reservations() {
        let pool = SlotPool::new(8);
        let stale = pool.reserve();
        let value = Arc::new(1);
        stale.set(&value);
        assert_eq!(stale.index().get(), 0);
        drop(value);
        pool.iterate(|_, _| {});

        let fresh = pool.reserve();
        assert_eq!(fresh.index(), stale.index());
        let replacement = Arc::new(2);
        fresh.set(&replacement);
        assert!(stale.get().is_none());
        assert_eq!(fresh.get().as_deref(), Some(&2));
    }

    #[test]
    fn live_occupants_are_never_recycled() {
        let pool = SlotPool::new(4);
        let keep: Vec<_> = (0..6).map(|i| pool.create(|_| i)).collect();
        pool.iterate(|_, _| {});
        let next = pool.create(|_| 100);
        assert_eq!(pool.collect_live().0.len(), 7);
        let indices: HashSet<_> = {
            let mut indices = HashSet::new();
            pool.iterate(|index, _| {
                indices.insert(index);
            });
            indices
        };
        assert_eq!(indices.len(), 7);
        drop((keep, next));
    }

    #[test]
    fn reserved_cells_survive_a_purge() {
        let pool = SlotPool::<u8>::new(4);
        let reservation = pool.reserve();
        assert_eq!(pool.iterate(|_, _| {}), 0);
        let value = Arc::new(7);
        reservation.set(&value);
        assert_eq!(reservation.get().as_deref(), Some(&7));
    }

    #[test]
    fn failed_creation_frees_the_cell() {
        let pool = SlotPool::<u8>::new(4);
        let result: Result<_, &str> = pool.try_create(|_| Err("no memory"));
        assert!(result.is_err());
        assert_eq!(pool.iterate(|_, _| {}), 1);
        let value = pool.try_create::<()>(|index| Ok(index.get() as u8)).unwrap();
        assert_eq!(*value, 0);
    }

    #[test]
    fn required_storage_count_tracks_highest_live_index() {
        let pool = SlotPool::new(4);
        let values: Vec<_> = (0..6).map(|i| pool.create(|_| i)).collect();
        pool.iterate(|_, _| {});
        assert_eq!(pool.required_storage_count(), 6);
        let mut values = values;
        values.truncate(3);
        pool.iterate(|_, _| {});
        assert_eq!(pool.required_storage_count(), 3);
    }

    #[test]
    fn concurrent_reservations_are_unique() {
        let pool = SlotPool::new(16);
        let occupants: Vec<_> = (0..1000).into_par_iter().map(|i| pool.create(|index| (index, i))).collect();
        let indices: HashSet<_> = occupants.iter().map(|o| o.0).collect();
        assert_eq!(indices.len(), 1000);

        let mut count = 0;
        pool.iterate(|index, occupant| {
            assert_eq!(occupant.0, index);
            count += 1;
        });
        assert_eq!(count, 1000);
    }
}
