// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//======================================================================================================================
// Imports
//======================================================================================================================

use crate::runtime::fail::Fail;
use ::slab::Slab;
use ::std::{
    future::Future,
    pin::Pin,
    sync::Mutex,
};

//======================================================================================================================
// Structures
//======================================================================================================================

/// The erased future driving one task.
pub type TaskFuture = Pin<Box<dyn Future<Output = ()> + Send + 'static>>;

/// One slot of the coroutine pool.
enum CoroCell {
    /// Slot claimed at spawn, future not yet installed.
    Reserved,
    /// Future parked in the pool between runs.
    Ready(TaskFuture),
    /// Future checked out by a worker.
    Active,
}

/// Fixed-capacity pool of coroutine cells, shared by every task processor of a runtime. A task occupies one cell
/// from spawn until it finishes; spawns beyond the capacity fail with EAGAIN instead of growing the pool.
pub struct CoroPool {
    cells: Mutex<Slab<CoroCell>>,
    max_size: usize,
}

//======================================================================================================================
// Associate Functions
//======================================================================================================================

impl CoroPool {
    pub fn new(max_size: usize) -> Self {
        Self {
            cells: Mutex::new(Slab::with_capacity(max_size)),
            max_size,
        }
    }

    /// Claims a cell for a task about to be spawned. Fails with EAGAIN when the pool is at capacity, so the caller
    /// can surface the exhaustion to the spawner before any task state is built.
    pub fn reserve(&self) -> Result<usize, Fail> {
        let mut cells = self.cells.lock().unwrap();
        if cells.len() >= self.max_size {
            let cause: String = format!("coroutine pool exhausted (capacity {})", self.max_size);
            warn!("reserve(): {}", &cause);
            return Err(Fail::new(libc::EAGAIN, &cause));
        }
        Ok(cells.insert(CoroCell::Reserved))
    }

    /// Installs the future of a freshly spawned task into its reserved cell.
    pub fn install(&self, slot: usize, future: TaskFuture) {
        let mut cells = self.cells.lock().unwrap();
        match ::std::mem::replace(&mut cells[slot], CoroCell::Ready(future)) {
            CoroCell::Reserved => {},
            _ => unreachable!("install() into a cell that is not reserved"),
        }
    }

    /// Checks the future out of its cell so a worker can poll it.
    pub fn take(&self, slot: usize) -> TaskFuture {
        let mut cells = self.cells.lock().unwrap();
        match ::std::mem::replace(&mut cells[slot], CoroCell::Active) {
            CoroCell::Ready(future) => future,
            _ => unreachable!("take() from a cell that holds no future"),
        }
    }

    /// Parks the future back into its cell after a poll that returned `Pending`.
    pub fn put_back(&self, slot: usize, future: TaskFuture) {
        let mut cells = self.cells.lock().unwrap();
        match ::std::mem::replace(&mut cells[slot], CoroCell::Ready(future)) {
            CoroCell::Active => {},
            _ => unreachable!("put_back() into a cell that is not checked out"),
        }
    }

    /// Frees the cell of a finished task. Dropping a never-run future here also drops the state it captured.
    pub fn release(&self, slot: usize) {
        let mut cells = self.cells.lock().unwrap();
        let _: CoroCell = cells.remove(slot);
    }

    /// Number of live coroutines.
    pub fn live(&self) -> usize {
        self.cells.lock().unwrap().len()
    }

    pub fn capacity(&self) -> usize {
        self.max_size
    }
}

//======================================================================================================================
// Unit Tests
//======================================================================================================================
