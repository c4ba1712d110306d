// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//! Task-local storage. A [`TaskLocal`] entry belongs to one task alone and dies with it. An
//! [`InheritedTaskLocal`] entry is shared: at spawn, the child snapshots the parent's inherited entries, so a
//! value set before spawning flows into every descendant while later changes stay with the task that made them.
//!
//! Entries are keyed by the address of the declaring static, so a `static` item is the only sensible way to hold
//! either type.

//======================================================================================================================
// Imports
//======================================================================================================================

use crate::runtime::{
    fail::Fail,
    sleep::current_task_or_fail,
    task::TaskContext,
};
use ::std::{
    any::Any,
    collections::HashMap,
    sync::Arc,
};

//======================================================================================================================
// Structures
//======================================================================================================================

/// Per-task storage behind [`TaskContext::locals`].
#[derive(Default)]
pub(crate) struct LocalStorage {
    /// Entries owned by this task alone.
    own: HashMap<usize, Box<dyn Any + Send>>,
    /// Entries shared with ancestors and descendants.
    inherited: HashMap<usize, Arc<dyn Any + Send + Sync>>,
}

/// Declares a task-local value. Each task sees its own copy, created on first access from `init`.
pub struct TaskLocal<T: Send + 'static> {
    init: fn() -> T,
}

/// Declares an inheritable task-local value. Children spawned after a [`Self::set`] share the value set; tasks
/// without an ancestor value get one from `init` on first access.
pub struct InheritedTaskLocal<T: Send + Sync + 'static> {
    init: fn() -> T,
}

//======================================================================================================================
// Associate Functions
//======================================================================================================================

impl LocalStorage {
    /// The storage a child task starts from: the inherited entries, shared, and nothing else.
    pub(crate) fn snapshot_inherited(&self) -> LocalStorage {
        LocalStorage {
            own: HashMap::new(),
            inherited: self.inherited.clone(),
        }
    }
}

impl<T: Send + 'static> TaskLocal<T> {
    pub const fn new(init: fn() -> T) -> Self {
        Self { init }
    }

    /// Runs `f` on the calling task's copy of the value, creating it first if this is the first access. Fails with
    /// `EPERM` outside a task.
    pub fn with<F, U>(&'static self, f: F) -> Result<U, Fail>
    where
        F: FnOnce(&mut T) -> U,
    {
        let ctx: Arc<TaskContext> = current_task_or_fail("task_local")?;
        let mut locals = ctx.locals.lock().unwrap();
        let entry: &mut Box<dyn Any + Send> = locals
            .own
            .entry(self.key())
            .or_insert_with(|| Box::new((self.init)()));
        match entry.downcast_mut::<T>() {
            Some(value) => Ok(f(value)),
            None => unreachable!("task-local entry holds a foreign type"),
        }
    }

    /// Returns a clone of the calling task's copy of the value.
    pub fn get(&'static self) -> Result<T, Fail>
    where
        T: Clone,
    {
        self.with(|value| value.clone())
    }

    /// Replaces the calling task's copy of the value.
    pub fn set(&'static self, value: T) -> Result<(), Fail> {
        self.with(move |slot| *slot = value)
    }

    fn key(&'static self) -> usize {
        self as *const Self as usize
    }
}

impl<T: Send + Sync + 'static> InheritedTaskLocal<T> {
    pub const fn new(init: fn() -> T) -> Self {
        Self { init }
    }

    /// Returns the value shared with this task, creating a fresh one if no ancestor set it. Fails with `EPERM`
    /// outside a task.
    pub fn get(&'static self) -> Result<Arc<T>, Fail> {
        let ctx: Arc<TaskContext> = current_task_or_fail("task_local")?;
        let mut locals = ctx.locals.lock().unwrap();
        let entry: &mut Arc<dyn Any + Send + Sync> = locals
            .inherited
            .entry(self.key())
            .or_insert_with(|| Arc::new((self.init)()));
        match entry.clone().downcast::<T>() {
            Ok(value) => Ok(value),
            Err(_) => unreachable!("inherited task-local entry holds a foreign type"),
        }
    }

    /// Replaces the value for this task and for children spawned from now on. Tasks already holding the old value
    /// keep it.
    pub fn set(&'static self, value: T) -> Result<(), Fail> {
        let ctx: Arc<TaskContext> = current_task_or_fail("task_local")?;
        ctx.locals.lock().unwrap().inherited.insert(self.key(), Arc::new(value));
        Ok(())
    }

    fn key(&'static self) -> usize {
        self as *const Self as usize
    }
}

//======================================================================================================================
// Unit Tests
//======================================================================================================================
