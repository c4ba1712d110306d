// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//! Task-aware synchronization primitives. All of them are thin state machines over a [`crate::runtime::wait_list`]
//! guarded by a short-lived thread lock; a task that has to wait suspends, it never blocks its worker thread.

pub mod condvar;
pub mod mutex;
pub mod semaphore;
