// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//======================================================================================================================
// Imports
//======================================================================================================================

use ::std::time::{
    Duration,
    Instant,
};

//======================================================================================================================
// Structures
//======================================================================================================================

/// A point in time that bounds how long a blocking operation may wait. The unreachable deadline means "wait forever"
/// and is the default. Deadlines are plain values, so they can be computed once and passed through several waits.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub struct Deadline(Option<Instant>);

//======================================================================================================================
// Associate Functions
//======================================================================================================================

impl Deadline {
    /// Creates a deadline that is never reached.
    pub const fn never() -> Self {
        Self(None)
    }

    /// Creates a deadline this far from now.
    pub fn from_duration(timeout: Duration) -> Self {
        Self(Instant::now().checked_add(timeout))
    }

    /// Creates a deadline at a fixed point in time.
    pub const fn at(when: Instant) -> Self {
        Self(Some(when))
    }

    /// Checks whether this deadline can ever be reached.
    pub const fn is_reachable(&self) -> bool {
        self.0.is_some()
    }

    /// Checks whether this deadline has already passed.
    pub fn is_reached(&self) -> bool {
        match self.0 {
            Some(when) => when <= Instant::now(),
            None => false,
        }
    }

    /// Returns how much time is left until the deadline, or [`None`] for an unreachable one. Saturates at zero once
    /// the deadline has passed.
    pub fn time_left(&self) -> Option<Duration> {
        self.0.map(|when| when.saturating_duration_since(Instant::now()))
    }

    /// Returns the underlying point in time, or [`None`] for an unreachable deadline.
    pub const fn instant(&self) -> Option<Instant> {
        self.0
    }
}

//======================================================================================================================
// Trait Implementations
//======================================================================================================================

/// Default Trait Implementation for Deadlines
impl Default for Deadline {
    fn default() -> Self {
        Self::never()
    }
}

/// Conversion Trait Implementation for Deadlines
impl From<Duration> for Deadline {
    fn from(timeout: Duration) -> Self {
        Self::from_duration(timeout)
    }
}

/// Conversion Trait Implementation for Deadlines
impl From<Instant> for Deadline {
    fn from(when: Instant) -> Self {
        Self::at(when)
    }
}

//======================================================================================================================
// Unit Tests
//======================================================================================================================
