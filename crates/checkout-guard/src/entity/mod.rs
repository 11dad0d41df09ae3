//! Sea-ORM entities for the guard's tables

pub mod guard_lock_markers;
pub mod orders;
