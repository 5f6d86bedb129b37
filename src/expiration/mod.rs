//! Session expiration: per-session timers on the primary owner.
//!
//! Each node schedules timers only for the sessions it primarily owns; the
//! dispatcher routes schedule and cancel commands to the owner when the
//! caller is not it. The topology coordinator reschedules after ownership
//! moves.

pub mod dispatcher;
pub mod scheduler;

pub use dispatcher::{CommandDispatcher, PrimaryOwnerScheduler, ScheduleCommand};
pub use scheduler::ExpirationScheduler;
