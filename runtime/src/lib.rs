//! Drive simulated overlay nodes with a discrete-event scheduler.
//!
//! A [Scheduler] owns a single logical clock and a ready queue of actions ordered by
//! `(scheduled_time, insertion_sequence)`. Actions are closures over some world type `W`
//! (for example a simulated network) and run strictly one at a time on whichever thread
//! calls [Scheduler::run]. Other threads may hold a clone of the scheduler to enqueue work
//! or to stop the run loop.
//!
//! # Modes
//!
//! - [Mode::Virtual]: `now` is a counter that only moves when the next queued action is
//!   dequeued. An empty queue ends [Scheduler::run] immediately.
//! - [Mode::Realtime]: `now` is wall-clock time since the scheduler was created (or last
//!   [Scheduler::reset]). The run loop sleeps until the nearest deadline, and an empty queue
//!   blocks until new work arrives or a stop is requested.
//!
//! # Example
//!
//! ```rust
//! use ringsim_runtime::{Config, Scheduler, Tag, Until};
//! use std::time::Duration;
//!
//! let scheduler = Scheduler::<Vec<u64>>::new(Config::default());
//! scheduler.schedule(Duration::from_millis(150), Tag::timer("late"), |fired: &mut Vec<u64>| fired.push(150));
//! scheduler.schedule(Duration::from_millis(50), Tag::timer("early"), |fired: &mut Vec<u64>| fired.push(50));
//!
//! let mut fired = Vec::new();
//! scheduler.run(&mut fired, Until::Idle);
//! assert_eq!(fired, vec![50, 150]);
//! assert_eq!(scheduler.now(), Duration::from_millis(150));
//! ```

mod auditor;
pub use auditor::Auditor;
mod metrics;
mod scheduler;
pub use scheduler::{Action, Config, Mode, Outcome, Scheduler, Tag, Timer, Until};
