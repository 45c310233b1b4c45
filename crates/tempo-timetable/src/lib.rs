//! `tempo-timetable`: timeperiod trees and the state machines that drive
//! job records through them.
//!
//! A [`Timetable`] owns one [`TimeperiodTree`] per configured tree. Every
//! tree node carries the job record of one `(process, timeperiod)` pair.
//! State machines look at a job, its unit of work and its neighbours in the
//! tree (children, and counterparts in the trees it depends on) and decide
//! whether to emit a new unit of work, wait, resolve, skip or reprocess.

pub mod error;
pub mod hierarchy;
pub mod node;
pub mod publisher;
pub mod source;
pub mod state_machine;
pub mod timetable;
pub mod tree;

pub use error::{Result, TimetableError};
pub use hierarchy::{HierarchyEntry, ProcessHierarchy};
pub use node::{NodeId, NodesCompositeState, TreeNode};
pub use publisher::{ChannelPublisher, Publisher};
pub use source::{ClockSource, DataSource};
pub use state_machine::{FreerunStateMachine, Registry, StateMachine};
pub use timetable::{NodeRef, Timetable, TxContext};
pub use tree::{SkipPolicy, TimeperiodTree};
