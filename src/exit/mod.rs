// =============================================================================
// Exit Management Module
// =============================================================================
//
// The sell side of a cycle: the planner decides, the monitor executes and the
// interrupt controller can cut it short.

pub mod bailout;
pub mod monitor;
pub mod planner;
