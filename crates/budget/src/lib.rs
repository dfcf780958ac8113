//! Per-tenant resource budgets: quota checks, atomic usage recording,
//! window resets, and advisory optimization suggestions.

pub mod controller;
pub mod windows;

pub use controller::{BudgetCheck, BudgetController, BudgetRecord, OptimizationSuggestion};
pub use windows::{next_reset, window_start};
