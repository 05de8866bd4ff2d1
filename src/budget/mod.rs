//! Per-user spending limits with in-flight reservations.

pub mod manager;

pub use manager::{
    BudgetDecision, MAX_BUDGET_RECORDS, MAX_TRACKED_USERS, ReservationGuard, SpendRecord,
    UserBudgetManager, UserBudgetStatus, WindowStatus,
};
