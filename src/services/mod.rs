pub mod approvals;
pub mod audit;
pub mod dispatch;
pub mod errors;
pub mod executor;
