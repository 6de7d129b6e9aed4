// ABOUTME: Reconciliation core - change tracking, deletion scanning, transactions
// ABOUTME: JobOrchestrator sequences the phases; TransactionRunner wraps each in locks

pub mod orchestrator;
pub mod runner;
pub mod scanner;
pub mod tracker;

pub use orchestrator::{JobOrchestrator, JobPhase, RunSummary, Session};
pub use runner::{RetryPolicy, StoreMode, SyncTask, TransactionRunner};
pub use scanner::DeletionScanner;
pub use tracker::ChangeTracker;
