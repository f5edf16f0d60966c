pub mod dead_letter;
pub mod processor;
pub mod retry;
pub mod worker;

pub use dead_letter::{DeadLetterEntry, DeadLetterQueue};
pub use processor::{Downstream, PrimaryProcessor, ProcessingOutcome, WorkItem};
pub use retry::{RetryCoordinator, RetryPolicy};
pub use worker::WorkerPool;
