pub mod queue;
pub mod semaphore;
pub mod shutdown;
