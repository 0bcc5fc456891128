#![cfg(feature = "test-utils")]

mod clone_test;
mod filter_test;
mod replay_test;
mod resume_test;
mod support;
