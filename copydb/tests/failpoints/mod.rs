#![cfg(all(feature = "failpoints", feature = "test-utils"))]

mod crash_resume_test;
