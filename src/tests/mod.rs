//! End-to-end scenarios driven through the public library API.

mod scenario_tests;
