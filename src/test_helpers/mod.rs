// Test Helpers Module - shared testing infrastructure
//
// An in-process engine, fixture builders for the scenarios the integration
// suites exercise, and database setup for the Postgres suites.

pub mod fixtures;
pub mod mock_engine;
pub mod test_utils;

pub use fixtures::{
    cyclic_flow, numpy_task, sum_task, test_config, two_step_flow, TestHarness,
};
pub use mock_engine::{sub_unit_id, MockEngine};
pub use test_utils::{database_configured, get_test_database_url, setup_test_db, setup_test_store};
