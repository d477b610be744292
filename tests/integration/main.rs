//! Integration tests for the harvester
//!
//! These tests use wiremock to stand up a fake repository API and run the
//! fetch layer and full harvests against it end-to-end.

mod common;
mod fetch_tests;
mod harvest_tests;
