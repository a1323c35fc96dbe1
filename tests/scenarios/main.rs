//! Scenario tests: whole pipelines against a mock command runner

mod helpers;

mod cache_roundtrip;
mod failure_handling;
mod matrix_fanout;
mod success_chain;
