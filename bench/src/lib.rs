//! Benchmark utilities for the Quarry ECS.
//!
//! - **Microbenchmarks**: individual operations (spawn, iterate, migrate,
//!   command flush) in `benches/ecs_micro.rs`
//! - **Scenario benchmarks**: realistic frame workloads driven through the
//!   scheduler in `benches/ecs_scenarios.rs`
//!
//! # Running Benchmarks
//!
//! ```bash
//! # Run all benchmarks
//! cargo bench -p quarry_bench
//!
//! # Run a specific group
//! cargo bench -p quarry_bench -- spawn
//! ```
//!
//! Results are written to `target/criterion/` with HTML reports.

pub mod components;
