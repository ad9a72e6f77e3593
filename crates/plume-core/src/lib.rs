//! Plume core types shared across the toolchain.

pub mod string;
