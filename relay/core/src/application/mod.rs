// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Application layer: facade use-cases, the result cache and registry
//! adapter seams.

pub mod cache;
pub mod facade;
pub mod registry;

pub use cache::{CachePage, ResultCache};
pub use facade::RelayFacade;
pub use registry::{RegistryAdapter, RegistryEntry, RegistrySet, StaticRegistry};
