// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Session layer: specifiers, the registry that caches session objects, and
//! the input/output session implementations (spec §4.6, §4.7, §4.8).

pub mod input;
pub mod output;
pub mod registry;
pub mod specifier;

pub use input::{InboundTransfer, InputGroup, InputSession};
pub use output::{OutputSession, OutputTarget};
pub use registry::SessionRegistry;
pub use specifier::{
    DataSpecifier, InputSessionSpecifier, OutputSessionSpecifier, PayloadMetadata, Role,
    SessionSpecifier,
};
