//! Event model
//!
//! - **`id`**: stream and event identifiers, versions, sequence numbers and positions.
//! - **`descriptor`**: unrecorded and recorded event descriptors, stream slices and summaries.
//! - **`options`**: append, read and subscribe options.
//! - **`registry`**: the explicit event type registry and the `EventConverter`.

pub mod descriptor;
pub mod id;
pub mod options;
pub mod registry;

pub use descriptor::*;
pub use id::*;
pub use options::*;
pub use registry::*;
