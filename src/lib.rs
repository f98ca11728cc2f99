
//! Read and write Erdas Imagine HFA (.img) files.
//!
//! The format is a self-describing, tree-structured binary container.
//! Every file embeds a textual data dictionary that defines the layout
//! of its record types at runtime; the node tree references those types
//! by name. Raster layers store their pixels in fixed-size tiles,
//! optionally run length compressed, optionally spilled into a sibling
//! `.ige` file when the main file would exceed 2 GB.

#![warn(
    rust_2018_idioms,
    future_incompatible,
    unused_extern_crates,
    unused,

    missing_copy_implementations,
    missing_debug_implementations,

    clippy::all,
    clippy::pedantic,
    clippy::nursery,
    clippy::cargo,
)]

#![deny(
    unused_variables,
    unused_assignments,
    dead_code,
    unused_must_use,
    trivial_numeric_casts,
    redundant_semicolons
)]

#![forbid(unsafe_code)]

// TODO #![warn(missing_docs)]


pub mod io;

pub mod math;
pub mod error;
pub mod meta;
pub mod dictionary;
pub mod compression;
pub mod tree;
pub mod block;
pub mod spill;
pub mod file;


/// Re-exports of the types commonly required
/// for reading and writing a file.
pub mod prelude {

    // main exports
    pub use crate::file::{HfaFile, Access, CreateOptions};

    // secondary data types
    pub use crate::meta::PixelType;
    pub use crate::compression::Compression;
    pub use crate::tree::NodeRef;
    pub use crate::block::Band;
    pub use crate::dictionary::Dictionary;
    pub use crate::dictionary::field::{Extracted, FieldValue, ReqType};

    pub use crate::error::{Result, Error};
}
