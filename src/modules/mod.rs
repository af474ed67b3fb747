//! Composite modules built from the layers in [`crate::layers`].

pub mod bidirectional;
pub mod skip_connection;

pub use bidirectional::BidirectionalLstm;
pub use skip_connection::{SkipConnectionConvModule, SkipConnectionIdentityModule};
